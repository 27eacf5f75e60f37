use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub severity: Severity,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Success,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
        }
    }
}

/// Toast layer seam. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Success => tracing::info!(message = %notice.message, "notice"),
            Severity::Error => tracing::warn!(message = %notice.message, "error notice"),
        }
    }
}

/// Buffers notices until drained; the CLI prints them after each command.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notice> {
        let mut notices = self.notices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *notices)
    }

    pub fn messages(&self) -> Vec<String> {
        let notices = self.notices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        notices.iter().map(|notice| notice.message.clone()).collect()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notice: Notice) {
        tracing::debug!(message = %notice.message, severity = ?notice.severity, "notice buffered");
        let mut notices = self.notices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        notices.push(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_notifier_drains_in_order() {
        let notifier = MemoryNotifier::new();
        notifier.notify(Notice::success("Timer started"));
        notifier.notify(Notice::error("Failed to save"));
        assert_eq!(notifier.messages(), vec!["Timer started", "Failed to save"]);

        let drained = notifier.drain();
        assert_eq!(drained[1].severity, Severity::Error);
        assert!(notifier.drain().is_empty());
    }

    #[test]
    fn tracing_notifier_accepts_both_severities() {
        let notifier: &dyn Notifier = &TracingNotifier;
        notifier.notify(Notice::success("saved"));
        notifier.notify(Notice::error("failed"));
    }
}
