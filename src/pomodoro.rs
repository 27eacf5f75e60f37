use crate::notify::{Notice, Notifier};
use serde::Serialize;
use tokio::time::{Duration, MissedTickBehavior};

pub const FOCUS_SECONDS: u32 = 25 * 60;
pub const BREAK_SECONDS: u32 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Focus,
    Break,
}

impl Phase {
    pub fn seconds(self) -> u32 {
        match self {
            Self::Focus => FOCUS_SECONDS,
            Self::Break => BREAK_SECONDS,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::Focus => Self::Break,
            Self::Break => Self::Focus,
        }
    }

    fn completion_message(self) -> &'static str {
        match self {
            Self::Focus => "Pomodoro complete! Time for a break.",
            Self::Break => "Break over! Time to focus.",
        }
    }
}

/// Countdown that alternates focus and break phases. Each finished phase stops the
/// countdown; the next phase waits for `toggle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pomodoro {
    phase: Phase,
    remaining: u32,
    running: bool,
}

impl Default for Pomodoro {
    fn default() -> Self {
        Self::new()
    }
}

impl Pomodoro {
    pub fn new() -> Self {
        Self {
            phase: Phase::Focus,
            remaining: FOCUS_SECONDS,
            running: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts or pauses the countdown. Returns the new running state.
    pub fn toggle(&mut self) -> bool {
        self.running = !self.running;
        self.running
    }

    /// One second of countdown. Returns the phase that just finished, if any.
    pub fn tick(&mut self) -> Option<Phase> {
        if !self.running {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return None;
        }
        let finished = self.phase;
        self.phase = finished.next();
        self.remaining = self.phase.seconds();
        self.running = false;
        Some(finished)
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.phase.seconds();
        f64::from(total - self.remaining.min(total)) / f64::from(total) * 100.0
    }

    /// `MM:SS`.
    pub fn display(&self) -> String {
        format!("{:02}:{:02}", self.remaining / 60, self.remaining % 60)
    }
}

/// Runs `cycles` phases back to back, one countdown step per `step`, announcing each
/// finished phase.
pub async fn run_cycles(cycles: u32, step: Duration, notifier: &dyn Notifier) -> Pomodoro {
    let mut pomodoro = Pomodoro::new();
    let mut ticks = tokio::time::interval(step);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Burst);
    ticks.tick().await;

    for cycle in 0..cycles {
        pomodoro.toggle();
        tracing::info!(cycle, phase = ?pomodoro.phase(), "pomodoro phase started");
        loop {
            ticks.tick().await;
            if let Some(finished) = pomodoro.tick() {
                notifier.notify(Notice::success(finished.completion_message()));
                break;
            }
        }
    }
    pomodoro
}
