use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Root persisted object: every live note plus the soft-deleted ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "null_as_default")]
    pub notes: Vec<Note>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub trash: Vec<Note>,
}

impl Document {
    pub fn note(&self, note_id: &str) -> Option<&Note> {
        self.notes.iter().find(|note| note.id == note_id)
    }

    pub fn note_mut(&mut self, note_id: &str) -> Option<&mut Note> {
        self.notes.iter_mut().find(|note| note.id == note_id)
    }

    pub fn task_mut(&mut self, note_id: &str, task_id: &str) -> Option<&mut Task> {
        self.note_mut(note_id)?
            .tasks
            .as_mut()?
            .iter_mut()
            .find(|task| task.id == task_id)
    }

    /// Every `(note id, task)` pair whose timer is marked running, across all live notes.
    pub fn running_tasks(&self) -> Vec<(String, &Task)> {
        self.notes
            .iter()
            .flat_map(|note| {
                note.tasks
                    .iter()
                    .flatten()
                    .filter(|task| task.timer.is_running)
                    .map(move |task| (note.id.clone(), task))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
    /// Fields written by other clients; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Note {
    pub fn new(title: Option<String>, content: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            title,
            content,
            created: now,
            updated: now,
            deleted_at: None,
            tasks: None,
            extra: Map::new(),
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.as_ref()?.iter().find(|task| task.id == task_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Backlog,
    Progress,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Progress => "progress",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "progress" | "in-progress" => Some(Self::Progress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// Toast text shown after a status move.
    pub fn transition_message(self) -> &'static str {
        match self {
            Self::Backlog => "Task moved to backlog",
            Self::Progress => "Task in progress",
            Self::Done => "Task completed!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub estimated_time: u64,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub is_expanded: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub timer: Timer,
    #[serde(default, deserialize_with = "null_as_default")]
    pub manual_time_entries: Vec<TimeEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// A fresh backlog task with a zeroed timer.
    pub fn new(form: &TaskForm, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            title: form.title.trim().to_string(),
            description: form.normalized_description(),
            estimated_time: form.estimated_seconds().unwrap_or_default(),
            status: TaskStatus::Backlog,
            is_expanded: false,
            created: now,
            updated: now,
            timer: Timer::default(),
            manual_time_entries: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn manual_minutes(&self) -> u64 {
        self.manual_time_entries
            .iter()
            .fold(0u64, |sum, entry| sum.saturating_add(entry.minutes))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    #[serde(default)]
    pub is_running: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub current_session_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worked_time: u64,
    #[serde(default)]
    pub total_worked_time: u64,
    #[serde(default)]
    pub paused_time: u64,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub last_update: Option<DateTime<Utc>>,
}

impl Timer {
    /// Whole seconds since the current session began; zero when stopped.
    pub fn session_elapsed(&self, now: DateTime<Utc>) -> u64 {
        match (self.is_running, self.current_session_start) {
            (true, Some(start)) => elapsed_seconds(start, now),
            _ => 0,
        }
    }

    /// Authoritative total plus whatever the running session has accrued so far.
    pub fn live_total(&self, now: DateTime<Utc>) -> u64 {
        self.total_worked_time.saturating_add(self.session_elapsed(now))
    }

    /// Adds session seconds to both counters without wrapping.
    pub fn accrue(&mut self, seconds: u64) {
        self.worked_time = self.worked_time.saturating_add(seconds);
        self.total_worked_time = self.total_worked_time.saturating_add(seconds);
    }

    /// Stops the timer and drops the unflushed part of the session.
    pub fn cancel_session(&mut self, now: DateTime<Utc>) {
        self.is_running = false;
        self.current_session_start = None;
        self.last_update = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub minutes: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl TimeEntry {
    pub fn new(minutes: u64, description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            minutes,
            description: description.into(),
            timestamp: now,
        }
    }

    /// `None` when the entry is too large to count in seconds.
    pub fn seconds(&self) -> Option<u64> {
        self.minutes.checked_mul(60)
    }
}

/// Shallow note patch: every `Some` field overwrites, the rest is preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub updated: Option<DateTime<Utc>>,
    pub tasks: Option<Vec<Task>>,
    /// Fields this crate does not model. Merged key by key.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotePatch {
    pub fn apply(self, note: &mut Note, now: DateTime<Utc>) {
        note.extra.extend(self.extra);
        if let Some(title) = self.title {
            note.title = Some(title);
        }
        if let Some(content) = self.content {
            note.content = Some(content);
        }
        if let Some(tasks) = self.tasks {
            note.tasks = Some(tasks);
        }
        note.updated = self.updated.unwrap_or(now);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub estimated_time: Option<u64>,
    pub status: Option<TaskStatus>,
    pub is_expanded: Option<bool>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub updated: Option<DateTime<Utc>>,
    pub timer: Option<Timer>,
    pub manual_time_entries: Option<Vec<TimeEntry>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            updated: Some(now),
            ..Self::default()
        }
    }

    pub fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = Some(description);
        }
        if let Some(estimated_time) = self.estimated_time {
            task.estimated_time = estimated_time;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(is_expanded) = self.is_expanded {
            task.is_expanded = is_expanded;
        }
        if let Some(updated) = self.updated {
            task.updated = updated;
        }
        if let Some(timer) = self.timer {
            task.timer = timer;
        }
        if let Some(entries) = self.manual_time_entries {
            task.manual_time_entries = entries;
        }
    }
}

/// Shallow merge into a task's timer. `current_session_start: Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerPatch {
    pub is_running: Option<bool>,
    pub current_session_start: Option<Option<DateTime<Utc>>>,
    pub worked_time: Option<u64>,
    pub total_worked_time: Option<u64>,
    pub paused_time: Option<u64>,
    pub last_update: Option<DateTime<Utc>>,
}

impl TimerPatch {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            is_running: Some(true),
            current_session_start: Some(Some(now)),
            last_update: Some(now),
            ..Self::default()
        }
    }

    pub fn paused(worked_time: u64, total_worked_time: u64, now: DateTime<Utc>) -> Self {
        Self {
            is_running: Some(false),
            current_session_start: Some(None),
            worked_time: Some(worked_time),
            total_worked_time: Some(total_worked_time),
            last_update: Some(now),
            ..Self::default()
        }
    }

    pub fn reset(now: DateTime<Utc>) -> Self {
        Self {
            is_running: Some(false),
            current_session_start: Some(None),
            worked_time: Some(0),
            total_worked_time: Some(0),
            paused_time: Some(0),
            last_update: Some(now),
        }
    }

    pub fn apply(self, timer: &mut Timer) {
        if let Some(is_running) = self.is_running {
            timer.is_running = is_running;
        }
        if let Some(start) = self.current_session_start {
            timer.current_session_start = start;
        }
        if let Some(worked_time) = self.worked_time {
            timer.worked_time = worked_time;
        }
        if let Some(total_worked_time) = self.total_worked_time {
            timer.total_worked_time = total_worked_time;
        }
        if let Some(paused_time) = self.paused_time {
            timer.paused_time = paused_time;
        }
        if let Some(last_update) = self.last_update {
            timer.last_update = Some(last_update);
        }
    }
}

/// Fields editable from the task form. Everything else on a task survives an edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskForm {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub minutes: u64,
}

impl TaskForm {
    /// `None` when the estimate overflows.
    pub fn estimated_seconds(&self) -> Option<u64> {
        self.hours
            .checked_mul(60)
            .and_then(|minutes| minutes.checked_add(self.minutes))
            .and_then(|minutes| minutes.checked_mul(60))
    }

    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty() && self.estimated_seconds().is_some_and(|seconds| seconds > 0)
    }

    fn normalized_description(&self) -> Option<String> {
        let trimmed = self.description.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn into_patch(self, now: DateTime<Utc>) -> TaskPatch {
        TaskPatch {
            title: Some(self.title.trim().to_string()),
            description: Some(self.description.trim().to_string()),
            estimated_time: self.estimated_seconds(),
            updated: Some(now),
            ..TaskPatch::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteInfo {
    pub id: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub word_count: usize,
    pub char_count: usize,
    pub task_count: usize,
}

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from(now.signed_duration_since(start).num_seconds()).unwrap_or(0)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_parses_permissively() {
        let document: Document = serde_json::from_str(r#"{"notes": null}"#).expect("parse");
        assert!(document.notes.is_empty());
        assert!(document.trash.is_empty());

        let document: Document = serde_json::from_str("{}").expect("parse empty object");
        assert_eq!(document, Document::default());
    }

    #[test]
    fn note_keeps_millisecond_timestamps_and_unknown_fields() {
        let raw = r#"{
            "id": "abc",
            "title": "A",
            "content": "hello",
            "created": 1700000000123,
            "updated": 1700000000456,
            "pinned": true
        }"#;
        let note: Note = serde_json::from_str(raw).expect("parse note");
        assert_eq!(note.created.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(note.extra.get("pinned"), Some(&Value::Bool(true)));

        let value = serde_json::to_value(&note).expect("serialize");
        assert_eq!(value["updated"], 1_700_000_000_456_i64);
        assert_eq!(value["pinned"], true);
        assert!(value.get("deletedAt").is_none());
    }

    #[test]
    fn legacy_task_without_timer_gets_zeroed_defaults() {
        let raw = r#"{"id": "t1", "title": "Write", "status": "progress"}"#;
        let task: Task = serde_json::from_str(raw).expect("parse task");
        assert_eq!(task.status, TaskStatus::Progress);
        assert_eq!(task.timer, Timer::default());
        assert!(task.manual_time_entries.is_empty());
    }

    #[test]
    fn session_elapsed_floors_to_whole_seconds() {
        let start = Utc.timestamp_millis_opt(1_000).single().expect("start");
        let now = Utc.timestamp_millis_opt(66_999).single().expect("now");
        let timer = Timer {
            is_running: true,
            current_session_start: Some(start),
            total_worked_time: 10,
            ..Timer::default()
        };
        assert_eq!(timer.session_elapsed(now), 65);
        assert_eq!(timer.live_total(now), 75);
        assert_eq!(Timer::default().session_elapsed(now), 0);
    }

    #[test]
    fn timer_patch_clears_session_start() {
        let now = Utc.timestamp_millis_opt(5_000).single().expect("now");
        let mut timer = Timer::default();
        TimerPatch::started(now).apply(&mut timer);
        assert!(timer.is_running);
        assert_eq!(timer.current_session_start, Some(now));

        TimerPatch::paused(3, 4, now).apply(&mut timer);
        assert!(!timer.is_running);
        assert!(timer.current_session_start.is_none());
        assert_eq!(timer.total_worked_time, 4);
    }

    #[test]
    fn task_form_validation_requires_title_and_estimate() {
        let mut form = TaskForm {
            title: "  ".to_string(),
            description: String::new(),
            hours: 1,
            minutes: 30,
        };
        assert!(!form.is_valid());
        form.title = "Plan".to_string();
        assert!(form.is_valid());
        assert_eq!(form.estimated_seconds(), Some(5_400));
        form.hours = 0;
        form.minutes = 0;
        assert!(!form.is_valid());
    }

    #[test]
    fn note_patch_merges_unmodelled_fields() {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("created");
        let mut note = Note::new(Some("Plan".to_string()), Some("body".to_string()), created);
        note.extra.insert("color".to_string(), Value::from("blue"));
        note.extra.insert("pinned".to_string(), Value::from(false));

        let patch: NotePatch = serde_json::from_value(serde_json::json!({
            "title": "Plan v2",
            "pinned": true,
        }))
        .expect("patch");
        let now = created + chrono::Duration::seconds(5);
        patch.apply(&mut note, now);

        assert_eq!(note.title.as_deref(), Some("Plan v2"));
        assert_eq!(note.content.as_deref(), Some("body"));
        assert_eq!(note.extra.get("pinned"), Some(&Value::from(true)));
        assert_eq!(note.extra.get("color"), Some(&Value::from("blue")));
        assert_eq!(note.updated, now);
    }

    #[test]
    fn oversized_estimates_and_entries_do_not_overflow() {
        let form = TaskForm {
            title: "Forever".to_string(),
            description: String::new(),
            hours: u64::MAX / 100,
            minutes: 0,
        };
        assert_eq!(form.estimated_seconds(), None);
        assert!(!form.is_valid());

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("now");
        assert_eq!(TimeEntry::new(u64::MAX / 30, "", now).seconds(), None);
        assert_eq!(TimeEntry::new(2, "", now).seconds(), Some(120));
    }
}
