use crate::clock::Clock;
use crate::config::Settings;
use crate::errors::AppResult;
use crate::models::{
    Note, NoteInfo, NotePatch, Task, TaskForm, TaskPatch, TaskStatus, TimeEntry, Timer, TimerPatch,
};
use crate::notes;
use crate::notify::{Notice, Notifier};
use crate::storage::StorageEngine;
use crate::tasks;
use crate::timer::TimerCoordinator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::time::Duration;

/// Transient indicator of the last write, shown instead of a blocking dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    Error(String),
}

/// The storage API consumed by front-ends: one document, one write queue, one timer
/// coordinator. Operations on unknown ids are no-ops reported through `bool`/`Option`.
pub struct StoreHandle {
    engine: StorageEngine,
    timers: TimerCoordinator,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    save_status: RwLock<SaveStatus>,
    sweep_interval: Duration,
}

impl StoreHandle {
    /// Must be called from inside a tokio runtime.
    pub fn open(
        settings: &Settings,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> AppResult<Arc<Self>> {
        let engine = StorageEngine::from_settings(settings)?;
        let timers = TimerCoordinator::new(
            engine.clone(),
            Arc::clone(&clock),
            Arc::clone(&notifier),
            settings.timer_states_path(),
            settings.tick_interval(),
        );
        tracing::info!(path = %engine.path().display(), "opened notes store");
        Ok(Arc::new(Self {
            engine,
            timers,
            clock,
            notifier,
            save_status: RwLock::new(SaveStatus::Idle),
            sweep_interval: settings.sweep_interval(),
        }))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn save_status(&self) -> SaveStatus {
        self.save_status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Opens `note_id` (if any), then reconciles timers left behind by a previous process.
    pub async fn recover(&self, open_note: Option<&str>) -> AppResult<usize> {
        if let Some(note_id) = open_note {
            self.timers.open_note(note_id).await?;
        }
        let restored = self.timers.restore_timer_states().await?;
        if restored > 0 {
            tracing::info!(restored, "recovered timers on startup");
        }
        Ok(restored)
    }

    pub fn spawn_sweep(&self) {
        self.timers.spawn_persistence_sweep(self.sweep_interval);
    }

    /// Persists running timers to the side channel and stops every background task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.timers.shutdown().await
    }

    /// Stops background tasks only. Running timers keep running in storage.
    pub fn detach(&self) {
        self.timers.detach();
    }

    pub async fn get_notes(&self) -> Vec<Note> {
        notes::list_notes(&self.engine).await
    }

    pub async fn get_trash(&self) -> Vec<Note> {
        notes::list_trash(&self.engine).await
    }

    pub async fn get_note(&self, note_id: &str) -> Option<Note> {
        notes::get_note(&self.engine, note_id).await
    }

    pub async fn save_note(&self, note: Note) -> AppResult<()> {
        self.tracked(notes::save_note(&self.engine, note)).await
    }

    pub async fn create_note(
        &self,
        title: Option<String>,
        content: Option<String>,
    ) -> AppResult<Note> {
        self.tracked(notes::create_note(&self.engine, title, content, self.clock.now()))
            .await
    }

    pub async fn update_note(&self, note_id: &str, patch: NotePatch) -> AppResult<bool> {
        self.tracked(notes::update_note(&self.engine, note_id, patch, self.clock.now()))
            .await
    }

    /// Soft-deletes the note and tears down its tickers. Unflushed session time is lost.
    pub async fn delete_note(&self, note_id: &str) -> AppResult<bool> {
        self.timers.cleanup_note_timers(note_id);
        let trashed = self
            .tracked(notes::delete_note(&self.engine, note_id, self.clock.now()))
            .await?;
        Ok(trashed.is_some())
    }

    pub async fn restore_note(&self, note_id: &str) -> AppResult<bool> {
        self.tracked(notes::restore_note(&self.engine, note_id)).await
    }

    pub async fn permanently_delete_note(&self, note_id: &str) -> AppResult<bool> {
        self.tracked(notes::permanently_delete_note(&self.engine, note_id)).await
    }

    pub async fn empty_trash(&self) -> AppResult<usize> {
        self.tracked(notes::empty_trash(&self.engine)).await
    }

    pub async fn duplicate_note(&self, note_id: &str) -> AppResult<Option<Note>> {
        self.tracked(notes::duplicate_note(&self.engine, note_id, self.clock.now()))
            .await
    }

    pub async fn note_info(&self, note_id: &str) -> Option<NoteInfo> {
        notes::note_info(&self.engine, note_id).await
    }

    pub async fn initialize_note_tasks(&self, note_id: &str) -> AppResult<bool> {
        self.tracked(tasks::initialize_tasks(&self.engine, note_id)).await
    }

    pub async fn get_note_tasks(&self, note_id: &str) -> Vec<Task> {
        tasks::list_tasks(&self.engine, note_id).await
    }

    pub async fn get_note_task(&self, note_id: &str, task_id: &str) -> Option<Task> {
        tasks::get_task(&self.engine, note_id, task_id).await
    }

    pub async fn save_note_task(&self, note_id: &str, task: Task) -> AppResult<bool> {
        self.tracked(tasks::save_task(&self.engine, note_id, task)).await
    }

    pub async fn create_note_task(
        &self,
        note_id: &str,
        form: &TaskForm,
    ) -> AppResult<Option<Task>> {
        self.tracked(tasks::create_task(&self.engine, note_id, form, self.clock.now()))
            .await
    }

    pub async fn edit_note_task(
        &self,
        note_id: &str,
        task_id: &str,
        form: TaskForm,
    ) -> AppResult<Option<Task>> {
        let now = self.clock.now();
        self.tracked(tasks::edit_task(&self.engine, note_id, task_id, form, now))
            .await
    }

    pub async fn update_note_task(
        &self,
        note_id: &str,
        task_id: &str,
        patch: TaskPatch,
    ) -> AppResult<bool> {
        self.tracked(tasks::update_task(&self.engine, note_id, task_id, patch)).await
    }

    pub async fn delete_note_task(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        self.timers.cancel_task_timer(task_id);
        self.tracked(tasks::delete_task(&self.engine, note_id, task_id)).await
    }

    /// Raw timer merge. A patch that stops the timer also stops its ticker.
    pub async fn update_note_task_timer(
        &self,
        note_id: &str,
        task_id: &str,
        patch: TimerPatch,
    ) -> AppResult<Option<Timer>> {
        if patch.is_running == Some(false) {
            self.timers.cancel_task_timer(task_id);
        }
        self.tracked(tasks::update_task_timer(&self.engine, note_id, task_id, patch))
            .await
    }

    /// Returns the task's new `totalWorkedTime`.
    pub async fn add_note_task_manual_time(
        &self,
        note_id: &str,
        task_id: &str,
        entry: TimeEntry,
    ) -> AppResult<Option<u64>> {
        self.tracked(tasks::add_manual_time(&self.engine, note_id, task_id, entry))
            .await
    }

    pub async fn update_status(
        &self,
        note_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> AppResult<bool> {
        self.tracked(self.timers.update_status(note_id, task_id, status)).await
    }

    /// Starts the task's timer; every other running timer is paused first.
    pub async fn start_task_timer(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        self.tracked(self.timers.start(note_id, task_id)).await
    }

    pub async fn pause_task_timer(&self, note_id: &str, task_id: &str) -> AppResult<Option<Timer>> {
        self.tracked(self.timers.pause(note_id, task_id)).await
    }

    pub async fn toggle_task_timer(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        self.tracked(self.timers.toggle(note_id, task_id)).await
    }

    pub async fn reset_task_timer(&self, note_id: &str, task_id: &str) -> AppResult<Option<Timer>> {
        self.tracked(self.timers.reset(note_id, task_id)).await
    }

    pub async fn toggle_task_expanded(
        &self,
        note_id: &str,
        task_id: &str,
    ) -> AppResult<Option<bool>> {
        self.tracked(tasks::toggle_expanded(&self.engine, note_id, task_id)).await
    }

    async fn tracked<T>(&self, operation: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        self.set_save_status(SaveStatus::Saving);
        let result = operation.await;
        match &result {
            Ok(_) => self.set_save_status(SaveStatus::Saved),
            Err(error) => {
                self.set_save_status(SaveStatus::Error(error.to_string()));
                if error.is_persistence() {
                    self.notifier.notify(Notice::error(format!("Failed to save: {error}")));
                } else {
                    self.notifier.notify(Notice::error(error.to_string()));
                }
            }
        }
        result
    }

    fn set_save_status(&self, status: SaveStatus) {
        *self.save_status.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::{MemoryNotifier, Severity};
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;

    fn open_in(dir: &Path) -> (Arc<StoreHandle>, Arc<ManualClock>, Arc<MemoryNotifier>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).single().expect("start"),
        ));
        let notifier = Arc::new(MemoryNotifier::new());
        let handle = StoreHandle::open(&Settings::in_dir(dir), clock.clone(), notifier.clone())
            .expect("open handle");
        (handle, clock, notifier)
    }

    fn form(title: &str) -> TaskForm {
        TaskForm {
            title: title.to_string(),
            description: String::new(),
            hours: 0,
            minutes: 30,
        }
    }

    #[tokio::test]
    async fn save_status_follows_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, _, _) = open_in(dir.path());
        assert_eq!(handle.save_status(), SaveStatus::Idle);

        handle.create_note(Some("A".to_string()), None).await.expect("create");
        assert_eq!(handle.save_status(), SaveStatus::Saved);
        assert!(dir.path().join("deepnote-notes.json").exists());
    }

    #[tokio::test]
    async fn failed_write_surfaces_error_status_and_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, _, notifier) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        notifier.drain();

        fs::create_dir(dir.path().join("deepnote-notes.json.tmp")).expect("block temp path");
        let patch = NotePatch {
            content: Some("lost".to_string()),
            ..NotePatch::default()
        };
        let error = handle.update_note(&note.id, patch).await.expect_err("write fails");
        assert!(error.is_persistence());
        assert!(matches!(handle.save_status(), SaveStatus::Error(_)));

        let notices = notifier.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Error);
        assert!(notices[0].message.starts_with("Failed to save"));

        // The store stays usable with the last good document.
        assert_eq!(handle.get_notes().await.len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_note_tears_down_its_timers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, clock, _) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        let task = handle
            .create_note_task(&note.id, &form("t"))
            .await
            .expect("create task")
            .expect("note exists");
        handle.start_task_timer(&note.id, &task.id).await.expect("start");
        clock.advance_secs(25);

        assert!(handle.delete_note(&note.id).await.expect("delete"));
        assert!(handle.timers.active_task_ids().is_empty());
        let trashed = handle.get_trash().await;
        let timer = &trashed[0].tasks.as_ref().expect("tasks")[0].timer;
        assert!(!timer.is_running);
        assert_eq!(timer.total_worked_time, 0);
    }

    #[tokio::test]
    async fn failed_timer_write_surfaces_error_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, _, notifier) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        let task = handle
            .create_note_task(&note.id, &form("t"))
            .await
            .expect("create task")
            .expect("note exists");
        notifier.drain();

        fs::create_dir(dir.path().join("deepnote-notes.json.tmp")).expect("block temp path");
        let error = handle
            .start_task_timer(&note.id, &task.id)
            .await
            .expect_err("write fails");
        assert!(error.is_persistence());
        assert!(matches!(handle.save_status(), SaveStatus::Error(_)));
        let notices = notifier.drain();
        assert!(notices.iter().any(|notice| {
            notice.severity == Severity::Error && notice.message.starts_with("Failed to save")
        }));

        fs::remove_dir(dir.path().join("deepnote-notes.json.tmp")).expect("unblock temp path");
        assert!(handle.toggle_task_timer(&note.id, &task.id).await.expect("toggle on"));
        assert_eq!(handle.save_status(), SaveStatus::Saved);
        let reset = handle
            .reset_task_timer(&note.id, &task.id)
            .await
            .expect("reset")
            .expect("task exists");
        assert!(!reset.is_running);
        assert_eq!(handle.pause_task_timer(&note.id, &task.id).await.expect("pause"), None);
    }

    #[tokio::test]
    async fn shutdown_records_running_timers_and_stops_the_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, clock, _) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        let task = handle
            .create_note_task(&note.id, &form("t"))
            .await
            .expect("create task")
            .expect("note exists");
        handle.start_task_timer(&note.id, &task.id).await.expect("start");
        handle.spawn_sweep();
        clock.advance_secs(15);

        handle.shutdown().await.expect("shutdown");
        assert!(handle.timers.active_task_ids().is_empty());
        let states_path = dir.path().join("timer-states.json");
        let raw = fs::read_to_string(&states_path).expect("states");
        assert!(raw.contains(&task.id));

        assert_eq!(handle.recover(None).await.expect("recover"), 1);
        let timer = handle.get_note_task(&note.id, &task.id).await.expect("task").timer;
        assert!(!timer.is_running);
        assert_eq!(timer.total_worked_time, 15);
        assert!(!states_path.exists());
    }

    #[tokio::test]
    async fn deleting_a_task_cancels_its_ticker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, _, _) = open_in(dir.path());
        let note = handle.create_note(None, Some("body".to_string())).await.expect("create");
        let task = handle
            .create_note_task(&note.id, &form("t"))
            .await
            .expect("create task")
            .expect("note exists");
        handle.start_task_timer(&note.id, &task.id).await.expect("start");

        assert!(handle.delete_note_task(&note.id, &task.id).await.expect("delete task"));
        assert!(handle.timers.active_task_ids().is_empty());
        assert!(handle.get_note_tasks(&note.id).await.is_empty());
    }

    #[tokio::test]
    async fn stopping_patch_drops_ticker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, clock, _) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        let task = handle
            .create_note_task(&note.id, &form("t"))
            .await
            .expect("create task")
            .expect("note exists");
        handle.start_task_timer(&note.id, &task.id).await.expect("start");

        let timer = handle
            .update_note_task_timer(&note.id, &task.id, TimerPatch::paused(7, 7, clock.now()))
            .await
            .expect("patch")
            .expect("task exists");
        assert!(!timer.is_running);
        assert!(handle.timers.display(&task.id).is_none());
    }

    #[tokio::test]
    async fn invalid_task_form_is_reported_without_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, _, notifier) = open_in(dir.path());
        let note = handle.create_note(Some("A".to_string()), None).await.expect("create");
        notifier.drain();

        let error = handle.create_note_task(&note.id, &form("  ")).await.expect_err("blank title");
        assert!(!error.is_persistence());
        assert_eq!(notifier.drain()[0].severity, Severity::Error);
        assert!(handle.get_note_tasks(&note.id).await.is_empty());
    }
}
