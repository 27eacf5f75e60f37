use crate::clock::Clock;
use crate::errors::{AppError, AppResult};
use crate::models::{elapsed_seconds, TaskStatus, Timer, TimerPatch};
use crate::notify::{Notice, Notifier};
use crate::storage::{write_json_atomic, StorageEngine};
use crate::tasks::{self, format_duration, progress_percent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

/// What a running timer shows between pauses. Recomputed from the wall clock on every
/// tick, so a missed tick never loses time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDisplay {
    pub note_id: String,
    pub task_id: String,
    pub elapsed: u64,
    pub estimated: u64,
    pub progress: f64,
    pub label: String,
}

impl TimerDisplay {
    fn compute(
        note_id: &str,
        task_id: &str,
        base_total: u64,
        started_at: DateTime<Utc>,
        estimated: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let elapsed = base_total.saturating_add(elapsed_seconds(started_at, now));
        Self {
            note_id: note_id.to_string(),
            task_id: task_id.to_string(),
            elapsed,
            estimated,
            progress: progress_percent(elapsed, estimated),
            label: format!("{} / {}", format_duration(elapsed), format_duration(estimated)),
        }
    }
}

/// Side-channel record of a running timer, written periodically and on shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTimerState {
    pub note_id: String,
    pub is_running: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub worked_time: u64,
}

type PersistedTimerStates = BTreeMap<String, PersistedTimerState>;

/// Ticking display for one running task. Dropping it stops the ticker.
struct TimerSession {
    note_id: String,
    ticker: JoinHandle<()>,
    display: watch::Receiver<TimerDisplay>,
}

impl Drop for TimerSession {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

#[derive(Clone)]
pub struct TimerCoordinator {
    engine: StorageEngine,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    sessions: Arc<Mutex<HashMap<String, TimerSession>>>,
    current_note: Arc<RwLock<Option<String>>>,
    op_lock: Arc<AsyncMutex<()>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    states_path: PathBuf,
    tick_interval: Duration,
}

impl TimerCoordinator {
    pub fn new(
        engine: StorageEngine,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        states_path: PathBuf,
        tick_interval: Duration,
    ) -> Self {
        Self {
            engine,
            clock,
            notifier,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            current_note: Arc::new(RwLock::new(None)),
            op_lock: Arc::new(AsyncMutex::new(())),
            sweeper: Arc::new(Mutex::new(None)),
            states_path,
            tick_interval,
        }
    }

    pub fn current_note(&self) -> Option<String> {
        self.current_note
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Makes `note_id` the open note, ensures it has a task list and resumes the display
    /// of any timer already running in it.
    pub async fn open_note(&self, note_id: &str) -> AppResult<()> {
        *self.lock_current_note() = Some(note_id.to_string());
        tasks::initialize_tasks(&self.engine, note_id).await?;

        let document = self.engine.read().await;
        if let Some(note) = document.note(note_id) {
            for task in note.tasks.iter().flatten().filter(|task| task.timer.is_running) {
                if !self.has_session(&task.id) {
                    if let Some(started_at) = task.timer.current_session_start {
                        self.spawn_session(
                            note_id,
                            &task.id,
                            task.timer.total_worked_time,
                            started_at,
                            task.estimated_time,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn close_note(&self) {
        *self.lock_current_note() = None;
    }

    /// Starts the task's timer after pausing every other running timer in the document.
    /// A backlog task moves to progress. Returns `false` when the task is unknown.
    pub async fn start(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        let _op = self.op_lock.lock().await;
        self.start_locked(note_id, task_id).await
    }

    /// Pauses the task's timer, folding the session into both worked counters.
    pub async fn pause(&self, note_id: &str, task_id: &str) -> AppResult<Option<Timer>> {
        let _op = self.op_lock.lock().await;
        self.pause_locked(note_id, task_id).await
    }

    pub async fn toggle(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        let _op = self.op_lock.lock().await;
        let Some(task) = tasks::get_task(&self.engine, note_id, task_id).await else {
            return Ok(false);
        };
        if task.timer.is_running {
            self.pause_locked(note_id, task_id).await?;
        } else {
            self.start_locked(note_id, task_id).await?;
        }
        Ok(true)
    }

    pub async fn pause_all(&self) -> AppResult<usize> {
        let _op = self.op_lock.lock().await;
        self.pause_all_locked(None).await
    }

    /// Zeroes the task's time and drops its manual entries. Confirmation is the caller's job.
    pub async fn reset(&self, note_id: &str, task_id: &str) -> AppResult<Option<Timer>> {
        let _op = self.op_lock.lock().await;
        self.drop_session(task_id);
        let timer = tasks::reset_time(&self.engine, note_id, task_id, self.clock.now()).await?;
        if timer.is_some() {
            self.notifier.notify(Notice::success("Timer reset"));
        }
        Ok(timer)
    }

    /// Moves the task to `status`. Completing a task pauses its timer first.
    pub async fn update_status(
        &self,
        note_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> AppResult<bool> {
        let _op = self.op_lock.lock().await;
        if status == TaskStatus::Done {
            self.pause_locked(note_id, task_id).await?;
        }
        let now = self.clock.now();
        let updated = tasks::set_status(&self.engine, note_id, task_id, status, now).await?;
        if updated {
            self.notifier.notify(Notice::success(status.transition_message()));
        }
        Ok(updated)
    }

    /// Tears down tickers of every task in the note without flushing their open sessions.
    pub fn cleanup_note_timers(&self, note_id: &str) -> usize {
        let removed = {
            let mut sessions = self.lock_sessions();
            let before = sessions.len();
            sessions.retain(|_, session| session.note_id != note_id);
            before - sessions.len()
        };
        let mut current = self.lock_current_note();
        if current.as_deref() == Some(note_id) {
            *current = None;
        }
        tracing::debug!(note_id, removed, "cleaned up timers for deleted note");
        removed
    }

    pub fn cancel_task_timer(&self, task_id: &str) -> bool {
        self.drop_session(task_id)
    }

    pub fn display(&self, task_id: &str) -> Option<watch::Receiver<TimerDisplay>> {
        self.lock_sessions().get(task_id).map(|session| session.display.clone())
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        let mut ids = self.lock_sessions().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Flushes the accrued part of every running session into storage and restarts the
    /// session clock at now. Timers keep running.
    pub async fn checkpoint_running(&self) -> AppResult<usize> {
        let _op = self.op_lock.lock().await;
        let now = self.clock.now();
        let flushed = self
            .engine
            .modify(|document| {
                let mut count = 0usize;
                for note in &mut document.notes {
                    for task in note.tasks.iter_mut().flatten() {
                        if !task.timer.is_running {
                            continue;
                        }
                        let elapsed = task.timer.session_elapsed(now);
                        task.timer.accrue(elapsed);
                        task.timer.current_session_start = Some(now);
                        task.timer.last_update = Some(now);
                        count += 1;
                    }
                }
                (count > 0).then_some(count)
            })
            .await?;
        Ok(flushed.unwrap_or(0))
    }

    /// Writes the side-channel record of every running timer.
    pub async fn persist_timer_states(&self) -> AppResult<usize> {
        let document = self.engine.read().await;
        let states = document
            .running_tasks()
            .into_iter()
            .filter_map(|(note_id, task)| {
                let start_time = task.timer.current_session_start?;
                Some((
                    task.id.clone(),
                    PersistedTimerState {
                        note_id,
                        is_running: true,
                        start_time,
                        worked_time: task.timer.worked_time,
                    },
                ))
            })
            .collect::<PersistedTimerStates>();

        let count = states.len();
        let path = self.states_path.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &states)).await??;
        tracing::debug!(count, path = %self.states_path.display(), "persisted timer states");
        Ok(count)
    }

    /// Reconciles timers recorded in the side channel by a previous process. Time since
    /// each recorded start is added to both counters; the timer resumes if its note is
    /// open, otherwise it is left stopped. Returns how many timers were reconciled.
    pub async fn restore_timer_states(&self) -> AppResult<usize> {
        let _op = self.op_lock.lock().await;
        let states = match tokio::fs::read(&self.states_path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedTimerStates>(&bytes) {
                Ok(states) => states,
                Err(error) => {
                    tracing::warn!(
                        path = %self.states_path.display(),
                        error = %error,
                        "discarding unreadable timer states"
                    );
                    self.remove_states_file().await;
                    return Ok(0);
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(AppError::from(error)),
        };

        let now = self.clock.now();
        let open_note = self.current_note();
        let reconciled = self
            .engine
            .modify(|document| {
                let mut count = 0usize;
                let mut resumed = None;
                for (task_id, state) in &states {
                    if !state.is_running {
                        continue;
                    }
                    let Some(task) = document.task_mut(&state.note_id, task_id) else {
                        continue;
                    };
                    let same_session = task.timer.current_session_start == Some(state.start_time);
                    if !task.timer.is_running || !same_session {
                        tracing::debug!(task_id = %task_id, "timer state already reconciled");
                        continue;
                    }
                    let elapsed = elapsed_seconds(state.start_time, now);
                    task.timer.accrue(elapsed);
                    task.timer.last_update = Some(now);

                    let note_is_open = open_note.as_deref() == Some(state.note_id.as_str());
                    if note_is_open && resumed.is_none() {
                        task.timer.current_session_start = Some(now);
                        resumed = Some((
                            state.note_id.clone(),
                            task_id.clone(),
                            task.timer.total_worked_time,
                            task.estimated_time,
                        ));
                    } else {
                        task.timer.is_running = false;
                        task.timer.current_session_start = None;
                    }
                    count += 1;
                }
                (count > 0).then_some((count, resumed))
            })
            .await?;

        self.remove_states_file().await;
        let Some((count, resumed)) = reconciled else {
            return Ok(0);
        };
        if let Some((note_id, task_id, base_total, estimated)) = resumed {
            self.spawn_session(&note_id, &task_id, base_total, now, estimated);
        }
        tracing::info!(count, "restored timers from previous session");
        self.notifier.notify(Notice::success("Timers restored from previous session"));
        Ok(count)
    }

    /// Every `interval`, checkpoints running timers and rewrites the side channel.
    pub fn spawn_persistence_sweep(&self, interval: Duration) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(error) = coordinator.checkpoint_running().await {
                    tracing::warn!(error = %error, "timer checkpoint failed");
                }
                if let Err(error) = coordinator.persist_timer_states().await {
                    tracing::warn!(error = %error, "timer state persistence failed");
                }
            }
        });
        if let Some(previous) = self.lock_sweeper().replace(handle) {
            previous.abort();
        }
    }

    /// Persists the side channel, then stops every ticker and the sweep.
    pub async fn shutdown(&self) -> AppResult<()> {
        let persisted = self.persist_timer_states().await;
        self.detach();
        persisted.map(|_| ())
    }

    /// Stops every ticker and the sweep. Running timers stay running in storage.
    pub fn detach(&self) {
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.abort();
        }
        self.lock_sessions().clear();
    }

    async fn start_locked(&self, note_id: &str, task_id: &str) -> AppResult<bool> {
        let Some(task) = tasks::get_task(&self.engine, note_id, task_id).await else {
            return Ok(false);
        };
        if task.status == TaskStatus::Done {
            return Err(AppError::InvalidInput(format!(
                "task {task_id} is done; move it back before timing it"
            )));
        }

        // Stale files or raw timer patches can leave several timers running at once.
        self.pause_all_locked(Some(task_id)).await?;
        if task.timer.is_running {
            if !self.has_session(task_id) {
                if let Some(started_at) = task.timer.current_session_start {
                    self.spawn_session(
                        note_id,
                        task_id,
                        task.timer.total_worked_time,
                        started_at,
                        task.estimated_time,
                    );
                }
            }
            return Ok(true);
        }

        let now = self.clock.now();
        let timer =
            tasks::update_task_timer(&self.engine, note_id, task_id, TimerPatch::started(now))
                .await?;
        let Some(timer) = timer else {
            return Ok(false);
        };
        if task.status == TaskStatus::Backlog {
            tasks::set_status(&self.engine, note_id, task_id, TaskStatus::Progress, now).await?;
            self.notifier.notify(Notice::success(TaskStatus::Progress.transition_message()));
        }

        self.spawn_session(note_id, task_id, timer.total_worked_time, now, task.estimated_time);
        tracing::info!(note_id, task_id, "timer started");
        self.notifier.notify(Notice::success("Timer started"));
        Ok(true)
    }

    async fn pause_locked(&self, note_id: &str, task_id: &str) -> AppResult<Option<Timer>> {
        self.drop_session(task_id);
        let now = self.clock.now();
        let paused = self
            .engine
            .modify(|document| {
                let task = document.task_mut(note_id, task_id)?;
                if !task.timer.is_running {
                    return None;
                }
                let elapsed = task.timer.session_elapsed(now);
                task.timer.accrue(elapsed);
                TimerPatch::paused(task.timer.worked_time, task.timer.total_worked_time, now)
                    .apply(&mut task.timer);
                Some(task.timer.clone())
            })
            .await?;
        if let Some(timer) = &paused {
            tracing::info!(note_id, task_id, total = timer.total_worked_time, "timer paused");
            self.notifier.notify(Notice::success("Timer paused"));
        }
        Ok(paused)
    }

    async fn pause_all_locked(&self, except: Option<&str>) -> AppResult<usize> {
        let running = self
            .engine
            .read()
            .await
            .running_tasks()
            .into_iter()
            .filter(|(_, task)| Some(task.id.as_str()) != except)
            .map(|(note_id, task)| (note_id, task.id.clone()))
            .collect::<Vec<_>>();

        let mut paused = 0usize;
        for (note_id, task_id) in running {
            if self.pause_locked(&note_id, &task_id).await?.is_some() {
                paused += 1;
            }
        }
        Ok(paused)
    }

    fn spawn_session(
        &self,
        note_id: &str,
        task_id: &str,
        base_total: u64,
        started_at: DateTime<Utc>,
        estimated: u64,
    ) {
        let now = self.clock.now();
        let initial =
            TimerDisplay::compute(note_id, task_id, base_total, started_at, estimated, now);
        let (sender, display) = watch::channel(initial);
        let clock = Arc::clone(&self.clock);
        let interval = self.tick_interval;
        let (ticker_note, ticker_task) = (note_id.to_string(), task_id.to_string());

        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let update = TimerDisplay::compute(
                    &ticker_note,
                    &ticker_task,
                    base_total,
                    started_at,
                    estimated,
                    clock.now(),
                );
                if sender.send(update).is_err() {
                    break;
                }
            }
        });

        let session = TimerSession {
            note_id: note_id.to_string(),
            ticker,
            display,
        };
        self.lock_sessions().insert(task_id.to_string(), session);
    }

    fn has_session(&self, task_id: &str) -> bool {
        self.lock_sessions().contains_key(task_id)
    }

    fn drop_session(&self, task_id: &str) -> bool {
        self.lock_sessions().remove(task_id).is_some()
    }

    async fn remove_states_file(&self) {
        match tokio::fs::remove_file(&self.states_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(
                    path = %self.states_path.display(),
                    error = %error,
                    "could not remove timer states"
                )
            }
        }
    }

    fn lock_current_note(&self) -> RwLockWriteGuard<'_, Option<String>> {
        self.current_note
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, TimerSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Note, TaskForm, TimeEntry};
    use crate::notes;
    use crate::notify::MemoryNotifier;
    use chrono::TimeZone;
    use std::path::Path;

    struct Fixture {
        engine: StorageEngine,
        clock: Arc<ManualClock>,
        notifier: Arc<MemoryNotifier>,
        coordinator: TimerCoordinator,
        note: Note,
    }

    async fn fixture(dir: &Path) -> Fixture {
        let engine = StorageEngine::open(
            dir.join("notes.json"),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).single().expect("start");
        let clock = Arc::new(ManualClock::new(start));
        let notifier = Arc::new(MemoryNotifier::new());
        let coordinator = TimerCoordinator::new(
            engine.clone(),
            clock.clone(),
            notifier.clone(),
            dir.join("timer-states.json"),
            Duration::from_millis(10),
        );
        let note = notes::create_note(&engine, Some("board".to_string()), None, clock.now())
            .await
            .expect("create note");
        Fixture {
            engine,
            clock,
            notifier,
            coordinator,
            note,
        }
    }

    async fn add_task(fixture: &Fixture, note_id: &str, title: &str) -> String {
        let form = TaskForm {
            title: title.to_string(),
            description: String::new(),
            hours: 1,
            minutes: 0,
        };
        tasks::create_task(&fixture.engine, note_id, &form, fixture.clock.now())
            .await
            .expect("create task")
            .expect("note exists")
            .id
    }

    async fn timer_of(fixture: &Fixture, note_id: &str, task_id: &str) -> Timer {
        tasks::get_task(&fixture.engine, note_id, task_id)
            .await
            .expect("task exists")
            .timer
    }

    #[tokio::test]
    async fn start_then_pause_accumulates_wall_clock_seconds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "write").await;

        assert!(f.coordinator.start(&f.note.id, &task_id).await.expect("start"));
        let task = tasks::get_task(&f.engine, &f.note.id, &task_id).await.expect("task");
        assert!(task.timer.is_running);
        assert_eq!(task.status, TaskStatus::Progress);
        assert_eq!(f.coordinator.active_task_ids(), vec![task_id.clone()]);

        f.clock.advance_secs(65);
        let timer = f
            .coordinator
            .pause(&f.note.id, &task_id)
            .await
            .expect("pause")
            .expect("was running");
        assert_eq!(timer.total_worked_time, 65);
        assert_eq!(timer.worked_time, 65);
        assert!(timer.current_session_start.is_none());
        assert!(f.coordinator.active_task_ids().is_empty());

        let entry = TimeEntry::new(5, "", f.clock.now());
        tasks::add_manual_time(&f.engine, &f.note.id, &task_id, entry)
            .await
            .expect("manual time");
        assert_eq!(timer_of(&f, &f.note.id, &task_id).await.total_worked_time, 365);

        let messages = f.notifier.messages();
        assert!(messages.contains(&"Timer started".to_string()));
        assert!(messages.contains(&"Timer paused".to_string()));
    }

    #[tokio::test]
    async fn starting_one_timer_pauses_every_other_across_notes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let other_note = notes::create_note(&f.engine, Some("other".into()), None, f.clock.now())
            .await
            .expect("other note");
        let t1 = add_task(&f, &f.note.id, "one").await;
        let t2 = add_task(&f, &f.note.id, "two").await;
        let t3 = add_task(&f, &other_note.id, "three").await;

        f.coordinator.start(&f.note.id, &t1).await.expect("start t1");
        f.clock.advance_secs(10);
        f.coordinator.start(&f.note.id, &t2).await.expect("start t2");
        assert!(!timer_of(&f, &f.note.id, &t1).await.is_running);
        assert_eq!(timer_of(&f, &f.note.id, &t1).await.total_worked_time, 10);

        f.clock.advance_secs(5);
        f.coordinator.start(&other_note.id, &t3).await.expect("start t3");
        let running = f.engine.read().await.running_tasks().len();
        assert_eq!(running, 1);
        assert!(timer_of(&f, &other_note.id, &t3).await.is_running);
        assert_eq!(f.coordinator.active_task_ids(), vec![t3]);
    }

    #[tokio::test]
    async fn starting_an_already_running_timer_stops_the_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let other_note = notes::create_note(&f.engine, Some("other".into()), None, f.clock.now())
            .await
            .expect("other note");
        let t1 = add_task(&f, &f.note.id, "one").await;
        let t2 = add_task(&f, &other_note.id, "two").await;
        for (note_id, task_id) in [(&f.note.id, &t1), (&other_note.id, &t2)] {
            let started = TimerPatch::started(f.clock.now());
            tasks::update_task_timer(&f.engine, note_id, task_id, started)
                .await
                .expect("seed running timer");
        }
        assert_eq!(f.engine.read().await.running_tasks().len(), 2);

        f.clock.advance_secs(6);
        assert!(f.coordinator.start(&f.note.id, &t1).await.expect("start t1"));
        assert_eq!(f.engine.read().await.running_tasks().len(), 1);
        assert!(timer_of(&f, &f.note.id, &t1).await.is_running);
        let stopped = timer_of(&f, &other_note.id, &t2).await;
        assert!(!stopped.is_running);
        assert_eq!(stopped.total_worked_time, 6);
        assert_eq!(f.coordinator.active_task_ids(), vec![t1]);
    }

    #[tokio::test]
    async fn concurrent_starts_leave_one_timer_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let mut ids = Vec::new();
        for index in 0..4 {
            ids.push(add_task(&f, &f.note.id, &format!("t{index}")).await);
        }

        let mut handles = Vec::new();
        for task_id in ids {
            let coordinator = f.coordinator.clone();
            let note_id = f.note.id.clone();
            handles.push(tokio::spawn(async move { coordinator.start(&note_id, &task_id).await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("start");
        }
        assert_eq!(f.engine.read().await.running_tasks().len(), 1);
    }

    #[tokio::test]
    async fn completing_a_task_pauses_its_timer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "ship").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        f.clock.advance_secs(30);

        assert!(f
            .coordinator
            .update_status(&f.note.id, &task_id, TaskStatus::Done)
            .await
            .expect("status"));
        let task = tasks::get_task(&f.engine, &f.note.id, &task_id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Done);
        assert!(!task.timer.is_running);
        assert_eq!(task.timer.total_worked_time, 30);

        let error = f.coordinator.start(&f.note.id, &task_id).await.expect_err("done task");
        assert!(error.to_string().contains("INVALID_INPUT"));
    }

    #[tokio::test]
    async fn toggle_and_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "loop").await;

        assert!(f.coordinator.toggle(&f.note.id, &task_id).await.expect("toggle on"));
        f.clock.advance_secs(12);
        f.coordinator.toggle(&f.note.id, &task_id).await.expect("toggle off");
        assert_eq!(timer_of(&f, &f.note.id, &task_id).await.total_worked_time, 12);

        f.coordinator.toggle(&f.note.id, &task_id).await.expect("toggle on again");
        let timer = f
            .coordinator
            .reset(&f.note.id, &task_id)
            .await
            .expect("reset")
            .expect("task exists");
        assert_eq!(timer, Timer { last_update: timer.last_update, ..Timer::default() });
        assert!(f.coordinator.active_task_ids().is_empty());
        assert!(!f.coordinator.toggle(&f.note.id, "missing").await.expect("unknown task"));
    }

    #[tokio::test]
    async fn pause_all_stops_every_timer_and_closing_keeps_them_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "solo").await;
        f.coordinator.open_note(&f.note.id).await.expect("open");
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");

        f.coordinator.close_note();
        assert!(f.coordinator.current_note().is_none());
        assert!(timer_of(&f, &f.note.id, &task_id).await.is_running);

        f.clock.advance_secs(8);
        assert_eq!(f.coordinator.pause_all().await.expect("pause all"), 1);
        assert_eq!(timer_of(&f, &f.note.id, &task_id).await.total_worked_time, 8);
        assert_eq!(f.coordinator.pause_all().await.expect("nothing running"), 0);
    }

    #[tokio::test]
    async fn ticker_publishes_wall_clock_display() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "watch").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        let mut display = f.coordinator.display(&task_id).expect("display");

        f.clock.advance_secs(90);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                display.changed().await.expect("ticker alive");
                if display.borrow().elapsed == 90 {
                    break;
                }
            }
        })
        .await
        .expect("display caught up");
        assert_eq!(display.borrow().label, "1m 30s / 1h 0m");
    }

    #[tokio::test]
    async fn cleanup_tears_down_sessions_of_the_note() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "gone").await;
        f.coordinator.open_note(&f.note.id).await.expect("open");
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        let mut display = f.coordinator.display(&task_id).expect("display");

        assert_eq!(f.coordinator.cleanup_note_timers(&f.note.id), 1);
        assert!(f.coordinator.current_note().is_none());
        tokio::time::timeout(Duration::from_secs(2), async {
            while display.changed().await.is_ok() {}
        })
        .await
        .expect("ticker stopped");
    }

    #[tokio::test]
    async fn checkpoint_flushes_running_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "long").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");

        f.clock.advance_secs(40);
        assert_eq!(f.coordinator.checkpoint_running().await.expect("checkpoint"), 1);
        let timer = timer_of(&f, &f.note.id, &task_id).await;
        assert!(timer.is_running);
        assert_eq!(timer.total_worked_time, 40);
        assert_eq!(timer.current_session_start, Some(f.clock.now()));

        f.clock.advance_secs(5);
        let paused = f
            .coordinator
            .pause(&f.note.id, &task_id)
            .await
            .expect("pause")
            .expect("running");
        assert_eq!(paused.total_worked_time, 45);
    }

    #[tokio::test]
    async fn persistence_sweep_checkpoints_and_writes_side_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "sweep").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        let started = f.clock.now();
        f.clock.advance_secs(40);

        let states_path = dir.path().join("timer-states.json");
        f.coordinator.spawn_persistence_sweep(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let total = timer_of(&f, &f.note.id, &task_id).await.total_worked_time;
                if total == 40 && states_path.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep ran");
        f.coordinator.detach();

        let timer = timer_of(&f, &f.note.id, &task_id).await;
        assert!(timer.is_running);
        assert_ne!(timer.current_session_start, Some(started));
        let raw = std::fs::read_to_string(&states_path).expect("states file");
        let states: PersistedTimerStates = serde_json::from_str(&raw).expect("states json");
        let state = states.get(&task_id).expect("running task recorded");
        assert_eq!(state.note_id, f.note.id);
        assert_eq!(state.worked_time, 40);
    }

    #[tokio::test]
    async fn restore_resumes_timer_of_open_note() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "crash").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        f.clock.advance_secs(20);
        f.coordinator.shutdown().await.expect("shutdown");
        assert!(dir.path().join("timer-states.json").exists());

        let restarted = TimerCoordinator::new(
            f.engine.clone(),
            f.clock.clone(),
            f.notifier.clone(),
            dir.path().join("timer-states.json"),
            Duration::from_millis(10),
        );
        restarted.open_note(&f.note.id).await.expect("open");
        restarted.detach();
        f.clock.advance_secs(10);
        assert_eq!(restarted.restore_timer_states().await.expect("restore"), 1);

        let timer = timer_of(&f, &f.note.id, &task_id).await;
        assert!(timer.is_running);
        assert_eq!(timer.total_worked_time, 30);
        assert_eq!(timer.current_session_start, Some(f.clock.now()));
        assert_eq!(restarted.active_task_ids(), vec![task_id]);
        assert!(!dir.path().join("timer-states.json").exists());
        assert!(f
            .notifier
            .messages()
            .contains(&"Timers restored from previous session".to_string()));
    }

    #[tokio::test]
    async fn restore_leaves_timers_of_closed_notes_stopped_with_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        let task_id = add_task(&f, &f.note.id, "crash").await;
        f.coordinator.start(&f.note.id, &task_id).await.expect("start");
        f.coordinator.persist_timer_states().await.expect("persist");
        f.coordinator.detach();

        f.clock.advance_secs(75);
        assert_eq!(f.coordinator.restore_timer_states().await.expect("restore"), 1);
        let timer = timer_of(&f, &f.note.id, &task_id).await;
        assert!(!timer.is_running);
        assert_eq!(timer.total_worked_time, 75);
        assert_eq!(timer.worked_time, 75);

        // A second restore with a stale record must not count the time twice.
        f.coordinator.persist_timer_states().await.expect("persist nothing");
        assert_eq!(f.coordinator.restore_timer_states().await.expect("restore again"), 0);
        assert_eq!(timer_of(&f, &f.note.id, &task_id).await.total_worked_time, 75);
    }

    #[tokio::test]
    async fn unreadable_states_file_is_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture(dir.path()).await;
        std::fs::write(dir.path().join("timer-states.json"), "not json").expect("write garbage");
        assert_eq!(f.coordinator.restore_timer_states().await.expect("restore"), 0);
        assert!(!dir.path().join("timer-states.json").exists());
    }
}
