use crate::errors::{AppError, AppResult};
use crate::models::{Task, TaskForm, TaskPatch, TaskStatus, TimeEntry, Timer, TimerPatch};
use crate::storage::StorageEngine;
use chrono::{DateTime, Utc};

/// Gives the note an empty task list if it has none. Returns `true` when one was created.
pub async fn initialize_tasks(engine: &StorageEngine, note_id: &str) -> AppResult<bool> {
    let created = engine
        .modify(|document| {
            let note = document.note_mut(note_id)?;
            if note.tasks.is_some() {
                return None;
            }
            note.tasks = Some(Vec::new());
            Some(())
        })
        .await?;
    Ok(created.is_some())
}

pub async fn list_tasks(engine: &StorageEngine, note_id: &str) -> Vec<Task> {
    engine
        .read()
        .await
        .note(note_id)
        .and_then(|note| note.tasks.clone())
        .unwrap_or_default()
}

pub async fn get_task(engine: &StorageEngine, note_id: &str, task_id: &str) -> Option<Task> {
    engine.read().await.note(note_id)?.task(task_id).cloned()
}

/// Appends a caller-built task to the note. Returns `false` when the note is unknown.
pub async fn save_task(engine: &StorageEngine, note_id: &str, task: Task) -> AppResult<bool> {
    let saved = engine
        .modify(|document| {
            let note = document.note_mut(note_id)?;
            note.tasks.get_or_insert_with(Vec::new).push(task);
            Some(())
        })
        .await?;
    Ok(saved.is_some())
}

/// New backlog task from the form, zeroed timer and no time entries.
pub async fn create_task(
    engine: &StorageEngine,
    note_id: &str,
    form: &TaskForm,
    now: DateTime<Utc>,
) -> AppResult<Option<Task>> {
    validate_form(form)?;
    let task = Task::new(form, now);
    let saved = save_task(engine, note_id, task.clone()).await?;
    Ok(saved.then_some(task))
}

/// Applies the form's title, description and estimate. Status, timer and time entries
/// are left as they are.
pub async fn edit_task(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    form: TaskForm,
    now: DateTime<Utc>,
) -> AppResult<Option<Task>> {
    validate_form(&form)?;
    let patch = form.into_patch(now);
    engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            patch.apply(task);
            Some(task.clone())
        })
        .await
}

pub async fn update_task(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    patch: TaskPatch,
) -> AppResult<bool> {
    let updated = engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            patch.apply(task);
            Some(())
        })
        .await?;
    Ok(updated.is_some())
}

pub async fn delete_task(engine: &StorageEngine, note_id: &str, task_id: &str) -> AppResult<bool> {
    let removed = engine
        .modify(|document| {
            let tasks = document.note_mut(note_id)?.tasks.as_mut()?;
            let before = tasks.len();
            tasks.retain(|task| task.id != task_id);
            (tasks.len() != before).then_some(())
        })
        .await?;
    Ok(removed.is_some())
}

/// Merges `patch` into the task's timer and returns the resulting timer.
pub async fn update_task_timer(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    patch: TimerPatch,
) -> AppResult<Option<Timer>> {
    engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            patch.apply(&mut task.timer);
            Some(task.timer.clone())
        })
        .await
}

pub async fn set_status(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    status: TaskStatus,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    update_task(engine, note_id, task_id, TaskPatch::status(status, now)).await
}

/// Flips the UI-persisted expanded flag. Returns the new value.
pub async fn toggle_expanded(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
) -> AppResult<Option<bool>> {
    engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            task.is_expanded = !task.is_expanded;
            Some(task.is_expanded)
        })
        .await
}

/// Records a manual entry and adds `minutes * 60` to the authoritative total.
/// `workedTime` is untouched. Returns the new total in seconds.
pub async fn add_manual_time(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    entry: TimeEntry,
) -> AppResult<Option<u64>> {
    if entry.minutes == 0 {
        return Err(AppError::InvalidInput(
            "manual time entry must be at least one minute".to_string(),
        ));
    }
    let seconds = entry
        .seconds()
        .ok_or_else(|| AppError::InvalidInput("manual time entry is too large".to_string()))?;
    engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            // Saturates so the total can never wrap below its previous value.
            task.timer.total_worked_time = task.timer.total_worked_time.saturating_add(seconds);
            task.manual_time_entries.push(entry);
            Some(task.timer.total_worked_time)
        })
        .await
}

/// Zeroes every counter, stops the timer and drops the manual entries in one write.
pub async fn reset_time(
    engine: &StorageEngine,
    note_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> AppResult<Option<Timer>> {
    engine
        .modify(|document| {
            let task = document.task_mut(note_id, task_id)?;
            TimerPatch::reset(now).apply(&mut task.timer);
            task.manual_time_entries.clear();
            Some(task.timer.clone())
        })
        .await
}

fn validate_form(form: &TaskForm) -> AppResult<()> {
    if form.title.trim().is_empty() {
        return Err(AppError::InvalidInput("task title cannot be empty".to_string()));
    }
    match form.estimated_seconds() {
        None => Err(AppError::InvalidInput("task estimate is too large".to_string())),
        Some(0) => Err(AppError::InvalidInput("task estimate must be positive".to_string())),
        Some(_) => Ok(()),
    }
}

/// `45s`, `12m`, `12m 5s`, `1h 2m`, `1h 2m 3s`.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let remaining = seconds % 60;
    match (hours, remaining) {
        (0, 0) => format!("{minutes}m"),
        (0, _) => format!("{minutes}m {remaining}s"),
        (_, 0) => format!("{hours}h {minutes}m"),
        _ => format!("{hours}h {minutes}m {remaining}s"),
    }
}

/// Share of the estimate worked so far, capped at 100. Zero without an estimate.
pub fn progress_percent(worked: u64, estimated: u64) -> f64 {
    if estimated == 0 {
        return 0.0;
    }
    (worked as f64 / estimated as f64 * 100.0).min(100.0)
}

/// Seconds worked beyond the estimate.
pub fn overrun(worked: u64, estimated: u64) -> u64 {
    if estimated == 0 {
        0
    } else {
        worked.saturating_sub(estimated)
    }
}
