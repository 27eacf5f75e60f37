use crate::errors::{AppError, AppResult};
use crate::models::{Note, NoteInfo, NotePatch};
use crate::storage::StorageEngine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static NON_SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[^a-z0-9]").expect("valid slug regex"));

const UNTITLED: &str = "Untitled note";
const DISPLAY_TITLE_CHARS: usize = 30;

pub async fn list_notes(engine: &StorageEngine) -> Vec<Note> {
    engine.read().await.notes
}

pub async fn list_trash(engine: &StorageEngine) -> Vec<Note> {
    engine.read().await.trash
}

pub async fn get_note(engine: &StorageEngine, note_id: &str) -> Option<Note> {
    engine.read().await.note(note_id).cloned()
}

/// Appends a caller-built note. Ids already present in notes or trash are rejected.
pub async fn save_note(engine: &StorageEngine, note: Note) -> AppResult<()> {
    let note_id = note.id.clone();
    let mut taken = false;
    engine
        .modify(|document| {
            taken = document
                .notes
                .iter()
                .chain(document.trash.iter())
                .any(|existing| existing.id == note.id);
            if taken {
                return None;
            }
            document.notes.push(note);
            Some(())
        })
        .await?;
    if taken {
        return Err(AppError::InvalidInput(format!("note id {note_id} already exists")));
    }
    Ok(())
}

/// Builds and saves a note with a fresh id and `created == updated == now`.
pub async fn create_note(
    engine: &StorageEngine,
    title: Option<String>,
    content: Option<String>,
    now: DateTime<Utc>,
) -> AppResult<Note> {
    let note = Note::new(title, content, now);
    save_note(engine, note.clone()).await?;
    Ok(note)
}

/// Shallow-merges `patch` into the note. Returns `false` when the id is unknown.
pub async fn update_note(
    engine: &StorageEngine,
    note_id: &str,
    patch: NotePatch,
    now: DateTime<Utc>,
) -> AppResult<bool> {
    let updated = engine
        .modify(|document| {
            let note = document.note_mut(note_id)?;
            patch.apply(note, now);
            Some(())
        })
        .await?;
    Ok(updated.is_some())
}

/// Moves the note to trash and stamps `deletedAt`. Running timers stored in the note
/// are stopped without flushing the open session. Returns the trashed note.
pub async fn delete_note(
    engine: &StorageEngine,
    note_id: &str,
    now: DateTime<Utc>,
) -> AppResult<Option<Note>> {
    engine
        .modify(|document| {
            let index = document.notes.iter().position(|note| note.id == note_id)?;
            let mut note = document.notes.remove(index);
            for task in note.tasks.iter_mut().flatten() {
                if task.timer.is_running {
                    task.timer.cancel_session(now);
                }
            }
            note.deleted_at = Some(now);
            document.trash.push(note.clone());
            Some(note)
        })
        .await
}

pub async fn restore_note(engine: &StorageEngine, note_id: &str) -> AppResult<bool> {
    let restored = engine
        .modify(|document| {
            let index = document.trash.iter().position(|note| note.id == note_id)?;
            let mut note = document.trash.remove(index);
            note.deleted_at = None;
            document.notes.push(note);
            Some(())
        })
        .await?;
    Ok(restored.is_some())
}

pub async fn permanently_delete_note(engine: &StorageEngine, note_id: &str) -> AppResult<bool> {
    let removed = engine
        .modify(|document| {
            let before = document.trash.len();
            document.trash.retain(|note| note.id != note_id);
            (document.trash.len() != before).then_some(())
        })
        .await?;
    Ok(removed.is_some())
}

/// Erases every trashed note. Returns how many were removed.
pub async fn empty_trash(engine: &StorageEngine) -> AppResult<usize> {
    let removed = engine
        .modify(|document| {
            let count = document.trash.len();
            document.trash.clear();
            (count > 0).then_some(count)
        })
        .await?;
    Ok(removed.unwrap_or(0))
}

/// Saves a copy of the note's title and content under a new id. Tasks are not copied.
pub async fn duplicate_note(
    engine: &StorageEngine,
    note_id: &str,
    now: DateTime<Utc>,
) -> AppResult<Option<Note>> {
    let Some(source) = get_note(engine, note_id).await else {
        return Ok(None);
    };
    let title = match source.title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
        Some(title) => format!("{title} (Copy)"),
        None => format!("{UNTITLED} (Copy)"),
    };
    let copy = create_note(engine, Some(title), source.content.clone(), now).await?;
    Ok(Some(copy))
}

pub async fn note_info(engine: &StorageEngine, note_id: &str) -> Option<NoteInfo> {
    let note = get_note(engine, note_id).await?;
    let content = note.content.as_deref().unwrap_or_default();
    Some(NoteInfo {
        id: note.id.clone(),
        title: display_title(&note),
        created: note.created,
        updated: note.updated,
        word_count: content.split_whitespace().count(),
        char_count: content.chars().count(),
        task_count: note.tasks.as_ref().map_or(0, Vec::len),
    })
}

/// Title when set, else the first characters of the content, else a placeholder.
pub fn display_title(note: &Note) -> String {
    if let Some(title) = note.title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
        return title.to_string();
    }
    match note.content.as_deref().filter(|content| !content.is_empty()) {
        Some(content) => content.chars().take(DISPLAY_TITLE_CHARS).collect(),
        None => UNTITLED.to_string(),
    }
}

/// `"My Note!"` -> `"my-note-.txt"`.
pub fn export_file_name(title: Option<&str>) -> String {
    let title = title.map(str::trim).filter(|title| !title.is_empty()).unwrap_or("untitled-note");
    format!("{}.txt", NON_SLUG_RE.replace_all(title, "-").to_lowercase())
}
