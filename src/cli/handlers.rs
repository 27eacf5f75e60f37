use crate::cli::commands::*;
use crate::handle::StoreHandle;
use crate::models::{Note, NotePatch, Task, TaskForm, TaskStatus, TimeEntry};
use crate::notes::{display_title, export_file_name};
use crate::notify::Notifier;
use crate::pomodoro;
use crate::tasks::{format_duration, overrun, progress_percent};
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::time::Duration;

const SHORT_ID: usize = 8;

pub struct CommandContext<'a> {
    pub handle: &'a StoreHandle,
    pub notifier: &'a dyn Notifier,
    pub json: bool,
    pub tick: Duration,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn dispatch(command: Commands, ctx: &CommandContext<'_>) -> anyhow::Result<()> {
    let open_note = match &command {
        Commands::Task(cmd) => {
            let notes = ctx.handle.get_notes().await;
            Some(find_note(&notes, &cmd.note)?.id.clone())
        }
        _ => None,
    };
    if let Err(error) = ctx.handle.recover(open_note.as_deref()).await {
        tracing::warn!(error = %error, "timer recovery failed");
    }

    match command {
        Commands::List => cmd_list(ctx, false).await,
        Commands::Trash => cmd_list(ctx, true).await,
        Commands::New(args) => cmd_new(ctx, args).await,
        Commands::Edit(args) => cmd_edit(ctx, args).await,
        Commands::Delete(args) => cmd_delete(ctx, args).await,
        Commands::Restore(args) => cmd_restore(ctx, args).await,
        Commands::Purge(args) => cmd_purge(ctx, args).await,
        Commands::EmptyTrash => cmd_empty_trash(ctx).await,
        Commands::Info(args) => cmd_info(ctx, args).await,
        Commands::Duplicate(args) => cmd_duplicate(ctx, args).await,
        Commands::Export(args) => cmd_export(ctx, args).await,
        Commands::Task(cmd) => {
            let note_id = open_note.ok_or_else(|| anyhow!("no note selected"))?;
            cmd_task(ctx, &note_id, cmd.action).await
        }
        Commands::Pomodoro(args) => cmd_pomodoro(ctx, args).await,
    }
}

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct NoteLine<'a> {
    id: &'a str,
    title: String,
    updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted_at: Option<DateTime<Utc>>,
    tasks: usize,
}

async fn cmd_list(ctx: &CommandContext<'_>, trash: bool) -> anyhow::Result<()> {
    let mut notes = if trash {
        ctx.handle.get_trash().await
    } else {
        ctx.handle.get_notes().await
    };
    notes.sort_by(|a, b| b.updated.cmp(&a.updated));

    let lines = notes
        .iter()
        .map(|note| NoteLine {
            id: &note.id,
            title: display_title(note),
            updated: note.updated,
            deleted_at: note.deleted_at,
            tasks: note.tasks.as_ref().map_or(0, Vec::len),
        })
        .collect::<Vec<_>>();

    if ctx.json {
        return print_json(&lines);
    }
    if lines.is_empty() {
        println!("{}", if trash { "Trash is empty" } else { "No notes yet" });
    }
    for line in &lines {
        let when = line.deleted_at.unwrap_or(line.updated);
        println!("{}  {}  {}", short(line.id), local_time(when), line.title);
    }
    Ok(())
}

async fn cmd_new(ctx: &CommandContext<'_>, args: NewArgs) -> anyhow::Result<()> {
    let note = ctx.handle.create_note(args.title, args.content).await?;
    if ctx.json {
        return print_json(&note);
    }
    println!("Created {}  {}", short(&note.id), display_title(&note));
    Ok(())
}

async fn cmd_edit(ctx: &CommandContext<'_>, args: EditArgs) -> anyhow::Result<()> {
    if args.title.is_none() && args.content.is_none() {
        bail!("nothing to change: pass --title and/or --content");
    }
    let id = find_note(&ctx.handle.get_notes().await, &args.id)?.id.clone();
    let patch = NotePatch {
        title: args.title,
        content: args.content,
        ..NotePatch::default()
    };
    ctx.handle.update_note(&id, patch).await?;
    let note = ctx
        .handle
        .get_note(&id)
        .await
        .ok_or_else(|| anyhow!("note {id} disappeared"))?;
    if ctx.json {
        return print_json(&note);
    }
    println!("Saved {}  {}", short(&note.id), display_title(&note));
    Ok(())
}

async fn cmd_delete(ctx: &CommandContext<'_>, args: NoteIdArg) -> anyhow::Result<()> {
    let note = find_note(&ctx.handle.get_notes().await, &args.id)?.clone();
    ctx.handle.delete_note(&note.id).await?;
    report(ctx, &note.id, &format!("Moved \"{}\" to trash", display_title(&note)))
}

async fn cmd_restore(ctx: &CommandContext<'_>, args: NoteIdArg) -> anyhow::Result<()> {
    let note = find_note(&ctx.handle.get_trash().await, &args.id)?.clone();
    ctx.handle.restore_note(&note.id).await?;
    report(ctx, &note.id, &format!("Restored \"{}\"", display_title(&note)))
}

async fn cmd_purge(ctx: &CommandContext<'_>, args: NoteIdArg) -> anyhow::Result<()> {
    let note = find_note(&ctx.handle.get_trash().await, &args.id)?.clone();
    ctx.handle.permanently_delete_note(&note.id).await?;
    report(ctx, &note.id, &format!("Deleted \"{}\" forever", display_title(&note)))
}

async fn cmd_empty_trash(ctx: &CommandContext<'_>) -> anyhow::Result<()> {
    let removed = ctx.handle.empty_trash().await?;
    if ctx.json {
        return print_json(&serde_json::json!({ "removed": removed }));
    }
    println!("Removed {removed} note(s) from trash");
    Ok(())
}

async fn cmd_info(ctx: &CommandContext<'_>, args: NoteIdArg) -> anyhow::Result<()> {
    let id = find_note(&ctx.handle.get_notes().await, &args.id)?.id.clone();
    let info = ctx
        .handle
        .note_info(&id)
        .await
        .ok_or_else(|| anyhow!("note not found: {}", args.id))?;
    if ctx.json {
        return print_json(&info);
    }
    println!("{}", info.title);
    println!("  id:       {}", info.id);
    println!("  created:  {}", local_time(info.created));
    println!("  updated:  {}", local_time(info.updated));
    println!("  words:    {}", info.word_count);
    println!("  chars:    {}", info.char_count);
    println!("  tasks:    {}", info.task_count);
    Ok(())
}

async fn cmd_duplicate(ctx: &CommandContext<'_>, args: NoteIdArg) -> anyhow::Result<()> {
    let id = find_note(&ctx.handle.get_notes().await, &args.id)?.id.clone();
    let copy = ctx
        .handle
        .duplicate_note(&id)
        .await?
        .ok_or_else(|| anyhow!("note not found: {}", args.id))?;
    if ctx.json {
        return print_json(&copy);
    }
    println!("Created {}  {}", short(&copy.id), display_title(&copy));
    Ok(())
}

async fn cmd_export(ctx: &CommandContext<'_>, args: ExportArgs) -> anyhow::Result<()> {
    let note = find_note(&ctx.handle.get_notes().await, &args.id)?.clone();
    let dir = args.out.unwrap_or_else(|| PathBuf::from("."));
    let path = dir.join(export_file_name(note.title.as_deref()));
    tokio::fs::write(&path, note.content.as_deref().unwrap_or_default())
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    if ctx.json {
        return print_json(&serde_json::json!({ "id": note.id, "path": path }));
    }
    println!("Exported to {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn cmd_task(
    ctx: &CommandContext<'_>,
    note_id: &str,
    action: TaskAction,
) -> anyhow::Result<()> {
    let handle = ctx.handle;
    match action {
        TaskAction::List => {
            let tasks = handle.get_note_tasks(note_id).await;
            if ctx.json {
                return print_json(&tasks);
            }
            if tasks.is_empty() {
                println!("No tasks");
            }
            let now = handle.now();
            for task in &tasks {
                let marker = if task.timer.is_running { "*" } else { " " };
                println!(
                    "{marker} {}  [{}]  {}  {}",
                    short(&task.id),
                    task.status.as_str(),
                    time_summary(task, now),
                    task.title
                );
            }
            Ok(())
        }
        TaskAction::Add(args) => {
            let form = TaskForm {
                title: args.title,
                description: args.description,
                hours: args.hours,
                minutes: args.minutes,
            };
            let task = handle
                .create_note_task(note_id, &form)
                .await?
                .ok_or_else(|| anyhow!("note not found: {note_id}"))?;
            print_task_result(ctx, &task, "Added")
        }
        TaskAction::Edit(args) => {
            let task = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.clone();
            let current_hours = task.estimated_time / 3600;
            let current_minutes = (task.estimated_time % 3600) / 60;
            let form = TaskForm {
                title: args.title.unwrap_or_else(|| task.title.clone()),
                description: args
                    .description
                    .or_else(|| task.description.clone())
                    .unwrap_or_default(),
                hours: args.hours.unwrap_or(current_hours),
                minutes: args.minutes.unwrap_or(current_minutes),
            };
            let edited = handle
                .edit_note_task(note_id, &task.id, form)
                .await?
                .ok_or_else(|| anyhow!("task not found: {}", args.task))?;
            print_task_result(ctx, &edited, "Saved")
        }
        TaskAction::Status(args) => {
            let status = TaskStatus::parse(&args.status)
                .ok_or_else(|| {
                    anyhow!("unknown status '{}': use backlog, progress or done", args.status)
                })?;
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            handle.update_status(note_id, &task_id, status).await?;
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Start(args) => {
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            handle.start_task_timer(note_id, &task_id).await?;
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Pause(args) => {
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            if handle.pause_task_timer(note_id, &task_id).await?.is_none() && !ctx.json {
                println!("Timer was not running");
            }
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Toggle(args) => {
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            handle.toggle_task_timer(note_id, &task_id).await?;
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Reset(args) => {
            if !args.yes {
                bail!("reset discards all tracked time for the task; pass --yes to confirm");
            }
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            handle.reset_task_timer(note_id, &task_id).await?;
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Log(args) => {
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            let entry = TimeEntry::new(args.minutes, args.description, handle.now());
            handle.add_note_task_manual_time(note_id, &task_id, entry).await?;
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Show(args) => {
            let task_id = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.id.clone();
            show_task(ctx, note_id, &task_id).await
        }
        TaskAction::Remove(args) => {
            let task = find_task(&handle.get_note_tasks(note_id).await, &args.task)?.clone();
            handle.delete_note_task(note_id, &task.id).await?;
            report(ctx, &task.id, &format!("Removed task \"{}\"", task.title))
        }
    }
}

async fn show_task(ctx: &CommandContext<'_>, note_id: &str, task_id: &str) -> anyhow::Result<()> {
    let task = ctx
        .handle
        .get_note_task(note_id, task_id)
        .await
        .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
    if ctx.json {
        return print_json(&task);
    }
    let now = ctx.handle.now();
    let worked = task.timer.live_total(now);
    println!("{}", task.title);
    println!("  id:        {}", task.id);
    println!("  status:    {}", task.status.as_str());
    if let Some(description) = task.description.as_deref().filter(|text| !text.is_empty()) {
        println!("  about:     {description}");
    }
    println!("  estimate:  {}", format_duration(task.estimated_time));
    println!(
        "  worked:    {} ({:.0}%){}",
        format_duration(worked),
        progress_percent(worked, task.estimated_time),
        if task.timer.is_running { ", running" } else { "" }
    );
    let over = overrun(worked, task.estimated_time);
    if over > 0 {
        println!("  over by:   {}", format_duration(over));
    }
    for entry in &task.manual_time_entries {
        println!(
            "  + {}m  {}  {}",
            entry.minutes,
            local_time(entry.timestamp),
            entry.description
        );
    }
    Ok(())
}

fn print_task_result(ctx: &CommandContext<'_>, task: &Task, verb: &str) -> anyhow::Result<()> {
    if ctx.json {
        return print_json(task);
    }
    println!("{verb} {}  {}", short(&task.id), task.title);
    Ok(())
}

fn time_summary(task: &Task, now: DateTime<Utc>) -> String {
    format!(
        "{} / {}",
        format_duration(task.timer.live_total(now)),
        format_duration(task.estimated_time)
    )
}

// ---------------------------------------------------------------------------
// Pomodoro
// ---------------------------------------------------------------------------

async fn cmd_pomodoro(ctx: &CommandContext<'_>, args: PomodoroArgs) -> anyhow::Result<()> {
    if args.cycles == 0 {
        bail!("--cycles must be at least 1");
    }
    let finished = pomodoro::run_cycles(args.cycles, ctx.tick, ctx.notifier).await;
    if ctx.json {
        return print_json(&finished);
    }
    println!("Next up: {:?} {}", finished.phase(), finished.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Exact id, else a unique id prefix.
pub fn find_note<'a>(notes: &'a [Note], query: &str) -> anyhow::Result<&'a Note> {
    find_by_id(notes, query, |note| &note.id).map_err(|error| anyhow!("note {error}"))
}

pub fn find_task<'a>(tasks: &'a [Task], query: &str) -> anyhow::Result<&'a Task> {
    find_by_id(tasks, query, |task| &task.id).map_err(|error| anyhow!("task {error}"))
}

fn find_by_id<'a, T>(
    items: &'a [T],
    query: &str,
    id_of: impl Fn(&T) -> &String,
) -> Result<&'a T, String> {
    if let Some(exact) = items.iter().find(|item| id_of(item) == query) {
        return Ok(exact);
    }
    let mut matches = items.iter().filter(|item| id_of(item).starts_with(query));
    match (matches.next(), matches.next()) {
        (Some(item), None) if !query.is_empty() => Ok(item),
        (Some(_), Some(_)) => Err(format!("id '{query}' is ambiguous")),
        _ => Err(format!("not found: {query}")),
    }
}

fn report(ctx: &CommandContext<'_>, id: &str, message: &str) -> anyhow::Result<()> {
    if ctx.json {
        return print_json(&serde_json::json!({ "id": id, "message": message }));
    }
    println!("{message}");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(id: &str) -> &str {
    id.get(..SHORT_ID).unwrap_or(id)
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
