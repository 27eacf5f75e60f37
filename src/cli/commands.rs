use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deepnote", about = "Notes with tasks and time tracking", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Use a different data directory
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List notes
    List,
    /// List trashed notes
    Trash,
    /// Create a note
    New(NewArgs),
    /// Change a note's title or content
    Edit(EditArgs),
    /// Move a note to the trash
    Delete(NoteIdArg),
    /// Bring a note back from the trash
    Restore(NoteIdArg),
    /// Permanently delete a trashed note
    Purge(NoteIdArg),
    /// Permanently delete every trashed note
    EmptyTrash,
    /// Show note details
    Info(NoteIdArg),
    /// Copy a note's title and content into a new note
    Duplicate(NoteIdArg),
    /// Write a note's content to a .txt file
    Export(ExportArgs),
    /// Work with a note's tasks
    Task(TaskCmd),
    /// Run focus/break countdowns
    Pomodoro(PomodoroArgs),
}

#[derive(Args)]
pub struct NoteIdArg {
    /// Note id (a unique prefix is enough)
    pub id: String,
}

#[derive(Args)]
pub struct NewArgs {
    /// Note content
    pub content: Option<String>,
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args)]
pub struct EditArgs {
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub content: Option<String>,
}

#[derive(Args)]
pub struct ExportArgs {
    pub id: String,
    /// Directory to write into (default: current directory)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct TaskCmd {
    /// Note the tasks belong to
    pub note: String,
    #[command(subcommand)]
    pub action: TaskAction,
}

#[derive(Subcommand)]
pub enum TaskAction {
    /// List the note's tasks
    List,
    /// Add a backlog task
    Add(TaskFormArgs),
    /// Change title, description or estimate
    Edit(TaskEditArgs),
    /// Set status (backlog, progress, done)
    Status(TaskStatusArgs),
    /// Start the timer, pausing any other running timer
    Start(TaskIdArg),
    /// Pause the timer
    Pause(TaskIdArg),
    /// Start or pause the timer
    Toggle(TaskIdArg),
    /// Zero all tracked time
    Reset(TaskResetArgs),
    /// Record time worked outside the timer
    Log(TaskLogArgs),
    /// Show task details
    Show(TaskIdArg),
    /// Remove the task
    Remove(TaskIdArg),
}

#[derive(Args)]
pub struct TaskIdArg {
    /// Task id (a unique prefix is enough)
    pub task: String,
}

#[derive(Args)]
pub struct TaskFormArgs {
    pub title: String,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long, default_value_t = 0)]
    pub hours: u64,
    #[arg(long, default_value_t = 0)]
    pub minutes: u64,
}

#[derive(Args)]
pub struct TaskEditArgs {
    pub task: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub hours: Option<u64>,
    #[arg(long)]
    pub minutes: Option<u64>,
}

#[derive(Args)]
pub struct TaskStatusArgs {
    pub task: String,
    pub status: String,
}

#[derive(Args)]
pub struct TaskResetArgs {
    pub task: String,
    /// Confirm the reset
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct TaskLogArgs {
    pub task: String,
    pub minutes: u64,
    #[arg(long, default_value = "")]
    pub description: String,
}

#[derive(Args)]
pub struct PomodoroArgs {
    /// Number of phases to run (focus and break alternate)
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,
}
