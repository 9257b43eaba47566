//! CLI argument definitions for Knell.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Knell - a reminder scheduling and recurrence agent for task services.
///
/// Seed tasks with `kn task add`, then drive the scheduler with
/// `kn agent tick` (one cycle) or `kn agent run` (poll loop).
#[derive(Parser, Debug)]
#[command(name = "kn")]
#[command(author, version, about = "A reminder scheduling and recurrence agent", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Data directory (defaults to ~/.local/share/knell).
    /// Can also be set via the KN_DATA_DIR environment variable.
    #[arg(short = 'D', long = "data-dir", global = true, env = "KN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Task management commands (local stand-in for the task service API)
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Scheduling agent commands
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Inbound event commands (push path)
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Idempotency ledger maintenance
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },

    /// System administration commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

/// Task management subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Create a task
    Add {
        /// Task title
        title: String,

        /// Owner the reminder is addressed to
        #[arg(long, default_value = "local")]
        owner: String,

        /// Detailed description
        #[arg(long)]
        description: Option<String>,

        /// Priority: low, medium, or high
        #[arg(long)]
        priority: Option<String>,

        /// Tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// IANA timezone for the task's wall-clock times (default UTC)
        #[arg(long = "tz")]
        timezone: Option<String>,

        /// Due time: RFC 3339 or 'YYYY-MM-DD HH:MM' in the task timezone
        #[arg(long)]
        due: Option<String>,

        /// Reminder time, same formats as --due; must precede it
        #[arg(long)]
        remind: Option<String>,

        /// Recurrence spec: daily[:n], weekly[:n]:mon,wed or monthly[:n]:15
        #[arg(long)]
        every: Option<String>,
    },

    /// List tasks (open tasks by default)
    List {
        /// Include completed tasks
        #[arg(long)]
        all: bool,

        /// Filter by owner
        #[arg(long)]
        owner: Option<String>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show a task by ID
    Show {
        /// Task ID (e.g., kn-a1b2)
        id: String,
    },

    /// Complete a task; recurring tasks get their next occurrence
    Done {
        /// Task ID
        id: String,
    },

    /// Delete a task
    Rm {
        /// Task ID
        id: String,
    },

    /// Preview the next occurrences of a recurring task
    Next {
        /// Task ID
        id: String,

        /// How many occurrences to preview
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
}

/// Scheduling agent subcommands
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Run one scheduling cycle
    Tick,

    /// Poll at the configured interval until interrupted
    Run,

    /// Show agent health counters
    Status,
}

/// Inbound event subcommands
#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Submit one event envelope (JSON)
    Submit {
        /// Event JSON, e.g. {"event_type":"task.completed",...}
        payload: String,
    },
}

/// Ledger maintenance subcommands
#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// Purge ledger records past the retention window
    Sweep,
}

/// System administration subcommands
#[derive(Subcommand, Debug)]
pub enum SystemCommands {
    /// Initialize the data directory and database
    Init,
}
