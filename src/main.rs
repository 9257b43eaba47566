//! Knell CLI - a reminder scheduling and recurrence agent.

use clap::Parser;
use knell::cli::{
    AgentCommands, Cli, Commands, EventCommands, LedgerCommands, SystemCommands, TaskCommands,
};
use knell::commands::{self, Render, TaskAddArgs};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    // Log to stderr so JSON output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KN_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Determine data dir: --data-dir flag > KN_DATA_DIR env > XDG default
    let data_dir = resolve_data_dir(cli.data_dir, human);

    if let Err(e) = run_command(cli.command, &data_dir, human) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!(r#"{{"error": "{}"}}"#, e);
        }
        process::exit(1);
    }
}

/// Resolve the data directory from the flag/env override or the XDG
/// default (`~/.local/share/knell`).
fn resolve_data_dir(explicit: Option<PathBuf>, human: bool) -> PathBuf {
    match explicit {
        Some(path) => path,
        None => match dirs::data_dir() {
            Some(base) => base.join("knell"),
            None => {
                if human {
                    eprintln!("Error: could not determine data directory");
                } else {
                    eprintln!(r#"{{"error": "could not determine data directory"}}"#);
                }
                process::exit(1);
            }
        },
    }
}

fn run_command(command: Commands, data_dir: &Path, human: bool) -> Result<(), knell::Error> {
    match command {
        Commands::System { command } => match command {
            SystemCommands::Init => output(&commands::system_init(data_dir)?, human),
        },

        Commands::Task { command } => match command {
            TaskCommands::Add {
                title,
                owner,
                description,
                priority,
                tags,
                timezone,
                due,
                remind,
                every,
            } => {
                let args = TaskAddArgs {
                    title,
                    owner,
                    description,
                    priority,
                    tags,
                    timezone,
                    due,
                    remind,
                    every,
                };
                output(&commands::task_add(data_dir, args)?, human)
            }
            TaskCommands::List { all, owner, tag } => output(
                &commands::task_list(data_dir, all, owner.as_deref(), tag.as_deref())?,
                human,
            ),
            TaskCommands::Show { id } => output(&commands::task_show(data_dir, &id)?, human),
            TaskCommands::Done { id } => output(&commands::task_done(data_dir, &id)?, human),
            TaskCommands::Rm { id } => output(&commands::task_rm(data_dir, &id)?, human),
            TaskCommands::Next { id, count } => {
                output(&commands::task_next(data_dir, &id, count)?, human)
            }
        },

        Commands::Agent { command } => match command {
            AgentCommands::Tick => output(&commands::agent_tick(data_dir)?, human),
            AgentCommands::Run => commands::agent_run(data_dir)?,
            AgentCommands::Status => output(&commands::agent_status(data_dir)?, human),
        },

        Commands::Event { command } => match command {
            EventCommands::Submit { payload } => {
                output(&commands::event_submit(data_dir, &payload)?, human)
            }
        },

        Commands::Ledger { command } => match command {
            LedgerCommands::Sweep => output(&commands::ledger_sweep(data_dir)?, human),
        },
    }

    Ok(())
}

fn output<T: Render>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
