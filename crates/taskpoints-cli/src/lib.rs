//! Command surface for the task-points backend.
//!
//! Host projects embed the engine through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct [`Command`] execution against an open engine.
//!
//! Every command prints one pretty-printed JSON document to stdout; failures
//! go to stderr with a non-zero exit from the binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use taskpoints_core::{RulesEngine, TaskCatalog, TaskDefinition, TaskId, UserId};
use taskpoints_store_sqlite::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "taskpoints")]
#[command(about = "Task-points gamification CLI")]
pub struct Cli {
    #[arg(long, default_value = "./taskpoints.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    Referral {
        #[command(subcommand)]
        command: ReferralCommand,
    },
    Email {
        #[command(subcommand)]
        command: EmailCommand,
    },
    Points(UserRefArgs),
    History(UserRefArgs),
    Leaderboard(LeaderboardArgs),
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Create(UserCreateArgs),
    Status(UserRefArgs),
}

#[derive(Debug, Args)]
pub struct UserCreateArgs {
    #[arg(long)]
    username: String,
    /// Already-hashed password; the engine never hashes or inspects it.
    #[arg(long)]
    password_hash: String,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    List,
    Complete(TaskCompleteArgs),
}

#[derive(Debug, Args)]
pub struct TaskCompleteArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    task: i64,
}

#[derive(Debug, Subcommand)]
pub enum ReferralCommand {
    Set(ReferralSetArgs),
}

#[derive(Debug, Args)]
pub struct ReferralSetArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    referrer: i64,
}

#[derive(Debug, Subcommand)]
pub enum EmailCommand {
    Set(EmailSetArgs),
}

#[derive(Debug, Args)]
pub struct EmailSetArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    email: String,
}

#[derive(Debug, Args)]
pub struct UserRefArgs {
    #[arg(long)]
    user: i64,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long, default_value_t = 10)]
    limit: u32,
}

/// Installs the stderr tracing subscriber, honouring `RUST_LOG`.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteStore::open(&cli.db)?;
    store.migrate()?;
    let catalog = TaskCatalog::new(store.load_tasks()?);
    let mut engine = RulesEngine::new(catalog, store);
    run_command(cli.command, &mut engine)
}

/// Executes a parsed command against an existing engine.
///
/// # Errors
/// Returns an error when the requested operation fails; the message carries
/// the engine's stable error text.
pub fn run_command(command: Command, engine: &mut RulesEngine<SqliteStore>) -> Result<()> {
    match command {
        Command::User { command } => run_user(command, engine),
        Command::Task { command } => run_task(command, engine),
        Command::Referral { command } => run_referral(command, engine),
        Command::Email { command } => run_email(command, engine),
        Command::Points(args) => {
            let user = UserId(args.user);
            let points = engine.get_points(user)?;
            print_json(&json!({ "user_id": user, "points": points }))
        }
        Command::History(args) => {
            let history = engine.get_history(UserId(args.user))?;
            print_json(&history)
        }
        Command::Leaderboard(args) => {
            let board = engine.get_leaderboard(args.limit)?;
            print_json(&board)
        }
    }
}

fn run_user(command: UserCommand, engine: &mut RulesEngine<SqliteStore>) -> Result<()> {
    match command {
        UserCommand::Create(args) => {
            let user = engine.create_user(&args.username, &args.password_hash)?;
            print_json(&user)
        }
        UserCommand::Status(args) => {
            let status = engine.get_status(UserId(args.user))?;
            print_json(&status)
        }
    }
}

fn run_task(command: TaskCommand, engine: &mut RulesEngine<SqliteStore>) -> Result<()> {
    match command {
        TaskCommand::List => {
            let tasks: Vec<&TaskDefinition> = engine.catalog().definitions().collect();
            print_json(&tasks)
        }
        TaskCommand::Complete(args) => {
            let entry = engine.complete_task(UserId(args.user), TaskId(args.task))?;
            print_json(&entry)
        }
    }
}

fn run_referral(command: ReferralCommand, engine: &mut RulesEngine<SqliteStore>) -> Result<()> {
    match command {
        ReferralCommand::Set(args) => {
            let user = UserId(args.user);
            let referrer = UserId(args.referrer);
            engine.set_referrer(user, referrer)?;
            print_json(&json!({
                "user_id": user,
                "referrer_id": referrer,
                "linked": true,
            }))
        }
    }
}

fn run_email(command: EmailCommand, engine: &mut RulesEngine<SqliteStore>) -> Result<()> {
    match command {
        EmailCommand::Set(args) => {
            let user = UserId(args.user);
            engine.set_email(user, &args.email)?;
            print_json(&json!({
                "user_id": user,
                "email": args.email,
            }))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
