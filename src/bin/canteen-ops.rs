//! One-shot operator commands against the canteen store.
//!
//! Usage: canteen-ops <COMMAND>
//!   cleanup                       delete meal cycles whose service has ended
//!   rebuild-mapping               rebuild guardian links from the directory
//!   auto-fill --meal ID           assign variants to students who did not choose
//!   notify-unselected --meal ID   remind students who have not chosen yet
//!   issue-token --student ID      print a collection token
//!   create-staff ...              add a staff account
//!
//! Reads the same environment as the daemon (see `.env`).

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use canteen::{
    clock::SystemClock,
    config::Config,
    db,
    models::staff::{NewStaff, Role},
    services::{staff::StaffService, students::StudentService},
    state::AppState,
};

#[derive(Parser)]
#[command(name = "canteen-ops", about = "Operator commands for the canteen meal service")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete meal cycles whose effective window has ended
    Cleanup,
    /// Rebuild the guardian to student mapping from the directory
    RebuildMapping,
    /// Fill in a variant for every student without a selection
    AutoFill {
        #[arg(long)]
        meal: i64,
    },
    /// Send the "please choose" reminder for a meal
    NotifyUnselected {
        #[arg(long)]
        meal: i64,
    },
    /// Print the collection token for a student
    IssueToken {
        #[arg(long)]
        student: i64,
    },
    /// Create a staff account
    CreateStaff {
        #[arg(long)]
        username: String,
        #[arg(long)]
        full_name: String,
        /// admin, canteen_a, canteen_b or canteen_test
        #[arg(long)]
        role: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        external_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_env()?);
    let pool = db::create_pool(&config.database_path).await?;
    db::run_migrations(&pool).await?;
    let state = AppState::build(config, pool, Arc::new(SystemClock))?;

    match args.command {
        Command::Cleanup => {
            let removed = state.catalog.cleanup_expired().await?;
            tracing::info!("Removed {} expired meal cycle(s)", removed);
        }
        Command::RebuildMapping => {
            let report = state.mapping.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::AutoFill { meal } => {
            let filled = state.selections.auto_fill(meal).await?;
            tracing::info!("Auto-filled {} selection(s) for meal {}", filled, meal);
        }
        Command::NotifyUnselected { meal } => {
            let report = state.reminders.notify_unselected(meal).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::IssueToken { student } => {
            let student = StudentService::get(&state.pool, student)
                .await
                .with_context(|| format!("student {student}"))?;
            println!("{}", state.tokens.issue(student.id)?);
        }
        Command::CreateStaff { username, full_name, role, password, external_id } => {
            let role: Role = role.parse()?;
            let staff = StaffService::create(
                &state.pool,
                &NewStaff { username, password, full_name, role, external_id },
            )
            .await?;
            tracing::info!("Created staff account {} ({}) with id {}", staff.username, staff.role, staff.id);
        }
    }

    state.pool.close().await;
    Ok(())
}
