use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use snapflow::config::SnapflowConfig;
use snapflow::scheduler::format_delay;
use snapflow::Engine;

#[derive(Parser)]
#[command(
    name = "snapflow",
    about = "Scheduling and execution engine for automated test campaigns",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler loop + worker pool)
    Serve,

    /// Run one scheduling pass and execute whatever it scheduled
    Tick {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Orchestrate one pending execution now
    Run {
        /// Execution id
        #[arg(long)]
        execution: i64,
    },

    /// Inspect the schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Preview what will run in the next N hours
    Upcoming {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// List configurations that missed their expected run
    Overdue,

    /// List configurations the next pass would act on
    Due,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = tracing::subscriber::with_default(snapflow::bootstrap_subscriber(), || {
        SnapflowConfig::resolve(cli.config.as_deref())
    })?;
    snapflow::init_logging(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(db_path = %config.storage.database_path, "Starting snapflow daemon");
            snapflow::serve(config).await?;
        }
        Commands::Tick { json } => {
            let engine = Engine::open(&config)?;
            let report = engine
                .tick_and_drain(config.scheduler.workers, config.scheduler.queue_capacity)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Executed:      {:?}", report.pending);
                println!("Not executed:  {:?}", report.missed);
                println!("Skipped:       {:?}", report.skipped);
                if !report.failed.is_empty() {
                    println!("Failed:        {:?}", report.failed);
                }
                if !report.superseded.is_empty() {
                    println!("Superseded:    {:?}", report.superseded);
                }
            }
        }
        Commands::Run { execution } => {
            let engine = Engine::open(&config)?;
            match engine.orchestrator.run(execution).await? {
                Some(status) => println!("Execution {execution} finished: {}", status.label()),
                None => println!("Execution {execution} is not pending, nothing to do."),
            }
        }
        Commands::Schedule { action } => {
            let engine = Engine::open(&config)?;
            let scheduler = engine.scheduler.clone();
            tokio::task::spawn_blocking(move || print_schedule(&scheduler, action))
                .await
                .context("schedule query panicked")??;
        }
    }

    Ok(())
}

fn print_schedule(scheduler: &snapflow::scheduler::Scheduler, action: ScheduleAction) -> Result<()> {
    match action {
        ScheduleAction::Upcoming { hours } => {
            let runs = scheduler.upcoming(hours)?;
            if runs.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in runs {
                    println!(
                        "{} : {} (#{}, {} scripts)",
                        run.at.format("%Y-%m-%d %H:%M"),
                        run.name,
                        run.configuration_id,
                        run.scripts
                    );
                }
            }
        }
        ScheduleAction::Overdue => {
            let overdue = scheduler.overdue()?;
            if overdue.is_empty() {
                println!("No overdue configurations.");
            } else {
                println!("{:<6} | {:<30} | {:<16} | Delay", "Id", "Name", "Expected");
                println!("{:-<6}-|-{:-<30}-|-{:-<16}-|-{:-<10}", "", "", "", "");
                for o in overdue {
                    println!(
                        "{:<6} | {:<30} | {:<16} | {}",
                        o.configuration_id,
                        o.name,
                        o.expected_at.format("%Y-%m-%d %H:%M"),
                        format_delay(chrono::Duration::seconds(o.delay_secs))
                    );
                }
            }
        }
        ScheduleAction::Due => {
            let due = scheduler.due_now()?;
            if due.is_empty() {
                println!("Nothing is due.");
            } else {
                for (config, decision) in due {
                    println!("{:<6} | {:<30} | {} | {:?}", config.id, config.name, config.periodicity, decision);
                }
            }
        }
    }
    Ok(())
}
