//! Convoy - release orchestration
//!
//! Usage:
//!   convoy diff [SCOPE]         # Intent vs State changes
//!   convoy sync [SCOPE]         # Apply Intent to State, queueing deploy runs
//!   convoy work [SCOPE]         # List work a worker would pick up
//!   convoy status <RELEASE>     # Release and per-work statuses
//!   convoy get <REF>            # Print a document
//!   convoy set <REF> <JSON>     # Declare an Intent document

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use convoy_core::package::{FunctionContext, FunctionDef, FunctionRunner, WorkResult};
use convoy_core::release::release_status;
use convoy_core::state::{diff, sync};
use convoy_core::worker::WorkFilter;
use convoy_core::{EngineContext, RefAccess, Ref};

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Release orchestration engine", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/convoy/convoy.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show changes needed to make State match Intent
    Diff {
        /// Package glob
        #[arg(default_value = "**")]
        scope: String,
    },

    /// Apply every Intent change to State
    Sync {
        /// Package glob
        #[arg(default_value = "**")]
        scope: String,
    },

    /// List the work a worker would execute now
    Work {
        /// Package glob
        #[arg(default_value = "**")]
        scope: String,
    },

    /// Show the status of a release (e.g. github.com/acme/app/-/deploy.star/@)
    Status { release: String },

    /// Print the document at a ref
    Get {
        reference: String,
        /// Read from Intent instead of State
        #[arg(long)]
        intent: bool,
    },

    /// Write a JSON document to Intent
    Set {
        reference: String,
        /// JSON body
        body: String,
        /// Document type recorded alongside the body
        #[arg(long, default_value = "custom")]
        body_type: String,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable lines
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

/// Functions run inside a worker process with a package evaluator, never here.
fn no_runner() -> Arc<dyn FunctionRunner> {
    Arc::new(
        |function: &FunctionDef, _: &FunctionContext| -> anyhow::Result<WorkResult> {
            anyhow::bail!("cannot execute function '{}' from the command line", function.id)
        },
    )
}

fn parse_ref(s: &str) -> Result<Ref> {
    Ref::parse(s).with_context(|| format!("Invalid ref '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let context = EngineContext::load(cli.config.as_deref())?;
    debug!(config = ?context.config_path(), "loaded configuration");
    let format = cli.format;

    match cli.command {
        Commands::Diff { scope } => {
            let entries = diff(context.intent(), context.state(), &scope)?;
            match format {
                OutputFormat::Json => print_json(&entries)?,
                OutputFormat::Table => {
                    if entries.is_empty() {
                        println!("State matches Intent");
                    }
                    for entry in entries {
                        println!("{:<8} {}", entry.change.to_string(), entry.reference);
                    }
                }
            }
        }
        Commands::Sync { scope } => {
            info!(%scope, "syncing intent to state");
            let report = sync(context.intent(), context.state(), &scope)?;
            for (reference, err) in &report.failed {
                error!(%reference, error = %err, "change failed to apply");
            }
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => {
                    for (reference, outcome) in &report.applied {
                        println!("ok     {} {:?}", reference, outcome);
                    }
                    for (reference, error) in &report.failed {
                        println!("failed {} {}", reference, error);
                    }
                }
            }
            if !report.is_clean() {
                anyhow::bail!("{} changes failed to apply", report.failed.len());
            }
        }
        Commands::Work { scope } => {
            let worker = context.worker(no_runner());
            let work = worker.identify_work(&WorkFilter::scoped(scope))?;
            match format {
                OutputFormat::Json => print_json(&work)?,
                OutputFormat::Table => {
                    for item in work {
                        println!("{:<14} {}", item.kind.to_string(), item.reference);
                    }
                }
            }
        }
        Commands::Status { release } => {
            let status = release_status(context.state(), &parse_ref(&release)?)?;
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => {
                    println!("{} {}", status.release, status.status);
                    for work in status.work {
                        let state = work
                            .status
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!("  {:<10} {}", state, work.work);
                    }
                }
            }
        }
        Commands::Get { reference, intent } => {
            let reference = parse_ref(&reference)?;
            let store = if intent {
                context.intent()
            } else {
                context.state()
            };
            print_json(&store.get(&reference)?)?;
        }
        Commands::Set {
            reference,
            body,
            body_type,
        } => {
            let reference = parse_ref(&reference)?;
            if !reference.is_intent() {
                anyhow::bail!("{} is not an intent ref", reference);
            }
            let body: serde_json::Value =
                serde_json::from_str(&body).context("Body is not valid JSON")?;
            context.intent().set(&reference, &body_type, &body)?;
            info!(%reference, %body_type, "intent written");
        }
    }

    Ok(())
}
