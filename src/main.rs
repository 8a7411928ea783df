// loadgate - Main Entry Point
//
// Command line front end of the harness:
// - `run` executes a run plan and prints the JSON summary
// - `validate` performs every construction-time check without running
//
// Exit codes: 0 = all thresholds passed, 1 = a threshold failed,
// 2 = configuration or fatal error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loadgate::config::Config;
use loadgate::run::Run;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Exit code for configuration and fatal errors
const EXIT_ERROR: i32 = 2;

/// loadgate: load generation and threshold gating for live systems
#[derive(Parser, Debug)]
#[command(name = "loadgate")]
#[command(author = "loadgate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Multi-scenario load generation with chaos injection and threshold gates", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a run plan
    Run {
        /// Path to the TOML run plan
        plan: PathBuf,

        /// Override the target base address
        #[arg(long)]
        base_url: Option<String>,

        /// Write the JSON summary to a file instead of stdout
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
    /// Validate a run plan without executing it
    Validate {
        /// Path to the TOML run plan
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let code = match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn dispatch(args: Args) -> Result<i32> {
    match args.command {
        Commands::Run {
            plan,
            base_url,
            summary_out,
        } => {
            let mut config = Config::load_from_path(&plan)?;
            if let Some(url) = base_url {
                config.target.base_url = url;
            }
            init_tracing(&config, args.verbose)?;
            run_plan(&config, summary_out.as_deref()).await
        }
        Commands::Validate { plan } => {
            let config = Config::load_from_path(&plan)?;
            init_tracing(&config, args.verbose)?;
            let run = build_run(&config)?;
            println!(
                "Plan OK: {} scenarios ({}), {} thresholds",
                run.scenario_names().count(),
                run.scenario_names().collect::<Vec<_>>().join(", "),
                run.gate().thresholds().len()
            );
            Ok(0)
        }
    }
}

/// Initialize tracing from the plan's logging section
///
/// Logs go to stderr so stdout carries only the summary.
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

fn build_run(config: &Config) -> Result<Run> {
    let plan = config.plan()?;
    let connector = config.connector()?;
    Ok(Run::new(plan, connector)?)
}

async fn run_plan(config: &Config, summary_out: Option<&Path>) -> Result<i32> {
    let run = build_run(config)?;
    info!("Target: {}", config.target.base_url);

    let report = run.execute().await?;
    let summary = report.to_json().context("Failed to serialize run summary")?;

    match summary_out {
        Some(path) => {
            fs::write(path, &summary)
                .with_context(|| format!("Failed to write summary to {:?}", path))?;
            info!("Summary written to {:?}", path);
        }
        None => println!("{}", summary),
    }

    if !report.verdict.passed {
        for failure in report.verdict.failures() {
            eprintln!(
                "FAIL {} {} (observed: {})",
                failure.metric,
                failure.expression,
                failure
                    .observed
                    .map_or_else(|| "no samples".to_string(), |v| v.to_string())
            );
        }
    }
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["loadgate", "run", "plan.toml", "--base-url", "http://x:1"]);
        match args.command {
            Commands::Run {
                plan,
                base_url,
                summary_out,
            } => {
                assert_eq!(plan, PathBuf::from("plan.toml"));
                assert_eq!(base_url.as_deref(), Some("http://x:1"));
                assert!(summary_out.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_verbose_is_global() {
        let args = Args::parse_from(["loadgate", "validate", "plan.toml", "-v"]);
        assert!(args.verbose);
        assert!(matches!(args.command, Commands::Validate { .. }));
    }
}
