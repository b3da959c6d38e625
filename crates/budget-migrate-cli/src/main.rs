//! budget-migrate CLI - forklift, consistency checks and health of a live
//! PostgreSQL to MySQL migration.

use budget_migrate::{
    Config, ConsistencyReport, MigrateError, MigrationOrchestrator, MigrationPlan, MigrationRun,
    RunStatus,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Exit code when a run finished but a table was aborted.
const EXIT_PARTIAL_FAILURE: u8 = 2;
/// Exit code when rows failed with unexpected store errors.
const EXIT_UNEXPECTED_ERRORS: u8 = 3;
/// Exit code when a check found diverging tables.
const EXIT_DIVERGED: u8 = 5;

#[derive(Parser)]
#[command(name = "budget-migrate")]
#[command(about = "Live PostgreSQL to MySQL migration for the budget application")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the enabled tables from the primary into the secondary
    Forklift {
        /// Continue the run recorded in --state-file
        #[arg(long)]
        resume: bool,
    },

    /// Compare tables between the primary and the secondary
    Check {
        /// Table to check [default: every enabled table]
        #[arg(long)]
        table: Option<String>,
    },

    /// Show the copy order and settings without connecting
    Plan,

    /// Create missing tables in the secondary
    InitSchema,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Commands::Plan = cli.command {
        let plan = MigrationPlan::from_config(&config);
        print_plan(&plan, cli.output_json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut orchestrator = MigrationOrchestrator::new(config)?;
    if let Some(ref path) = cli.state_file {
        orchestrator = orchestrator.with_state_file(path.clone());
    }

    let code = match cli.command {
        Commands::Plan => ExitCode::SUCCESS, // handled above
        Commands::Forklift { resume } => {
            let run = if resume {
                if cli.state_file.is_none() {
                    return Err(MigrateError::config("--state-file is required for --resume"));
                }
                orchestrator.resume().await?
            } else {
                orchestrator.run().await?
            };
            print_run(&run, cli.output_json)?;
            run_exit_code(&run)
        }

        Commands::Check { table } => {
            let reports = orchestrator.check(table.as_deref()).await?;
            print_reports(&reports, cli.output_json)?;
            if reports.iter().all(|r| r.is_consistent()) {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_DIVERGED)
            }
        }

        Commands::InitSchema => {
            let tables = orchestrator.init_schema().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&tables)?);
            } else {
                println!("Secondary schema ready: {}", tables.join(", "));
            }
            ExitCode::SUCCESS
        }

        Commands::HealthCheck => {
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let config = orchestrator.config();
                println!("Health Check Results:");
                println!(
                    "  Primary ({}): {} ({}ms)",
                    config.primary.endpoint(),
                    if result.primary_connected { "OK" } else { "FAILED" },
                    result.primary_latency_ms
                );
                if let Some(ref err) = result.primary_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Secondary ({}): {} ({}ms)",
                    config.secondary.endpoint(),
                    if result.secondary_connected { "OK" } else { "FAILED" },
                    result.secondary_latency_ms
                );
                if let Some(ref err) = result.secondary_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                orchestrator.close().await;
                return Err(MigrateError::config("Health check failed"));
            }
            ExitCode::SUCCESS
        }
    };

    orchestrator.close().await;
    Ok(code)
}

fn run_exit_code(run: &MigrationRun) -> ExitCode {
    if run.status == RunStatus::PartialFailure {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    } else if !run.unexpected_errors.is_empty() {
        ExitCode::from(EXIT_UNEXPECTED_ERRORS)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_run(run: &MigrationRun, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    let status_msg = match run.status {
        RunStatus::PartialFailure => "Forklift finished with aborted tables",
        _ => "Forklift completed!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", run.run_id);
    for report in &run.tables {
        let copy = &report.copy;
        print!(
            "  {:<14} copied {:>8}  skipped {:>8}  failed {:>6}",
            copy.table, copy.rows_copied, copy.rows_skipped, copy.rows_failed
        );
        if let Some(ref reason) = copy.aborted {
            print!("  ABORTED: {}", reason);
        } else if copy.incomplete {
            print!("  INCOMPLETE");
        }
        if let Some(rows) = report.secondary_rows {
            print!("  secondary rows {}", rows);
        }
        if let Some(ref c) = report.consistency {
            if c.incomplete {
                print!("  check incomplete");
            } else {
                print!("  mismatches {} (missing {})", c.mismatches, c.missing_in_secondary);
            }
        }
        if let Some(orphans) = report.orphans.filter(|n| *n > 0) {
            print!("  orphans {}", orphans);
        }
        println!();
    }
    println!(
        "  Rows: {} copied, {} skipped, {} failed",
        run.rows_copied, run.rows_skipped, run.rows_failed
    );
    if let Some(ref table) = run.first_aborted_table {
        println!("  First aborted table: {}", table);
    }
    for err in &run.unexpected_errors {
        println!("  Error: {}", err);
    }
    Ok(())
}

fn print_reports(reports: &[ConsistencyReport], json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }

    println!("Consistency Check Results:");
    for r in reports {
        if r.incomplete {
            println!("  ? {} incomplete (store unreachable)", r.table);
            continue;
        }
        let status = if r.is_consistent() { "✓" } else { "✗" };
        println!(
            "  {} {} compared {}, mismatches {}, missing {}",
            status, r.table, r.rows_compared, r.mismatches, r.missing_in_secondary
        );
        for (column, count) in &r.column_mismatches {
            println!("      {}: {}", column, count);
        }
    }
    Ok(())
}

fn print_plan(plan: &MigrationPlan, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    println!("Forklift plan:");
    for t in &plan.tables {
        let depends = if t.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {}", t.depends_on.join(", "))
        };
        println!(
            "  {}. [{}] {} key ({}){}",
            t.order,
            if t.enabled { "x" } else { " " },
            t.name,
            t.natural_key.join(", "),
            depends
        );
    }
    println!(
        "  fetch_size {}, suspend_foreign_keys {}, check_after_copy {}, verify_references {}",
        plan.fetch_size, plan.suspend_foreign_keys, plan.check_after_copy, plan.verify_references
    );
    for warning in &plan.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries results, so logs go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
