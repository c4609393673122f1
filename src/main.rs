use anyhow::{bail, Context, Result};
use mart_sync::config::LoggingConfig;
use mart_sync::pipeline;
use mart_sync::{setup_database, EventLog, Fanout, MartConfig, Observer, Session, TracingObserver};
use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "mart-sync.toml";

const USAGE: &str = "usage: mart-sync [--config PATH] <init|ingest|dedup|balance|refresh|run|status>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Init,
    Ingest,
    Dedup,
    Balance,
    Refresh,
    Run,
    Status,
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let args = parse_args(&args)?;

    let config = load_config(args.config.as_deref())?;
    init_logging(&config.logging)?;

    tracing::info!(version = mart_sync::VERSION, database = %config.database.display(), "mart-sync starting");

    let mut session = Session::open(&config.database)
        .with_context(|| format!("cannot open store {}", config.database.display()))?;

    let outcome = execute(&mut session, &config, args.command);
    let closed = session.close();

    outcome?;
    closed?;
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut command = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => match iter.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path\n{}", USAGE),
            },
            "-h" | "--help" => bail!(USAGE),
            other if command.is_none() => {
                command = Some(match other {
                    "init" => Command::Init,
                    "ingest" => Command::Ingest,
                    "dedup" => Command::Dedup,
                    "balance" => Command::Balance,
                    "refresh" => Command::Refresh,
                    "run" => Command::Run,
                    "status" => Command::Status,
                    _ => bail!("unknown command '{}'\n{}", other, USAGE),
                })
            }
            other => bail!("unexpected argument '{}'\n{}", other, USAGE),
        }
    }

    match command {
        Some(command) => Ok(Args { config, command }),
        None => bail!(USAGE),
    }
}

/// Explicit path must exist; otherwise `mart-sync.toml` is used when present
fn load_config(path: Option<&Path>) -> Result<MartConfig> {
    let config = match path {
        Some(path) => MartConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => MartConfig::load(Path::new(DEFAULT_CONFIG))?,
        None => {
            let config = MartConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

/// RUST_LOG wins over the configured level
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

fn execute(session: &mut Session, config: &MartConfig, command: Command) -> Result<()> {
    setup_database(session.conn())?;

    let mut tracing_sink = TracingObserver;
    let mut events = EventLog::new();

    let outcome = {
        let mut observer = Fanout::new(vec![&mut tracing_sink as &mut dyn Observer, &mut events]);
        dispatch(session, config, command, &mut observer)
    };

    // Audit events are written even when the run failed
    match events.persist(session) {
        Ok(count) => tracing::debug!(run_id = %events.run_id, count, "audit events persisted"),
        Err(err) => tracing::warn!(error = %err, "could not persist audit events"),
    }

    outcome
}

fn dispatch(
    session: &mut Session,
    config: &MartConfig,
    command: Command,
    observer: &mut dyn Observer,
) -> Result<()> {
    match command {
        Command::Init => {
            println!("✓ Schema ready in {}", config.database.display());
        }
        Command::Ingest => {
            println!("📥 Loading raw files...");
            for report in pipeline::ingest_raw(session, config, observer)? {
                println!(
                    "✓ {}: {} inserted, {} skipped{}",
                    report.table,
                    report.inserted,
                    report.skipped,
                    if report.replaced { " (replaced)" } else { "" }
                );
            }
        }
        Command::Dedup => {
            println!("🔍 Removing duplicate versions...");
            for report in pipeline::deduplicate(session, config, observer)? {
                println!(
                    "✓ {}: {} row(s) removed from {} group(s)",
                    report.table, report.removed, report.groups
                );
            }
        }
        Command::Balance => match pipeline::reconcile_balances(session, config, observer)? {
            Some(report) => println!(
                "⚖️  {}: {} opening, {} closing value(s) corrected",
                report.series, report.forward_fixed, report.backward_fixed
            ),
            None => println!("Balance reconciliation disabled"),
        },
        Command::Refresh => {
            println!("🔄 Refreshing marts...");
            for report in pipeline::refresh_marts(session, config, observer)? {
                println!(
                    "✓ {}: {} (-{} +{})",
                    report.mart, report.applied, report.deleted, report.inserted
                );
            }
        }
        Command::Run => {
            let report = pipeline::run(session, config, observer)?;
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("✅ {}", report.summary());
        }
        Command::Status => print_status(&pipeline::status(session.conn(), config)?),
    }

    Ok(())
}

fn print_status(status: &mart_sync::StatusReport) {
    println!("📊 Marts");
    for mart in &status.marts {
        println!(
            "   {}: {} missing / {} present (ratio {:.3}) → {}",
            mart.mart,
            mart.gap.missing,
            mart.gap.total,
            mart.gap.ratio(),
            mart.strategy
        );
    }

    println!("🔍 Duplicates");
    for dup in &status.duplicates {
        println!("   {}: {} group(s), {} removable row(s)", dup.table, dup.groups, dup.removable);
    }

    println!("⚖️  Balance breaks: {}", status.balance_breaks.len());
    for brk in status.balance_breaks.iter().take(10) {
        println!(
            "   account {} {} → {}: closing {:?} vs opening {:?}",
            brk.account_key, brk.period, brk.next_period, brk.closing_value, brk.next_opening_value
        );
    }
}
