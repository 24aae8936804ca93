//! cvrun CLI - runs the testsets described by a JSON manifest.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::BoolishValueParser;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use cvrun::config::{self, Config, DEFAULT_CONFIG_FILE};
use cvrun::connector::ScriptConnector;
use cvrun::manifest::{RunFilter, RunManifest, convert, parse_manifest};
use cvrun::orchestrator::{RunController, RunOutcome};
use cvrun::report::{ConsoleReporter, SendmailNotifier, render_tables};
use cvrun::testcase::TestCaseRegistry;

const LOG_FILE: &str = "Automation.log";

/// Long options that used to be spelled with a single dash.
const LEGACY_FLAGS: [&str; 12] = [
    "json",
    "inputJSON",
    "tc",
    "testcase",
    "ts",
    "testset",
    "oc",
    "outputConsole",
    "of",
    "outputTofile",
    "otc",
    "outputTableToConsole",
];

#[derive(Parser)]
#[command(name = "cvrun")]
#[command(about = "Runs the testsets of a JSON automation manifest", long_about = None)]
#[command(version)]
struct Cli {
    /// Input JSON manifest
    #[arg(long = "inputJSON", visible_alias = "json", value_name = "PATH")]
    input_json: PathBuf,

    /// Only run these test case ids (repeatable or comma-separated)
    #[arg(long = "testcase", visible_alias = "tc", value_name = "ID", value_delimiter = ',')]
    testcases: Vec<u64>,

    /// Only run these testsets, case-insensitive (repeatable or comma-separated)
    #[arg(long = "testset", visible_alias = "ts", value_name = "NAME", value_delimiter = ',')]
    testsets: Vec<String>,

    /// Convert the manifest into testset form and exit without running
    #[arg(short = 'c', long)]
    convert: bool,

    /// Output file for --convert (default: stdout)
    #[arg(short = 'o', long = "outputFile", value_name = "PATH")]
    output_file: Option<PathBuf>,

    /// Print testset summaries as JSON after the run
    #[arg(
        long = "outputConsole",
        visible_alias = "oc",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    output_console: Option<bool>,

    /// Write testset summaries as JSON to a file after the run
    #[arg(long = "outputTofile", visible_alias = "of", value_name = "PATH")]
    output_to_file: Option<PathBuf>,

    /// Print one result table per testset after the run
    #[arg(long = "outputTableToConsole", visible_alias = "otc")]
    output_table: bool,

    /// Harness configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Rewrites single-dash long options (`-json x`, `-tc 1`) to their
/// double-dash form. `-opt=value` is handled as well.
fn normalize_legacy_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            let Some(rest) = text.strip_prefix('-').filter(|r| !r.starts_with('-')) else {
                return arg;
            };
            let flag = rest.split('=').next().unwrap_or(rest);
            if LEGACY_FLAGS.contains(&flag) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_from(normalize_legacy_args(std::env::args_os()));

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let config = match config::load_config_or_default(&config_path, explicit) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config, cli.verbose);

    let run_id = Uuid::new_v4();
    let code = match execute(cli, config).instrument(info_span!("run", id = %run_id)).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Installs a stderr layer and, when the log directory is usable, a plain
/// layer appending to `Automation.log`.
fn init_logging(config: &Config, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = config.harness.log_dir();
    let log_path = log_dir.join(LOG_FILE);
    let file = std::fs::create_dir_all(&log_dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&log_path));

    let (file_layer, file_error) = match file {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init();

    if let Some(e) = file_error {
        warn!("Cannot write {}: {}", log_path.display(), e);
    }
}

async fn execute(cli: Cli, config: Config) -> Result<i32> {
    let manifest = parse_manifest(&cli.input_json)
        .with_context(|| format!("Failed to load manifest {}", cli.input_json.display()))?;
    let registry = TestCaseRegistry::from_config(&config);
    let filter = RunFilter::new()
        .with_testsets(&cli.testsets)
        .with_testcases(cli.testcases.iter().copied());

    if cli.convert {
        convert_manifest(&manifest, &registry, &filter, cli.output_file.as_deref())?;
        return Ok(0);
    }

    info!("{}", "*".repeat(80));
    info!("Started executing automation run for job {}", manifest.job_label());
    info!("{}", "*".repeat(80));

    let connector = ScriptConnector::new(config.connector.clone(), config.harness.shell.clone());
    let notifier = SendmailNotifier::new(config.email.command.clone(), config.harness.shell.clone());

    let outcome = RunController::new(config, manifest, registry, connector, notifier)
        .with_reporter(ConsoleReporter::new(cli.verbose))
        .with_filter(filter)
        .run()
        .await;

    if let Err(e) = write_outputs(&cli, &outcome) {
        error!("Failed to write run outputs: {:#}", e);
    }

    info!("{}", "*".repeat(80));
    info!("Finished executing automation run for job {}", outcome.job);
    info!("{}", "*".repeat(80));

    Ok(outcome.exit_code())
}

fn convert_manifest(
    manifest: &RunManifest,
    registry: &TestCaseRegistry,
    filter: &RunFilter,
    output: Option<&Path>,
) -> Result<()> {
    let converted = convert::normalize(manifest, registry, filter)?;
    let json = serde_json::to_string_pretty(&converted)?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Converted manifest written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn write_outputs(cli: &Cli, outcome: &RunOutcome) -> Result<()> {
    if cli.output_console.unwrap_or(false) {
        println!("{}", serde_json::to_string_pretty(&outcome.summaries)?);
    }

    if let Some(path) = &cli.output_to_file {
        let json = serde_json::to_string_pretty(&outcome.summaries)?;
        std::fs::write(path, format!("{json}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Testset summaries written to {}", path.display());
    }

    if cli.output_table {
        print!("{}", render_tables(&outcome.summaries, console::colors_enabled()));
    }
    Ok(())
}
