//! Lumen CLI - Command-line interface for Lumen Telemetry
//!
//! Commands:
//! - replay: Replay recorded UI signals into an NDJSON event store
//! - validate: Validate UI signal schema and ordering
//! - config: Print the effective pipeline configuration
//! - doctor: Diagnose configuration, stores and environment

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use lumen_telemetry::principal::{FileHandleStore, HandleStore};
use lumen_telemetry::signals::{Replayer, SignalAdapter, UiSignal, SCHEMA_VERSION};
use lumen_telemetry::transport::{NdjsonStore, StoreLine};
use lumen_telemetry::{PipelineConfig, TelemetryError, LUMEN_VERSION, PRODUCER_NAME};

/// Lumen - behavioral telemetry pipeline and stuck detection
#[derive(Parser)]
#[command(name = "lumen")]
#[command(version = LUMEN_VERSION)]
#[command(about = "Replay, validate and inspect learning telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay UI signals through the pipeline into an NDJSON store
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// NDJSON store file the events are appended to
        #[arg(short, long)]
        store: PathBuf,

        /// Input format
        #[arg(long, default_value = "auto")]
        input_format: InputFormat,

        /// Pipeline configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the flush interval in milliseconds
        #[arg(long)]
        flush_interval_ms: Option<u64>,

        /// Output the replay report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate UI signal schema and timestamp ordering
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "auto")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective pipeline configuration
    Config {
        /// Pipeline configuration file (JSON); defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration, stores and environment
    Doctor {
        /// Pipeline configuration file to check
        #[arg(long)]
        config: Option<PathBuf>,

        /// NDJSON store file to check
        #[arg(long)]
        store: Option<PathBuf>,

        /// Guest credential file to check
        #[arg(long)]
        handle_file: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Detect from the first character
    Auto,
    /// Newline-delimited JSON (one signal per line)
    Ndjson,
    /// JSON array of signals
    Json,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LUMEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<(), LumenCliError> {
    match cli.command {
        Commands::Replay {
            input,
            store,
            input_format,
            config,
            flush_interval_ms,
            json,
        } => cmd_replay(
            &input,
            &store,
            input_format,
            config.as_deref(),
            flush_interval_ms,
            json,
        ),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Config { config } => cmd_config(config.as_deref()),

        Commands::Doctor {
            config,
            store,
            handle_file,
            json,
        } => cmd_doctor(
            config.as_deref(),
            store.as_deref(),
            handle_file.as_deref(),
            json,
        ),
    }
}

fn cmd_replay(
    input: &Path,
    store: &Path,
    input_format: InputFormat,
    config: Option<&Path>,
    flush_interval_ms: Option<u64>,
    json: bool,
) -> Result<(), LumenCliError> {
    let mut config = load_config(config)?;
    if let Some(ms) = flush_interval_ms {
        config.flush_interval_ms = ms;
        config.validate()?;
    }

    let signals = read_signals(input, &input_format)?;
    if signals.is_empty() {
        return Err(LumenCliError::NoSignals);
    }

    let report = Replayer::new(config, NdjsonStore::new(store)).run(&signals)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Replay Report");
        println!("=============");
        println!("Signals:        {}", report.signals);
        println!("Events logged:  {}", report.events_logged);
        println!("Suppressed:     {}", report.suppressed);
        println!("Sessions:       {}", report.sessions.len());
        println!("Stuck events:   {}", report.stuck_events.len());
        for stuck in &report.stuck_events {
            println!(
                "  - {} ({}): {}",
                stuck.problem_id.as_deref().unwrap_or("-"),
                stuck.timestamp.to_rfc3339(),
                stuck.reason
            );
        }
        println!("Queued at end:  {}", report.final_state.queued_events);
        println!("Store:          {}", store.display());
    }

    Ok(())
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), LumenCliError> {
    let signals = read_signals(input, &input_format)?;
    let results = SignalAdapter::validate_signals(&signals);

    let report = ValidationReport {
        total_signals: signals.len(),
        valid_signals: signals.len() - results.len(),
        invalid_signals: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                signal_id: r.signal_id.clone(),
                error: r.error.to_string(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total signals:   {}", report.total_signals);
        println!("Valid signals:   {}", report.valid_signals);
        println!("Invalid signals: {}", report.invalid_signals);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - Signal {} (index {}): {}",
                    err.signal_id.as_deref().unwrap_or("unknown"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_signals > 0 {
        Err(LumenCliError::ValidationFailed(report.invalid_signals))
    } else {
        Ok(())
    }
}

fn cmd_config(config: Option<&Path>) -> Result<(), LumenCliError> {
    let config = load_config(config)?;
    println!("{}", config.to_json_pretty()?);
    Ok(())
}

fn cmd_doctor(
    config: Option<&Path>,
    store: Option<&Path>,
    handle_file: Option<&Path>,
    json: bool,
) -> Result<(), LumenCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "lumen_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Lumen version {}", LUMEN_VERSION),
    });

    checks.push(DoctorCheck {
        name: "schema_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Input schema: {}", SCHEMA_VERSION),
    });

    checks.push(match load_config(config) {
        Ok(cfg) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "Flush every {} ms, click merge {} ms, scroll bucket {}%",
                cfg.flush_interval_ms, cfg.click_merge_ms, cfg.scroll_threshold_pct
            ),
        },
        Err(e) => DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Error,
            message: CliError::from(e).message,
        },
    });

    if let Some(store_path) = store {
        checks.push(if store_path.exists() {
            match NdjsonStore::read_lines(store_path) {
                Ok(lines) => {
                    let events = lines
                        .iter()
                        .filter(|l| matches!(l, StoreLine::AppendEvent { .. }))
                        .count();
                    let sessions = lines
                        .iter()
                        .filter(|l| matches!(l, StoreLine::AppendSession { .. }))
                        .count();
                    DoctorCheck {
                        name: "store".to_string(),
                        status: CheckStatus::Ok,
                        message: format!("Store readable ({} sessions, {} events)", sessions, events),
                    }
                }
                Err(e) => DoctorCheck {
                    name: "store".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Invalid store file: {}", e),
                },
            }
        } else {
            DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Warning,
                message: "Store file does not exist yet".to_string(),
            }
        });
    }

    if let Some(handle_path) = handle_file {
        checks.push(match FileHandleStore::new(handle_path).load() {
            Ok(Some(credential)) => DoctorCheck {
                name: "guest_credential".to_string(),
                status: CheckStatus::Ok,
                message: format!("Guest handle {}", credential.handle),
            },
            Ok(None) => DoctorCheck {
                name: "guest_credential".to_string(),
                status: CheckStatus::Warning,
                message: "No guest credential stored; one is created on first session".to_string(),
            },
            Err(e) => DoctorCheck {
                name: "guest_credential".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot read guest credential: {}", e),
            },
        });
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (use --input - to replay from it)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: LUMEN_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Lumen Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(LumenCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn read_input(input: &Path) -> Result<String, LumenCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn read_signals(input: &Path, format: &InputFormat) -> Result<Vec<UiSignal>, LumenCliError> {
    let data = read_input(input)?;
    let signals = match format {
        InputFormat::Auto => SignalAdapter::parse_auto(&data)?,
        InputFormat::Ndjson => SignalAdapter::parse_ndjson(&data)?,
        InputFormat::Json => SignalAdapter::parse_array(&data)?,
    };
    Ok(signals)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, LumenCliError> {
    match path {
        Some(path) => Ok(PipelineConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(PipelineConfig::default()),
    }
}

// Error types

#[derive(Debug)]
enum LumenCliError {
    Io(io::Error),
    Telemetry(TelemetryError),
    Json(serde_json::Error),
    NoSignals,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for LumenCliError {
    fn from(e: io::Error) -> Self {
        LumenCliError::Io(e)
    }
}

impl From<TelemetryError> for LumenCliError {
    fn from(e: TelemetryError) -> Self {
        LumenCliError::Telemetry(e)
    }
}

impl From<serde_json::Error> for LumenCliError {
    fn from(e: serde_json::Error) -> Self {
        LumenCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<LumenCliError> for CliError {
    fn from(e: LumenCliError) -> Self {
        match e {
            LumenCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            LumenCliError::Telemetry(TelemetryError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'lumen config' to see the defaults".to_string()),
            },
            LumenCliError::Telemetry(e) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure input matches the lumen.ui_signal.v1 schema".to_string()),
            },
            LumenCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            LumenCliError::NoSignals => CliError {
                code: "NO_SIGNALS".to_string(),
                message: "No signals found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            LumenCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} signals failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            LumenCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_signals: usize,
    valid_signals: usize,
    invalid_signals: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    signal_id: Option<String>,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
