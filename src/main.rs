//! SeqRunner CLI Entry Point
//!
//! Provides command-line interface for sequence execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a sequence
//! seqrunner sequence.yaml
//!
//! # With an external backup sequence
//! seqrunner sequence.yaml --backup rescue.yaml
//!
//! # Limit the backup chain and the run time
//! seqrunner sequence.yaml --max-depth 2 --timeout 60
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use seqrunner::action::ActionRegistry;
use seqrunner::execution::SequenceEngine;
use seqrunner::monitoring::{ExecutionTimeline, FanoutSink, LogForwarder, LogSink};
use seqrunner::sequence::{load_sequence, LoadOptions, MAX_SECONDS};
use seqrunner::{APP_NAME, VERSION};

/// Default sequence file used when none is specified.
const DEFAULT_SEQUENCE: &str = "sequence.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    sequence_path: Option<String>,
    backup_file: Option<PathBuf>,
    max_depth: Option<usize>,
    timeout: Option<Duration>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Concurrent Sequence Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: seqrunner [OPTIONS] <SEQUENCE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <SEQUENCE_FILE>     Path to sequence YAML file (default: {})", DEFAULT_SEQUENCE);
    println!();
    println!("Options:");
    println!("  --backup FILE       Backup sequence run if the main sequence fails");
    println!("  --max-depth N       Maximum depth of the backup chain");
    println!("  --timeout SECS      Interrupt the run after SECS seconds");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  seqrunner main.yaml");
    println!("  seqrunner main.yaml --backup rescue.yaml --max-depth 2");
    println!("  seqrunner main.yaml --timeout 30 --verbose");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses a timeout in seconds, bounded like sequence durations.
fn parse_timeout(value: &str) -> Result<Duration, String> {
    let invalid = || format!("Invalid timeout: {}", value);
    let secs: f64 = value.parse().map_err(|_| invalid())?;
    if !(0.0..=MAX_SECONDS).contains(&secs) {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--backup" => {
                config.backup_file = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--max-depth" => {
                let value = option_value(args, &mut i, arg)?;
                config.max_depth = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid max depth: {}", value))?,
                );
            }
            "--timeout" => {
                let value = option_value(args, &mut i, arg)?;
                config.timeout = Some(parse_timeout(value)?);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.sequence_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.sequence_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Main application entry point. Returns whether the sequence succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let mut options = LoadOptions::default();
    if let Some(depth) = config.max_depth {
        info!("Maximum backup depth: {}", depth);
        options = options.with_max_depth(depth);
    }
    if let Some(path) = &config.backup_file {
        info!("Backup sequence: {}", path.display());
        options = options.with_backup_file(path);
    }

    // Load sequence
    let path = config
        .sequence_path
        .unwrap_or_else(|| DEFAULT_SEQUENCE.to_string());
    let sequence = load_sequence(&path, &options).map_err(|e| {
        error!("Failed to load sequence: {}", e);
        format!("Could not load sequence from '{}': {}", path, e)
    })?;

    info!(
        "Sequence loaded: {} blocks, {} subsequences",
        sequence.len(),
        sequence.subsequences.len()
    );

    // Create engine
    let timeline = Arc::new(ExecutionTimeline::new());
    let sink = FanoutSink::new()
        .with(Arc::new(LogForwarder))
        .with(timeline.clone() as Arc<dyn LogSink>);
    let mut engine = SequenceEngine::new(Arc::new(ActionRegistry::with_builtins()), Arc::new(sink));

    // Execute sequence
    engine.load(sequence)?;
    engine.start()?;

    let finished = engine.wait(config.timeout);
    if !finished {
        warn!("Timeout reached; interrupting the sequence");
        engine.interrupt();
        engine.wait(None);
    }

    println!();
    println!("{}", timeline.summary());
    if config.verbose {
        println!("{}", timeline.gantt_chart());
    }

    let report = engine
        .last_report()
        .ok_or("The run ended without a report")?;
    if report.backup_count() > 0 {
        info!("{} backup sequence(s) were run", report.backup_count());
    }
    info!("Total execution time: {} ms", report.duration_ms);

    Ok(finished && report.success)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => {
            println!("Sequence completed successfully");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("Sequence failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("seqrunner")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_timeout() {
        let config = parse_arguments(&args(&["main.yaml", "--timeout", "2.5"])).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.sequence_path.as_deref(), Some("main.yaml"));
    }

    #[test]
    fn test_reject_unusable_timeout() {
        for value in ["1e20", "NaN", "inf", "-1", "soon"] {
            let err = parse_arguments(&args(&["--timeout", value])).unwrap_err();
            assert_eq!(err, format!("Invalid timeout: {}", value));
        }
    }

    #[test]
    fn test_timeout_requires_value() {
        let err = parse_arguments(&args(&["--timeout"])).unwrap_err();
        assert!(err.contains("requires an argument"));
    }
}
