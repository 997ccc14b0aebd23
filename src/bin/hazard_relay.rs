//! hazard-relay
//!
//! Runs the fan-out service over an in-memory feed and directory, driven by
//! JSON lines on stdin. Each line is either `{"subscriber": {...}}` or
//! `{"hazard": {...}}`. Dropped push batches are written to stdout as JSON.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use hazardwatch::{
    load_config_with_source, ConfigSource, FailureReports, FanoutDispatcher, FanoutService, HazardConfig,
    HazardFeed, InMemoryHazardFeed, InMemorySubscriberDirectory, LoggingSender, NewHazard, SubscriberRecord,
};

struct Args {
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args { config_path: None };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("hazard-relay - road hazard fan-out relay");
                println!();
                println!("USAGE:");
                println!("    hazard-relay [OPTIONS] < input.jsonl");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <PATH>       TOML config file [default: built-in defaults]");
                println!("    -h, --help                Print help information");
                println!();
                println!("INPUT (one JSON object per line):");
                println!("    {{\"subscriber\": {{\"subscriber_id\": ..., \"location\": ..., \"delivery_address\": ...}}}}");
                println!("    {{\"hazard\": {{\"reporter_id\": ..., \"location\": ..., \"label\": ...}}}}");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    parsed
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Input {
    Subscriber(SubscriberRecord),
    Hazard(NewHazard),
}

fn init_logging(config: &HazardConfig) {
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries failure reports, so logs go to stderr.
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

fn print_reports(reports: &FailureReports, out: &mut impl Write) -> io::Result<()> {
    for report in reports.drain() {
        match serde_json::to_string(&report) {
            Ok(line) => writeln!(out, "{line}")?,
            Err(e) => tracing::error!(error = %e, "failed to encode failure report"),
        }
    }
    out.flush()
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    let (config, source) = load_config_with_source(args.config_path.as_deref())?;
    init_logging(&config);

    match &source {
        ConfigSource::File(path) => tracing::info!(path = %path, "config loaded"),
        ConfigSource::Missing(path) => tracing::info!(path = %path, "config file not found, using defaults"),
        ConfigSource::Defaults => tracing::debug!("no config file given, using defaults"),
    }

    tracing::info!(
        radius_km = config.fanout.radius_km,
        batch_size = config.fanout.batch_size,
        retry_count = config.fanout.retry_count,
        workers = config.fanout.workers,
        "hazard-relay starting"
    );

    let feed = Arc::new(InMemoryHazardFeed::new());
    let directory = Arc::new(InMemorySubscriberDirectory::new());
    let dispatcher = Arc::new(FanoutDispatcher::new(
        directory.clone(),
        Arc::new(LoggingSender),
        config.fanout.clone(),
    ));
    let reports = dispatcher.failure_reports();
    let service = FanoutService::start(feed.clone(), dispatcher, &config.fanout)?;

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for (line_no, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Input>(&line) {
            Ok(Input::Subscriber(record)) => {
                tracing::debug!(subscriber_id = %record.subscriber_id, "subscriber registered");
                directory.upsert(record)?;
            }
            Ok(Input::Hazard(draft)) => {
                let event_id = feed.append(draft)?;
                tracing::info!(%event_id, "hazard appended");
            }
            Err(e) => tracing::warn!(line = line_no + 1, error = %e, "skipping malformed input line"),
        }

        print_reports(&reports, &mut stdout)?;
    }

    let stats = service.shutdown();
    print_reports(&reports, &mut stdout)?;

    tracing::info!(
        received = stats.received,
        duplicates = stats.duplicates,
        dispatched = stats.dispatched,
        queue_dropped = stats.queue_dropped,
        dispatch_errors = stats.dispatch_errors,
        "hazard-relay finished"
    );
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
