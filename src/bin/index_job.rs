//! Index Job Binary - one time-boxed scan/index invocation
//!
//! Resumes from the stored progress record, indexes as many pageviews as the
//! budget allows, checkpoints, and prints a JSON report on stdout. Meant to be
//! run on a schedule; each run picks up where the last one stopped.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin index_job
//! cargo run --release --bin index_job -- --reset --budget-ms 30000
//! echo '{"window_hours":48}' | cargo run --release --bin index_job -- --request -
//! ```
//!
//! ## Flags
//!
//! - `--request <file|->` - JobRequest JSON (flags below override its fields)
//! - `--pattern <glob>`, `--chunk-size <n>`, `--cursor <cursor>`
//! - `--window-hours <h>`, `--budget-ms <ms>`, `--reset`
//!
//! Environment variables: see `AttribConfig::from_env`. `RUST_LOG` sets the
//! log level (default: info).

use attribflow::api::{JobRequest, JobResponse};
use attribflow::config::AttribConfig;
use attribflow::pipeline::{IndexJob, JobError};
use std::env;
use std::io::Read;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn parse_flag<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, Box<dyn std::error::Error>> {
    match arg_value(args, flag) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: {}", flag, raw).into()),
        None => Ok(None),
    }
}

fn read_request(args: &[String]) -> Result<JobRequest, Box<dyn std::error::Error>> {
    let mut request = match arg_value(args, "--request").as_deref() {
        Some("-") => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            serde_json::from_str(&body)?
        }
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => JobRequest::default(),
    };

    if let Some(pattern) = arg_value(args, "--pattern") {
        request.pattern = Some(pattern);
    }
    if let Some(cursor) = arg_value(args, "--cursor") {
        request.start_cursor = Some(cursor);
    }
    if let Some(n) = parse_flag(args, "--chunk-size")? {
        request.chunk_size = Some(n);
    }
    if let Some(h) = parse_flag(args, "--window-hours")? {
        request.window_hours = Some(h);
    }
    if let Some(ms) = parse_flag(args, "--budget-ms")? {
        request.budget_ms = Some(ms);
    }
    if args.iter().any(|a| a == "--reset") {
        request.reset = true;
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let request = read_request(&args)?;
    let config = AttribConfig::from_env()?;

    log::info!("🚀 Starting index job {}", config.job.job_name);
    log::info!("   Pattern: {}", request.pattern.as_deref().unwrap_or(&config.job.scan_pattern));
    log::info!("   Budget: {}ms", request.budget_ms.unwrap_or(config.job.budget.as_millis() as u64));
    log::info!("   Reset: {}", request.reset);

    let store = config.open_store()?;
    let job = IndexJob::new(store, config.job.clone());

    match job.run(&request).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&JobResponse::from(&report))?);
            if let Some(failed) = &report.failed_chunk {
                log::warn!("⚠️  Partial run: {}", failed);
            }
            Ok(())
        }
        Err(e) => {
            match &e {
                JobError::Store(inner) => log::error!("❌ Fatal store error ({}): {}", inner.kind(), inner),
                JobError::Config(inner) => log::error!("❌ Configuration error: {}", inner),
            }
            Err(e.into())
        }
    }
}
