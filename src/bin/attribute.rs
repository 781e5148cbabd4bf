//! Attribution Binary - match a conversion to its touchpoints
//!
//! Reads an AttributionRequest as JSON and prints ranked matches, or with
//! `--journey` the full journey, or with `--summary` the cached journey summary.
//!
//! ## Usage
//!
//! ```bash
//! echo '{"conversion_timestamp":"2025-07-01T12:00:00Z","session_id":"S1"}' \
//!     | cargo run --release --bin attribute
//! cargo run --release --bin attribute -- --request conversion.json --journey
//! ```
//!
//! Environment variables: see `AttribConfig::from_env`. `RUST_LOG` sets the
//! log level (default: info).

use attribflow::api::AttributionRequest;
use attribflow::attribution::AttributionService;
use attribflow::config::AttribConfig;
use std::env;
use std::io::Read;

fn read_request(args: &[String]) -> Result<AttributionRequest, Box<dyn std::error::Error>> {
    let path = args
        .iter()
        .position(|a| a == "--request")
        .and_then(|idx| args.get(idx + 1));

    let body = match path.map(String::as_str) {
        Some("-") | None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
        Some(path) => std::fs::read_to_string(path)?,
    };
    Ok(serde_json::from_str(&body)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    let config = AttribConfig::from_env()?;
    let request = read_request(&args)?;

    let service = AttributionService::new(
        config.open_store()?,
        config.weights.clone(),
        config.default_window_hours,
        config.journey_lookback_hours,
        config.journey_cache_ttl,
    );

    let output = if args.iter().any(|a| a == "--journey") {
        serde_json::to_string_pretty(&service.journey(&request).await?)?
    } else if args.iter().any(|a| a == "--summary") {
        serde_json::to_string_pretty(&service.journey_summary(&request).await?)?
    } else {
        serde_json::to_string_pretty(&service.attribute(&request).await?)?
    };
    println!("{}", output);
    Ok(())
}
