//! xapi-send - submit xAPI statements from stdin to an LRS
//!
//! Reads a single statement or an array of statements as JSON from stdin,
//! queues each one on an [`XapiWrapper`] and waits for every delivery.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `XAPI_ENDPOINT`: LRS base URL (required)
//! - `XAPI_USERNAME` / `XAPI_PASSWORD`: basic credentials
//! - `XAPI_TOKEN`: bearer token, used instead of basic credentials when set
//! - `XAPI_VERSION`: xAPI version header (default: 1.0.3)
//! - `XAPI_MAX_ATTEMPTS`: delivery attempts per statement (default: 3)
//! - `XAPI_TIMEOUT_MS`: per-attempt timeout (default: 30000)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xapi_wrapper::{DeliveryHandle, Statement, WrapperOptions, XapiWrapper};

/// How long to wait for queued statements after Ctrl-C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let options = match WrapperOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let wrapper = match XapiWrapper::with_options(options) {
        Ok(wrapper) => {
            let config = wrapper.get_config();
            info!(
                endpoint = %config.endpoint,
                version = %config.version,
                max_attempts = config.max_attempts,
                "Configuration loaded"
            );
            wrapper
        }
        Err(e) => {
            error!(error = %e, "Failed to configure wrapper");
            return ExitCode::FAILURE;
        }
    };

    let statements = match read_statements() {
        Ok(statements) => statements,
        Err(e) => {
            error!(error = %e, "Failed to read statements from stdin");
            return ExitCode::FAILURE;
        }
    };
    info!(count = statements.len(), "Submitting statements");

    let mut handles: Vec<DeliveryHandle> = Vec::with_capacity(statements.len());
    for (index, statement) in statements.into_iter().enumerate() {
        match wrapper.send_statement(statement) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!(index = index, error = %e, "Statement rejected");
                return ExitCode::FAILURE;
            }
        }
    }

    tokio::select! {
        failures = wait_all(handles) => {
            if failures == 0 {
                info!("All statements delivered");
                ExitCode::SUCCESS
            } else {
                error!(failures = failures, "Some statements were not delivered");
                ExitCode::FAILURE
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(pending = wrapper.queue_len(), "Shutdown signal received, draining queue...");
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, wrapper.drain()).await {
                Ok(()) => info!("Queue drained"),
                Err(_) => warn!(
                    pending = wrapper.queue_len(),
                    "Queue drain timed out after {:?}", SHUTDOWN_TIMEOUT
                ),
            }
            let stats = wrapper.queue_stats();
            if stats.failed == 0 && wrapper.queue_len() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Parse stdin as one statement or an array of statements.
fn read_statements() -> Result<Vec<Statement>, Box<dyn std::error::Error>> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let statements = match serde_json::from_str::<Value>(&input)? {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Statement>, _>>()?,
        single => vec![serde_json::from_value(single)?],
    };

    if statements.is_empty() {
        return Err("no statements supplied".into());
    }
    Ok(statements)
}

/// Await every handle in submission order, returning how many failed.
async fn wait_all(handles: Vec<DeliveryHandle>) -> usize {
    let mut failures = 0;
    for handle in handles {
        let ids = handle.statement_ids().to_vec();
        match handle.await {
            Ok(delivery) => {
                // Delivered ids go to stdout, one per line
                for id in &ids {
                    println!("{}", id);
                }
                info!(attempts = delivery.attempts, status = delivery.response.status, "Statement stored");
            }
            Err(e) => {
                failures += 1;
                error!(statement_ids = ?ids, error = %e, "Statement delivery failed");
            }
        }
    }
    failures
}
