//! replymux: command-line client
//!
//! Publishes one frame to the configured work queue.
//!
//! ## Usage
//! ```text
//! replymux emit <pattern> [json-data]   # fire-and-forget event
//! replymux send <pattern> [json-data]   # request, prints each reply
//! ```
//!
//! ## Configuration
//! - replymux.yaml / REPLYMUX_CONFIG / REPLYMUX__* variables (see `ClientConfig::load`)
//! - REPLYMUX_TIMEOUT_SECS: Seconds to wait for the final reply (default: 30)
//! - REPLYMUX_LOG: Log filter (default: info)

use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use replymux::utils::bootstrap::init_tracing;
use replymux::{ClientConfig, ClientError, RmqClient};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USAGE: &str = "usage: replymux <emit|send> <pattern> [json-data]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(command), Some(pattern)) = (args.next(), args.next()) else {
        return Err(USAGE.into());
    };
    let data: Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Null,
    };
    let pattern = parse_pattern(&pattern);

    let timeout = std::env::var("REPLYMUX_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

    let config = ClientConfig::load(None)?;
    let client = RmqClient::new(config)?;

    match command.as_str() {
        "emit" => {
            client.emit(pattern, data).await?;
            info!("Event published");
        }
        "send" => {
            let exchange = async {
                let mut replies = client.send(pattern, data).await;
                let mut received = 0usize;
                while let Some(reply) = replies.next().await {
                    println!("{}", reply?);
                    received += 1;
                }
                if received == 0 {
                    return Err(ClientError::NoResponse);
                }
                Ok(())
            };
            tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ClientError::Timeout(timeout))??;
        }
        other => return Err(format!("unknown command '{}'\n{}", other, USAGE).into()),
    }

    client.close().await;
    Ok(())
}

/// Patterns may be JSON (`{"cmd":"sum"}`) or a bare string (`sum`).
fn parse_pattern(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
