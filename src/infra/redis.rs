//! Redis connection bootstrap.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::warn;

use super::error::InfraError;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Opens a multiplexed connection, retrying a few times so a cache node
/// that comes up slightly after the service does not abort startup.
pub async fn connect(url: &str) -> Result<MultiplexedConnection, InfraError> {
    let client = redis::Client::open(url)
        .map_err(|err| InfraError::redis(format!("invalid redis url: {err}")))?;

    let mut last_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match client.get_multiplexed_async_connection().await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                warn!(
                    target = "infra::redis::connect",
                    attempt,
                    error = %err,
                    "redis connection attempt failed"
                );
                last_error = Some(err);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                }
            }
        }
    }

    Err(InfraError::redis(format!(
        "could not connect after {CONNECT_ATTEMPTS} attempts: {}",
        last_error.map(|err| err.to_string()).unwrap_or_default()
    )))
}
