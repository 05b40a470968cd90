//! Self-ping keep-alive loop.
//!
//! Free-tier hosts idle instances out after ~15 minutes without traffic.
//! Pinging our own public URL just under that window keeps the instance
//! warm.

use std::time::Duration;
use tracing::{debug, info, warn};

const INITIAL_DELAY: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(13 * 60 + 59);
const RETRY_DELAY: Duration = Duration::from_secs(60);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Ping `{external_url}/ping` forever. Never returns; run under
/// `tokio::spawn`.
pub async fn run_self_ping(external_url: String) {
    let url = format!("{}/ping", external_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(PING_TIMEOUT)
        .build()
        .expect("failed to build HTTP client");

    info!("Self-ping loop targeting {}", url);
    tokio::time::sleep(INITIAL_DELAY).await;

    loop {
        match client.head(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Self-ping ok");
                tokio::time::sleep(PING_INTERVAL).await;
            }
            Ok(resp) => {
                warn!("Self-ping returned {}", resp.status());
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                warn!("Self-ping failed: {}", err);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
