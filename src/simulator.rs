use std::time::Duration;

use log::{info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, Connector, Session};
use crate::messages::INBOUND_QUEUE;

/// Publishes synthetic measurements to the inbound queue, for exercising a
/// deployment end to end without real scanners.
pub struct Simulator {
    pub rssi: f64,
    pub interval: Duration,
    /// Stop after this many messages, run until shutdown otherwise.
    pub count: Option<u64>,
}

impl Simulator {
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
        shutdown: CancellationToken,
    ) -> Result<u64, BrokerError> {
        let mut session = connector.connect().await?;
        session.declare_queue(INBOUND_QUEUE).await?;

        let mut sent = 0;
        while self.count != Some(sent) {
            let body = sample_body(self.rssi, chrono::Utc::now());
            session.publish(INBOUND_QUEUE, body.as_bytes()).await?;
            sent += 1;
            info!("Sent RSSI message to queue: {}", body);

            if self.count == Some(sent) {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        if let Err(err) = session.close().await {
            warn!("Error closing broker session: {}", err);
        }
        Ok(sent)
    }
}

fn sample_body(rssi: f64, at: chrono::DateTime<chrono::Utc>) -> String {
    json!({
        "rssi": rssi,
        "timestamp": at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    })
    .to_string()
}
