//! Reconnecting raw-fix relay.
//!
//! Keeps a persistent stream to a remote ingestion endpoint and forwards
//! every raw fix as one JSON line tagged with this instance's source id.
//! Connection failures retry at a constant interval until cancellation;
//! the placeholder fix the feed starts with is never forwarded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::models::GpsFix;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum RelayError {
    #[error("Connect error: {0}")]
    Connect(std::io::Error),
    #[error("Connection was not ready in time")]
    ReadyTimeout,
    #[error("Encode fix: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Send fix: {0}")]
    Send(std::io::Error),
}

/// One forwarded fix on the wire.
#[derive(Debug, Serialize)]
struct RelayFrame<'a> {
    source: &'a str,
    uid: &'a str,
    time: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    speed: u32,
    course: u32,
}

pub struct Relay {
    addr: String,
    source: String,
    reconnect_interval: Duration,
    ready_timeout: Duration,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            addr: config.addr.clone(),
            source: config.source.clone(),
            reconnect_interval: RECONNECT_INTERVAL,
            ready_timeout: READY_TIMEOUT,
        }
    }

    /// Forward fixes until cancelled, reconnecting on every failure.
    pub async fn run(&self, mut rx: watch::Receiver<GpsFix>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            match self.forward(&mut rx, &token).await {
                Ok(()) => return,
                Err(err) => {
                    error!(addr = %self.addr, error = %err, "relay stream failed, will reconnect");
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }

    /// One connection lifetime. Returns `Ok` only on cancellation, after
    /// closing the send direction.
    async fn forward(
        &self,
        rx: &mut watch::Receiver<GpsFix>,
        token: &CancellationToken,
    ) -> Result<(), RelayError> {
        let mut stream =
            match tokio::time::timeout(self.ready_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(RelayError::Connect(err)),
                Err(_) => return Err(RelayError::ReadyTimeout),
            };
        info!(addr = %self.addr, "relay connected");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(err) = stream.shutdown().await {
                        error!(error = %err, "close relay stream");
                    }
                    return Ok(());
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Feed is gone; nothing more will ever arrive.
                        let _ = stream.shutdown().await;
                        return Ok(());
                    }
                    let fix = rx.borrow_and_update().clone();
                    if fix.is_empty() {
                        continue;
                    }
                    let mut frame = serde_json::to_vec(&RelayFrame {
                        source: &self.source,
                        uid: &fix.uid,
                        time: fix.time,
                        latitude: fix.latitude,
                        longitude: fix.longitude,
                        speed: fix.speed,
                        course: fix.course,
                    })?;
                    frame.push(b'\n');
                    stream.write_all(&frame).await.map_err(RelayError::Send)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn test_relay(addr: String) -> Relay {
        Relay {
            addr,
            source: "city-north".to_string(),
            reconnect_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(1),
        }
    }

    fn fix(uid: &str) -> GpsFix {
        GpsFix {
            uid: uid.to_string(),
            time: Utc.with_ymd_and_hms(2021, 5, 6, 8, 16, 6).unwrap(),
            latitude: 58.74471,
            longitude: 50.178543,
            speed: 8,
            course: 131,
        }
    }

    #[tokio::test]
    async fn test_forwards_fixes_and_skips_placeholder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = watch::channel(GpsFix::default());
        let token = CancellationToken::new();
        let relay = test_relay(addr.to_string());
        let relay_task = {
            let token = token.clone();
            tokio::spawn(async move { relay.run(rx, token).await })
        };

        let (server_side, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(server_side).lines();

        // The placeholder must never arrive, only the real fix after it.
        tx.send_replace(GpsFix::default());
        tx.send_replace(fix("353173067939817"));

        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("frame within timeout")
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(frame["source"], "city-north");
        assert_eq!(frame["uid"], "353173067939817");
        assert_eq!(frame["speed"], 8);

        // Cancellation closes the send direction; the server sees EOF.
        token.cancel();
        relay_task.await.unwrap();
        let eof = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("eof within timeout")
            .unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn test_reconnects_until_endpoint_appears() {
        // Reserve an address, then free it so the first connect attempts fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, rx) = watch::channel(GpsFix::default());
        let token = CancellationToken::new();
        let relay = test_relay(addr.to_string());
        let relay_task = {
            let token = token.clone();
            tokio::spawn(async move { relay.run(rx, token).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let (server_side, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("relay reconnected within timeout")
            .unwrap();

        tx.send_replace(fix("42"));
        let mut lines = BufReader::new(server_side).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .expect("frame within timeout")
            .unwrap()
            .unwrap();
        assert!(line.contains("\"uid\":\"42\""));

        token.cancel();
        relay_task.await.unwrap();
    }
}
