//! Connection handlers bridging the wire decoders to the correlation
//! engine. One handler instance serves all connections of its protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::models::GpsFix;
use crate::protocols::egts::EgtsDecoder;
use crate::protocols::wialon::WialonDecoder;
use crate::server::ConnectionHandler;
use crate::tracking::TrackingService;

pub struct WialonReceiver {
    tracking: Arc<TrackingService>,
}

impl WialonReceiver {
    pub fn new(tracking: Arc<TrackingService>) -> Self {
        Self { tracking }
    }
}

#[async_trait]
impl ConnectionHandler for WialonReceiver {
    async fn handle(
        &self,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut decoder = WialonDecoder::new(stream).await?;
        debug!(uid = %decoder.uid(), "tracker logged in");
        while let Some(fix) = decoder.next().await {
            self.tracking.process_fix(GpsFix {
                uid: fix.uid,
                time: fix.time,
                latitude: fix.latitude,
                longitude: fix.longitude,
                speed: fix.speed,
                course: fix.course,
            });
        }
        Ok(())
    }
}

pub struct EgtsReceiver {
    tracking: Arc<TrackingService>,
}

impl EgtsReceiver {
    pub fn new(tracking: Arc<TrackingService>) -> Self {
        Self { tracking }
    }
}

#[async_trait]
impl ConnectionHandler for EgtsReceiver {
    async fn handle(
        &self,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut decoder = EgtsDecoder::new(stream);
        while let Some(fix) = decoder.next().await {
            self.tracking.process_fix(GpsFix {
                uid: fix.object_id.to_string(),
                time: fix.time,
                latitude: fix.latitude,
                longitude: fix.longitude,
                speed: fix.speed,
                course: fix.course,
            });
        }
        Ok(())
    }
}
