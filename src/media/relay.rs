use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::media::engine::{EngineError, RelayTarget, RtcEngine, RtcTransport};
use crate::media::types::RelayPorts;

/// Owns the negotiated transport for one session and gates the
/// republish path: negotiation never starts forwarding, activation runs
/// at most once, deactivation is idempotent and safe on a pipeline that
/// was never activated.
pub struct RelayPipeline {
    engine: Arc<dyn RtcEngine>,
    transport: Mutex<Option<Box<dyn RtcTransport>>>,
    activated: AtomicBool,
}

impl RelayPipeline {
    pub fn new(engine: Arc<dyn RtcEngine>) -> Self {
        Self {
            engine,
            transport: Mutex::new(None),
            activated: AtomicBool::new(false),
        }
    }

    /// Negotiates a transport from the inbound description and returns
    /// the answer. Does not start republishing.
    pub async fn negotiate(&self, offer_sdp: &str) -> Result<String, EngineError> {
        let transport = self.engine.create_transport(offer_sdp).await?;
        let answer = transport.answer().to_string();
        *self.transport.lock().await = Some(transport);
        Ok(answer)
    }

    /// Begins republishing the negotiated tracks onto the given ports.
    /// A second call is a no-op.
    pub async fn activate(&self, ports: RelayPorts) -> Result<(), EngineError> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.transport.lock().await;
        let transport = guard.as_ref().ok_or(EngineError::NotNegotiated)?;
        transport.start_forwarding(RelayTarget::loopback(ports)).await
    }

    /// Stops republishing and releases the transport.
    pub async fn deactivate(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close().await;
        }
    }
}
