#![forbid(unsafe_code)]

// Narrow capability interface onto the media relay engine.
//
// The control plane only creates, wires and closes engine entities. Negotiation
// blobs (ICE/DTLS/RTP) pass through as opaque JSON; the engine validates them.

use crate::media::config::{RouterConfig, WebRtcTransportConfig};
use crate::media::types::{MediaKind, MediaResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Callback invoked when a transport's DTLS state becomes terminal
pub type DtlsClosedCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Entry point into the engine. Implementations start at most one worker,
/// lazily, on the first router creation.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn EngineRouter>>;
}

/// Per-room router holding the negotiated codec capabilities
#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> String;

    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>>;

    fn close(&self);
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> String;

    fn ice_parameters(&self) -> Value;

    fn ice_candidates(&self) -> Value;

    fn dtls_parameters(&self) -> Value;

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>>;

    /// Registers `callback` to run once DTLS reaches `closed` or `failed`.
    /// The callback is dropped when the transport is closed.
    fn on_dtls_closed(&self, callback: DtlsClosedCallback);

    fn close(&self);
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn close(&self);
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    async fn resume(&self) -> MediaResult<()>;

    fn close(&self);
}
