#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("worker error: {0}")]
    Worker(String),

    #[error("router error: {0}")]
    Router(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("producer error: {0}")]
    Producer(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("room closed: {0}")]
    RoomClosed(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("no producer available in room {0}")]
    NoProducer(String),

    #[error("cannot consume producer {0} with the given rtpCapabilities")]
    CannotConsume(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("timeout waiting for media engine: {0}")]
    Timeout(String),

    #[error("mediasoup error: {0}")]
    Mediasoup(#[from] mediasoup::worker::RequestError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Bounds a single media engine call. On expiry the future is dropped, which
/// drops any half-created engine handle along with it.
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> MediaResult<T>
where
    F: Future<Output = MediaResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout(operation.to_string())),
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected,
    Closed,
}

/// Negotiation parameters handed back to the peer after `createTransport`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    /// Engine-assigned transport id
    pub id: String,
    /// Application-assigned transport id
    pub transport_id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_serde() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), "video");
        let kind: MediaKind = serde_json::from_value("audio".into()).unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_value::<MediaKind>("screen".into()).is_err());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: MediaResult<()> = bounded(Duration::from_millis(10), "produce", std::future::pending()).await;
        assert!(matches!(result, Err(MediaError::Timeout(op)) if op == "produce"));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(Duration::from_secs(1), "consume", async { Ok::<_, MediaError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
