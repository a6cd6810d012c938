#![forbid(unsafe_code)]

// Transport factory for WebRTC transports.
//
// Each transport gets an application id at creation. The engine id is only
// known once the engine call returns, so the two are correlated in an explicit
// table owned here instead of being attached to the engine object.

use crate::media::config::WebRtcTransportConfig;
use crate::media::types::{bounded, MediaResult, TransportInfo};
use crate::room::{Room, TransportEntry};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bidirectional app id <-> engine id table
#[derive(Default)]
struct TransportIds {
    by_app: HashMap<String, String>,
    by_engine: HashMap<String, String>,
}

impl TransportIds {
    fn bind(&mut self, app_id: &str, engine_id: &str) {
        self.by_app.insert(app_id.to_string(), engine_id.to_string());
        self.by_engine.insert(engine_id.to_string(), app_id.to_string());
    }

    fn forget(&mut self, app_id: &str) {
        if let Some(engine_id) = self.by_app.remove(app_id) {
            self.by_engine.remove(&engine_id);
        }
    }
}

/// Creates engine transports for rooms and deregisters them when their DTLS
/// session ends.
pub struct TransportFactory {
    config: WebRtcTransportConfig,
    ids: Arc<StdRwLock<TransportIds>>,
    engine_timeout: Duration,
}

impl TransportFactory {
    pub fn new(config: WebRtcTransportConfig, engine_timeout: Duration) -> Self {
        Self {
            config,
            ids: Arc::new(StdRwLock::new(TransportIds::default())),
            engine_timeout,
        }
    }

    /// Creates a transport in `room` owned by `owner`, registers it and
    /// arms its self-cleanup.
    pub async fn create_transport(
        &self,
        room: &Arc<Room>,
        owner: &str,
    ) -> MediaResult<(Arc<TransportEntry>, TransportInfo)> {
        room.ensure_open()?;
        debug!("Creating transport for {} in room {}", owner, room.id);

        // No lock held across the engine call
        let engine = bounded(
            self.engine_timeout,
            "createTransport",
            room.router().create_webrtc_transport(&self.config),
        )
        .await?;

        let app_id = Uuid::new_v4().to_string();
        let entry = Arc::new(TransportEntry::new(app_id.clone(), owner.to_string(), engine.clone()));

        // The room may have closed while the engine call was in flight
        if let Err(e) = room.insert_transport(entry.clone()) {
            engine.close();
            return Err(e);
        }

        self.ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .bind(&app_id, &engine.id());
        self.watch_dtls_closed(room, &entry);

        let info = TransportInfo {
            id: engine.id(),
            transport_id: app_id,
            ice_parameters: engine.ice_parameters(),
            ice_candidates: engine.ice_candidates(),
            dtls_parameters: engine.dtls_parameters(),
        };

        info!(
            "Created transport {} (engine {}) for {} in room {}",
            info.transport_id, info.id, owner, room.id
        );
        Ok((entry, info))
    }

    /// The engine callback only signals; the watcher task does the cleanup.
    /// Closing the transport normally drops the callback and with it the
    /// sender, so the watcher sees a closed channel and exits.
    fn watch_dtls_closed(&self, room: &Arc<Room>, entry: &Arc<TransportEntry>) {
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Mutex::new(Some(tx));
        entry.engine.on_dtls_closed(Box::new(move || {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(());
            }
        }));

        let room: Weak<Room> = Arc::downgrade(room);
        let ids = self.ids.clone();
        let app_id = entry.app_id.clone();
        tokio::spawn(async move {
            if rx.await.is_err() {
                return;
            }
            let Some(room) = room.upgrade() else {
                return;
            };
            warn!("DTLS closed for transport {} in room {}, releasing it", app_id, room.id);
            release(&ids, &room, &app_id);
        });
    }

    /// Closes a transport with its producers and consumers and drops its id
    /// mapping. Returns false if the room no longer had it.
    pub fn release(&self, room: &Room, app_id: &str) -> bool {
        release(&self.ids, room, app_id)
    }

    /// Drops the id mapping of a transport the room already closed
    pub fn forget(&self, app_id: &str) {
        self.ids.write().unwrap_or_else(|e| e.into_inner()).forget(app_id);
    }

    pub fn engine_id(&self, app_id: &str) -> Option<String> {
        self.ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_app
            .get(app_id)
            .cloned()
    }

    pub fn app_id(&self, engine_id: &str) -> Option<String> {
        self.ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_engine
            .get(engine_id)
            .cloned()
    }

    pub fn tracked(&self) -> usize {
        self.ids.read().unwrap_or_else(|e| e.into_inner()).by_app.len()
    }
}

fn release(ids: &StdRwLock<TransportIds>, room: &Room, app_id: &str) -> bool {
    let closed = room.close_transport(app_id);
    ids.write().unwrap_or_else(|e| e.into_inner()).forget(app_id);
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::RouterConfig;
    use crate::media::engine::MediaEngine;
    use crate::media::mock::MockEngine;
    use crate::media::types::{MediaError, TransportState};

    async fn room_with(engine: &MockEngine) -> Arc<Room> {
        let router = engine.create_router(&RouterConfig::default()).await.unwrap();
        Arc::new(Room::new("class-1".to_string(), router))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_create_transport_binds_ids() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let factory = TransportFactory::new(WebRtcTransportConfig::default(), Duration::from_secs(1));

        let (entry, info) = factory.create_transport(&room, "peer-1").await.unwrap();
        assert_ne!(info.id, info.transport_id);
        assert_eq!(factory.engine_id(&info.transport_id), Some(info.id.clone()));
        assert_eq!(factory.app_id(&info.id), Some(info.transport_id.clone()));
        assert_eq!(entry.state(), TransportState::Created);
        assert!(room.transport(&info.transport_id).is_some());
        assert!(info.dtls_parameters.get("fingerprints").is_some());
    }

    #[tokio::test]
    async fn test_dtls_closed_removes_transport() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let factory = TransportFactory::new(WebRtcTransportConfig::default(), Duration::from_secs(1));

        let (entry, info) = factory.create_transport(&room, "peer-1").await.unwrap();
        assert!(engine.trigger_dtls_closed(&info.id));

        wait_until(|| room.transport(&info.transport_id).is_none()).await;
        assert_eq!(entry.state(), TransportState::Closed);
        assert_eq!(engine.open_transports(), 0);
        assert_eq!(factory.tracked(), 0);
    }

    #[tokio::test]
    async fn test_release_forgets_mapping() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let factory = TransportFactory::new(WebRtcTransportConfig::default(), Duration::from_secs(1));

        let (_, info) = factory.create_transport(&room, "peer-1").await.unwrap();
        assert!(factory.release(&room, &info.transport_id));
        assert!(!factory.release(&room, &info.transport_id));
        assert_eq!(factory.engine_id(&info.transport_id), None);
        assert_eq!(engine.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_create_transport_times_out() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let factory = TransportFactory::new(WebRtcTransportConfig::default(), Duration::from_millis(20));
        engine.set_stall_transports(true);

        let result = factory.create_transport(&room, "peer-1").await;
        assert!(matches!(result, Err(MediaError::Timeout(_))));
        assert_eq!(room.transport_count(), 0);
        assert_eq!(factory.tracked(), 0);
    }

    #[tokio::test]
    async fn test_create_transport_in_closed_room() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let factory = TransportFactory::new(WebRtcTransportConfig::default(), Duration::from_secs(1));
        room.close_all().close();

        let result = factory.create_transport(&room, "peer-1").await;
        assert!(matches!(result, Err(MediaError::RoomClosed(_))));
        assert_eq!(engine.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_max_incoming_bitrate_reaches_engine() {
        let engine = MockEngine::new();
        let room = room_with(&engine).await;
        let config = WebRtcTransportConfig {
            max_incoming_bitrate: Some(1_500_000),
            ..WebRtcTransportConfig::default()
        };
        let factory = TransportFactory::new(config, Duration::from_secs(1));

        factory.create_transport(&room, "peer-1").await.unwrap();
        assert_eq!(engine.max_incoming_bitrates(), vec![Some(1_500_000)]);
    }
}
