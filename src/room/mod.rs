#![forbid(unsafe_code)]

// Room module - room registry and per-room media tables
pub mod roles;

pub use roles::PeerRole;

use crate::media::engine::{EngineConsumer, EngineProducer, EngineRouter, EngineTransport, MediaEngine};
use crate::media::types::{bounded, ConsumerInfo, MediaError, MediaKind, MediaResult, TransportInfo, TransportState};
use crate::media::{MediaConfig, TransportFactory};
use crate::metrics::{Counter, ServerMetrics};
use crate::signaling::protocol::ServerMessage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

/// A transport registered in a room under its application id
pub struct TransportEntry {
    pub app_id: String,
    /// Peer id of the connection that created it
    pub owner: String,
    pub engine: Arc<dyn EngineTransport>,
    state: Mutex<TransportState>,
}

impl TransportEntry {
    pub fn new(app_id: String, owner: String, engine: Arc<dyn EngineTransport>) -> Self {
        Self {
            app_id,
            owner,
            engine,
            state: Mutex::new(TransportState::Created),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn close(&self) {
        self.set_state(TransportState::Closed);
        self.engine.close();
    }
}

pub struct ProducerEntry {
    pub engine: Arc<dyn EngineProducer>,
    pub transport_id: String,
    pub owner: String,
    pub owner_role: PeerRole,
    seq: u64,
}

pub struct ConsumerEntry {
    pub engine: Arc<dyn EngineConsumer>,
    pub transport_id: String,
    pub producer_id: String,
    paused: AtomicBool,
}

impl ConsumerEntry {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RoomTables {
    closed: bool,
    transports: HashMap<String, Arc<TransportEntry>>,
    producers: HashMap<String, Arc<ProducerEntry>>,
    consumers: HashMap<String, Arc<ConsumerEntry>>,
    next_seq: u64,
}

/// Entities taken out of a room's tables, closed children first
#[derive(Default)]
pub struct Detached {
    consumers: Vec<Arc<ConsumerEntry>>,
    producers: Vec<(String, Arc<ProducerEntry>)>,
    transports: Vec<Arc<TransportEntry>>,
}

impl Detached {
    pub fn close(&self) {
        for consumer in &self.consumers {
            consumer.engine.close();
        }
        for (_, producer) in &self.producers {
            producer.engine.close();
        }
        for transport in &self.transports {
            transport.close();
        }
    }

    pub fn transport_ids(&self) -> impl Iterator<Item = &str> {
        self.transports.iter().map(|t| t.app_id.as_str())
    }
}

/// Room state. Tables are only touched under a brief lock that is never held
/// across an engine call.
pub struct Room {
    pub id: String,
    router: Arc<dyn EngineRouter>,
    tables: Mutex<RoomTables>,
    members: StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>,
}

impl Room {
    pub fn new(id: String, router: Arc<dyn EngineRouter>) -> Self {
        Self {
            id,
            router,
            tables: Mutex::new(RoomTables::default()),
            members: StdRwLock::new(HashMap::new()),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, RoomTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn router(&self) -> &Arc<dyn EngineRouter> {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.tables().closed
    }

    pub fn ensure_open(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::RoomClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Returns false if the room closed in the meantime
    pub fn add_member(&self, peer_id: &str, sender: mpsc::Sender<Arc<String>>) -> bool {
        // Taken under the tables lock so a concurrent close can't miss the member
        let tables = self.tables();
        if tables.closed {
            return false;
        }
        self.members
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.to_string(), sender);
        true
    }

    pub fn remove_member(&self, peer_id: &str) {
        self.members.write().unwrap_or_else(|e| e.into_inner()).remove(peer_id);
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members.read().unwrap_or_else(|e| e.into_inner()).contains_key(peer_id)
    }

    /// Broadcast a message to all members except the sender
    pub fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        self.fan_out(Some(sender_id), message);
    }

    /// Broadcast a message to all members
    pub fn broadcast_all(&self, message: &ServerMessage) {
        self.fan_out(None, message);
    }

    fn fan_out(&self, skip: Option<&str>, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        for (id, sender) in members.iter() {
            if skip == Some(id.as_str()) {
                continue;
            }
            match sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for peer {} in room {}, dropping message", id, self.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in room {} (disconnected)", id, self.id);
                }
            }
        }
    }

    /// Live producer ids in creation order
    pub fn producer_ids(&self) -> Vec<String> {
        let tables = self.tables();
        let mut producers: Vec<(u64, &String)> =
            tables.producers.iter().map(|(id, p)| (p.seq, id)).collect();
        producers.sort_unstable();
        producers.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn transport(&self, app_id: &str) -> Option<Arc<TransportEntry>> {
        self.tables().transports.get(app_id).cloned()
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Arc<ConsumerEntry>> {
        self.tables().consumers.get(consumer_id).cloned()
    }

    pub fn producer(&self, producer_id: &str) -> Option<Arc<ProducerEntry>> {
        self.tables().producers.get(producer_id).cloned()
    }

    pub fn transport_count(&self) -> usize {
        self.tables().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.tables().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.tables().consumers.len()
    }

    pub fn insert_transport(&self, entry: Arc<TransportEntry>) -> MediaResult<()> {
        let mut tables = self.tables();
        if tables.closed {
            return Err(MediaError::RoomClosed(self.id.clone()));
        }
        tables.transports.insert(entry.app_id.clone(), entry);
        Ok(())
    }

    fn insert_producer(
        &self,
        engine: Arc<dyn EngineProducer>,
        transport_id: &str,
        owner: &str,
        owner_role: PeerRole,
    ) -> MediaResult<()> {
        let mut tables = self.tables();
        if tables.closed {
            return Err(MediaError::RoomClosed(self.id.clone()));
        }
        if !tables.transports.contains_key(transport_id) {
            return Err(MediaError::TransportNotFound(transport_id.to_string()));
        }
        tables.next_seq += 1;
        let entry = ProducerEntry {
            engine: engine.clone(),
            transport_id: transport_id.to_string(),
            owner: owner.to_string(),
            owner_role,
            seq: tables.next_seq,
        };
        tables.producers.insert(engine.id(), Arc::new(entry));
        Ok(())
    }

    fn insert_consumer(&self, engine: Arc<dyn EngineConsumer>, transport_id: &str) -> MediaResult<()> {
        let mut tables = self.tables();
        if tables.closed {
            return Err(MediaError::RoomClosed(self.id.clone()));
        }
        if !tables.transports.contains_key(transport_id) {
            return Err(MediaError::TransportNotFound(transport_id.to_string()));
        }
        let producer_id = engine.producer_id();
        if !tables.producers.contains_key(&producer_id) {
            return Err(MediaError::ProducerNotFound(producer_id));
        }
        let entry = ConsumerEntry {
            engine: engine.clone(),
            transport_id: transport_id.to_string(),
            producer_id,
            paused: AtomicBool::new(true),
        };
        tables.consumers.insert(engine.id(), Arc::new(entry));
        Ok(())
    }

    /// Resolves the producer a `consume` targets. Without an explicit id the
    /// most recently created live producer is picked.
    pub fn resolve_producer(&self, producer_id: Option<&str>) -> MediaResult<String> {
        let tables = self.tables();
        match producer_id {
            Some(id) if tables.producers.contains_key(id) => Ok(id.to_string()),
            Some(id) => Err(MediaError::ProducerNotFound(id.to_string())),
            None => tables
                .producers
                .iter()
                .max_by_key(|(_, p)| p.seq)
                .map(|(id, _)| id.clone())
                .ok_or_else(|| MediaError::NoProducer(self.id.clone())),
        }
    }

    /// Closes a transport and everything hanging off it: its consumers, the
    /// consumers of its producers, its producers, then the transport itself.
    /// Members are told about every producer that went away.
    pub fn close_transport(&self, app_id: &str) -> bool {
        let detached = {
            let mut tables = self.tables();
            let Some(transport) = tables.transports.remove(app_id) else {
                return false;
            };

            let producer_ids: Vec<String> = tables
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == app_id)
                .map(|(id, _)| id.clone())
                .collect();

            let consumer_ids: Vec<String> = tables
                .consumers
                .iter()
                .filter(|(_, c)| c.transport_id == app_id || producer_ids.contains(&c.producer_id))
                .map(|(id, _)| id.clone())
                .collect();

            Detached {
                consumers: consumer_ids
                    .iter()
                    .filter_map(|id| tables.consumers.remove(id))
                    .collect(),
                producers: producer_ids
                    .into_iter()
                    .filter_map(|id| tables.producers.remove(&id).map(|p| (id, p)))
                    .collect(),
                transports: vec![transport],
            }
        };

        detached.close();
        for (producer_id, producer) in &detached.producers {
            debug!(
                "Producer {} of {} {} closed with its transport",
                producer_id,
                producer.owner_role.name(),
                producer.owner
            );
            self.broadcast_all(&ServerMessage::ProducerClosed {
                producer_id: producer_id.clone(),
            });
        }
        debug!(
            "Closed transport {} in room {} ({} producers, {} consumers)",
            app_id,
            self.id,
            detached.producers.len(),
            detached.consumers.len()
        );
        true
    }

    /// Marks the room closed and takes every entity out of its tables.
    /// The caller closes them; nothing can be inserted afterwards.
    pub fn close_all(&self) -> Detached {
        let mut tables = self.tables();
        tables.closed = true;
        let mut producers: Vec<(String, Arc<ProducerEntry>)> = tables.producers.drain().collect();
        producers.sort_unstable_by_key(|(_, p)| p.seq);
        Detached {
            consumers: tables.consumers.drain().map(|(_, c)| c).collect(),
            producers,
            transports: tables.transports.drain().map(|(_, t)| t).collect(),
        }
    }

    fn clear_members(&self) {
        self.members.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Outcome of a `resumeConsumer` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    AlreadyActive,
    Unknown,
}

/// Room registry: the single source of truth for room state.
///
/// The outer map holds one `OnceCell` per room id, so concurrent first joins
/// share a single router creation.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Arc<OnceCell<Arc<Room>>>>>,
    engine: Arc<dyn MediaEngine>,
    media_config: MediaConfig,
    transports: TransportFactory,
    engine_timeout: Duration,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        media_config: MediaConfig,
        engine_timeout: Duration,
        metrics: ServerMetrics,
    ) -> Self {
        let transports = TransportFactory::new(media_config.webrtc_transport_config.clone(), engine_timeout);
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            engine,
            media_config,
            transports,
            engine_timeout,
            metrics,
        }
    }

    pub fn transports(&self) -> &TransportFactory {
        &self.transports
    }

    fn registered(&self, room_id: &str, cell: &Arc<OnceCell<Arc<Room>>>) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    /// Returns the room, creating its router on first access
    pub async fn get_or_create_room(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        loop {
            let cell = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let room = cell
                .get_or_try_init(|| async {
                    let router = bounded(
                        self.engine_timeout,
                        "createRouter",
                        self.engine.create_router(&self.media_config.router_config),
                    )
                    .await?;
                    self.metrics.inc(Counter::RoomsCreated);
                    info!("Created room {} with router {}", room_id, router.id());
                    Ok::<_, MediaError>(Arc::new(Room::new(room_id.to_string(), router)))
                })
                .await?
                .clone();

            if self.registered(room_id, &cell) && !room.is_closed() {
                return Ok(room);
            }

            // closeRoom ran while this room was being created or used
            if !room.is_closed() {
                Self::teardown(&room, &self.transports);
            }
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                rooms.remove(room_id);
            }
        }
    }

    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .and_then(|cell| cell.get().cloned())
    }

    fn teardown(room: &Room, transports: &TransportFactory) {
        let detached = room.close_all();
        detached.close();
        for app_id in detached.transport_ids() {
            transports.forget(app_id);
        }
        room.router.close();
    }

    /// Closes consumers, producers, transports and the router of a room,
    /// then removes it. Returns false for an unknown room.
    pub fn close_room(&self, room_id: &str) -> bool {
        let cell = self.rooms.write().unwrap_or_else(|e| e.into_inner()).remove(room_id);
        let Some(room) = cell.and_then(|cell| cell.get().cloned()) else {
            return false;
        };

        room.broadcast_all(&ServerMessage::RoomClosed {
            room_id: room_id.to_string(),
        });
        Self::teardown(&room, &self.transports);
        room.clear_members();

        self.metrics.inc(Counter::RoomsClosed);
        info!("Closed room {}", room_id);
        true
    }

    pub async fn create_transport(
        &self,
        room: &Arc<Room>,
        owner: &str,
    ) -> MediaResult<(Arc<TransportEntry>, TransportInfo)> {
        let created = self.transports.create_transport(room, owner).await?;
        self.metrics.inc(Counter::TransportsCreated);
        Ok(created)
    }

    pub async fn connect_transport(&self, room: &Room, transport: &TransportEntry, dtls_parameters: Value) -> MediaResult<()> {
        if transport.state() == TransportState::Closed || room.transport(&transport.app_id).is_none() {
            return Err(MediaError::TransportNotFound(transport.app_id.clone()));
        }
        bounded(self.engine_timeout, "connectTransport", transport.engine.connect(dtls_parameters)).await?;

        // DTLS closure may have released it while connecting
        if room.transport(&transport.app_id).is_none() {
            return Err(MediaError::TransportNotFound(transport.app_id.clone()));
        }
        transport.set_state(TransportState::Connected);
        info!("Connected transport {} in room {}", transport.app_id, room.id);
        Ok(())
    }

    /// Creates a producer on `transport`. The caller checks the role.
    pub async fn produce(
        &self,
        room: &Room,
        transport: &TransportEntry,
        owner: &str,
        owner_role: PeerRole,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        room.ensure_open()?;
        let producer = bounded(
            self.engine_timeout,
            "produce",
            transport.engine.produce(kind, rtp_parameters),
        )
        .await?;

        if let Err(e) = room.insert_producer(producer.clone(), &transport.app_id, owner, owner_role) {
            producer.close();
            return Err(e);
        }

        self.metrics.inc(Counter::ProducersCreated);
        info!("Created {} producer {} for {} in room {}", kind.as_str(), producer.id(), owner, room.id);
        Ok(producer.id())
    }

    /// Creates a paused consumer after checking capability compatibility
    pub async fn consume(
        &self,
        room: &Room,
        transport: &TransportEntry,
        producer_id: Option<&str>,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        room.ensure_open()?;
        let producer_id = room.resolve_producer(producer_id)?;

        if !room.router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(MediaError::CannotConsume(producer_id));
        }

        let consumer = bounded(
            self.engine_timeout,
            "consume",
            transport.engine.consume(&producer_id, rtp_capabilities, true),
        )
        .await?;

        if let Err(e) = room.insert_consumer(consumer.clone(), &transport.app_id) {
            consumer.close();
            return Err(e);
        }

        self.metrics.inc(Counter::ConsumersCreated);
        info!(
            "Created consumer {} of producer {} on transport {} in room {}",
            consumer.id(),
            producer_id,
            transport.app_id,
            room.id
        );
        Ok(ConsumerInfo {
            id: consumer.id(),
            producer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Resumes a paused consumer. The engine is called at most once per
    /// consumer; unknown ids are reported, not treated as errors.
    pub async fn resume_consumer(&self, room: &Room, consumer_id: &str) -> MediaResult<ResumeOutcome> {
        let Some(entry) = room.consumer(consumer_id) else {
            return Ok(ResumeOutcome::Unknown);
        };
        if entry
            .paused
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(ResumeOutcome::AlreadyActive);
        }

        match bounded(self.engine_timeout, "resumeConsumer", entry.engine.resume()).await {
            Ok(()) => {
                debug!("Resumed consumer {} in room {}", consumer_id, room.id);
                Ok(ResumeOutcome::Resumed)
            }
            // Closed under us by a disconnect
            Err(_) if room.consumer(consumer_id).is_none() => Ok(ResumeOutcome::Unknown),
            Err(e) => {
                entry.paused.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn close_transport(&self, room: &Room, app_id: &str) -> bool {
        self.transports.release(room, app_id)
    }

    /// Closes every room
    pub fn shutdown(&self) {
        let room_ids: Vec<String> = self
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for room_id in room_ids {
            self.close_room(&room_id);
        }
        info!("Room manager shut down");
    }

    pub fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn member_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|cell| cell.get())
            .map(|room| room.member_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockEngine;
    use serde_json::json;

    fn manager(engine: &MockEngine) -> RoomManager {
        RoomManager::new(
            Arc::new(engine.clone()),
            MediaConfig::default(),
            Duration::from_secs(1),
            ServerMetrics::new(),
        )
    }

    fn vp8_parameters() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }], "encodings": [{ "ssrc": 2222 }] })
    }

    fn vp8_capabilities() -> Value {
        json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] })
    }

    #[tokio::test]
    async fn test_concurrent_first_access_shares_router() {
        let engine = MockEngine::new();
        engine.set_router_delay(Duration::from_millis(30));
        let rooms = manager(&engine);

        let (a, b, c) = tokio::join!(
            rooms.get_or_create_room("class-1"),
            rooms.get_or_create_room("class-1"),
            rooms.get_or_create_room("class-1"),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(engine.routers_created(), 1);
        assert_eq!(engine.workers_started(), 1);

        rooms.get_or_create_room("class-2").await.unwrap();
        assert_eq!(engine.routers_created(), 2);
        assert_eq!(engine.workers_started(), 1);
        assert_eq!(rooms.room_count(), 2);
    }

    #[tokio::test]
    async fn test_close_room_order() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let room = rooms.get_or_create_room("class-1").await.unwrap();

        let (host_transport, _) = rooms.create_transport(&room, "host").await.unwrap();
        let (viewer_transport, _) = rooms.create_transport(&room, "viewer").await.unwrap();
        let producer_id = rooms
            .produce(&room, &host_transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = rooms
            .consume(&room, &viewer_transport, Some(&producer_id), vp8_capabilities())
            .await
            .unwrap();

        assert!(rooms.close_room("class-1"));
        assert!(!rooms.close_room("class-1"));
        assert!(rooms.get_room("class-1").is_none());

        let log = engine.close_log();
        let kinds: Vec<&str> = log.iter().map(|e| e.split(':').next().unwrap_or("")).collect();
        assert_eq!(kinds, vec!["consumer", "producer", "transport", "transport", "router"]);
        assert_eq!(log[0], format!("consumer:{}", consumer.id));
        assert_eq!(engine.open_routers(), 0);
        assert_eq!(rooms.transports().tracked(), 0);
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_close_transport_cascades() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let room = rooms.get_or_create_room("class-1").await.unwrap();

        let (host_transport, _) = rooms.create_transport(&room, "host").await.unwrap();
        let (viewer_transport, _) = rooms.create_transport(&room, "viewer").await.unwrap();
        let producer_id = rooms
            .produce(&room, &host_transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        rooms
            .consume(&room, &viewer_transport, Some(&producer_id), vp8_capabilities())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        assert!(room.add_member("viewer", tx));

        assert!(rooms.close_transport(&room, &host_transport.app_id));
        assert_eq!(room.producer_count(), 0);
        assert_eq!(room.consumer_count(), 0);
        assert_eq!(room.transport_count(), 1);
        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_consumers(), 0);
        assert_eq!(host_transport.state(), TransportState::Closed);

        let kinds: Vec<String> = engine
            .close_log()
            .iter()
            .map(|e| e.split(':').next().unwrap_or("").to_string())
            .collect();
        assert_eq!(kinds, vec!["consumer", "producer", "transport"]);

        let notice: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(notice["action"], "producerClosed");
        assert_eq!(notice["data"]["producerId"], producer_id);
    }

    #[tokio::test]
    async fn test_default_producer_is_most_recent() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let room = rooms.get_or_create_room("class-1").await.unwrap();
        let (transport, _) = rooms.create_transport(&room, "host").await.unwrap();

        assert!(matches!(room.resolve_producer(None), Err(MediaError::NoProducer(_))));

        let first = rooms
            .produce(&room, &transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let second = rooms
            .produce(&room, &transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        assert_eq!(room.resolve_producer(None).unwrap(), second);
        assert_eq!(room.producer_ids(), vec![first.clone(), second]);
        let entry = room.producer(&first).unwrap();
        assert_eq!((entry.owner.as_str(), entry.owner_role), ("host", PeerRole::Host));
        assert_eq!(room.resolve_producer(Some(&first)).unwrap(), first);
        assert!(matches!(room.resolve_producer(Some("nope")), Err(MediaError::ProducerNotFound(_))));
    }

    #[tokio::test]
    async fn test_incompatible_consume_creates_nothing() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let room = rooms.get_or_create_room("class-1").await.unwrap();
        let (transport, _) = rooms.create_transport(&room, "host").await.unwrap();
        let producer_id = rooms
            .produce(&room, &transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let h264 = json!({ "codecs": [{ "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }] });
        let result = rooms.consume(&room, &transport, Some(&producer_id), h264).await;
        assert!(matches!(result, Err(MediaError::CannotConsume(_))));
        assert_eq!(room.consumer_count(), 0);
        assert_eq!(engine.open_consumers(), 0);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let room = rooms.get_or_create_room("class-1").await.unwrap();
        let (transport, _) = rooms.create_transport(&room, "host").await.unwrap();
        let producer_id = rooms
            .produce(&room, &transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = rooms
            .consume(&room, &transport, Some(&producer_id), vp8_capabilities())
            .await
            .unwrap();
        assert!(room.consumer(&consumer.id).unwrap().is_paused());

        assert_eq!(rooms.resume_consumer(&room, &consumer.id).await.unwrap(), ResumeOutcome::Resumed);
        assert_eq!(rooms.resume_consumer(&room, &consumer.id).await.unwrap(), ResumeOutcome::AlreadyActive);
        assert_eq!(rooms.resume_consumer(&room, "missing").await.unwrap(), ResumeOutcome::Unknown);
        assert_eq!(engine.resume_calls(&consumer.id), 1);
    }

    #[tokio::test]
    async fn test_produce_timeout_leaves_no_producer() {
        let engine = MockEngine::new();
        let rooms = RoomManager::new(
            Arc::new(engine.clone()),
            MediaConfig::default(),
            Duration::from_millis(20),
            ServerMetrics::new(),
        );
        let room = rooms.get_or_create_room("class-1").await.unwrap();
        let (transport, _) = rooms.create_transport(&room, "host").await.unwrap();
        engine.set_stall_produce(true);

        let result = rooms
            .produce(&room, &transport, "host", PeerRole::Host, MediaKind::Video, vp8_parameters())
            .await;
        assert!(matches!(result, Err(MediaError::Timeout(_))));
        assert_eq!(room.producer_count(), 0);
        assert_eq!(engine.open_producers(), 0);
    }

    #[tokio::test]
    async fn test_join_after_close_creates_fresh_room() {
        let engine = MockEngine::new();
        let rooms = manager(&engine);
        let first = rooms.get_or_create_room("class-1").await.unwrap();
        assert!(rooms.close_room("class-1"));

        let second = rooms.get_or_create_room("class-1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(engine.routers_created(), 2);
        assert_eq!(engine.open_routers(), 1);
    }
}
