#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers

use super::protocol::{ClientMessage, JoinRequest, ServerMessage};
use super::SignalingError;
use crate::media::types::{MediaError, MediaKind};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{PeerRole, ResumeOutcome, Room, RoomManager, TransportEntry};
use crate::turn::IceServerConfig;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per peer. Broadcasts beyond this are dropped.
pub const CHANNEL_CAPACITY: usize = 64;

const MIN_PING_INTERVAL: Duration = Duration::from_millis(50);

/// Server pings go out twice per idle window, so the pongs browsers send back
/// keep a silent but healthy peer connected.
fn ping_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(MIN_PING_INTERVAL)
}

type HandlerResult = Result<Option<ServerMessage>, SignalingError>;

/// Per-connection protocol state: `unjoined -> joined -> closed`
pub struct PeerSession {
    peer_id: String,
    role: PeerRole,
    room: Option<Arc<Room>>,
    /// Transports this connection created, by application id
    transports: HashMap<String, Arc<TransportEntry>>,
    sender: mpsc::Sender<Arc<String>>,
    room_manager: Arc<RoomManager>,
    ice_servers: Arc<IceServerConfig>,
    metrics: ServerMetrics,
}

impl PeerSession {
    pub fn new(
        peer_id: String,
        sender: mpsc::Sender<Arc<String>>,
        room_manager: Arc<RoomManager>,
        ice_servers: Arc<IceServerConfig>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            peer_id,
            role: PeerRole::Viewer,
            room: None,
            transports: HashMap::new(),
            sender,
            room_manager,
            ice_servers,
            metrics,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room(&self) -> Option<&Arc<Room>> {
        self.room.as_ref()
    }

    /// Handles one text frame. Every failure becomes an `error` reply on this
    /// connection and leaves the session state as it was.
    pub async fn handle_text(&mut self, text: &str) {
        let started = Instant::now();
        self.metrics.inc(Counter::MessagesReceived);

        let result = match ClientMessage::parse(text) {
            Ok(message) => {
                debug!("Peer {} sent {}", self.peer_id, message.action());
                self.handle_message(message).await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(Some(reply)) => self.send(&reply),
            Ok(None) => {}
            Err(e) => {
                self.metrics.inc(Counter::Errors);
                debug!("Rejected request from peer {}: {}", self.peer_id, e);
                self.send(&ServerMessage::Error { message: e.to_string() });
            }
        }

        self.metrics.observe_message_handling(started.elapsed());
    }

    async fn handle_message(&mut self, message: ClientMessage) -> HandlerResult {
        match message {
            ClientMessage::Join(request) => self.handle_join(request).await,
            ClientMessage::CreateTransport => self.handle_create_transport().await,
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.handle_connect_transport(&transport_id, dtls_parameters).await,
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.handle_produce(&transport_id, kind, rtp_parameters).await,
            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                self.handle_consume(&transport_id, producer_id.as_deref(), rtp_capabilities)
                    .await
            }
            ClientMessage::ResumeConsumer { consumer_id } => self.handle_resume_consumer(&consumer_id).await,
        }
    }

    /// Serializes a message onto this peer's outgoing channel
    fn send(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                error!("Failed to serialize reply for peer {}: {}", self.peer_id, e);
                return;
            }
        };
        if let Err(e) = self.sender.try_send(json) {
            warn!("Dropping reply to peer {}: {}", self.peer_id, e);
        }
    }

    /// The joined room, if it is still open
    fn joined_room(&self) -> Result<Arc<Room>, SignalingError> {
        let room = self.room.as_ref().ok_or(SignalingError::NotJoined)?;
        room.ensure_open()?;
        Ok(room.clone())
    }

    /// Resolves one of this connection's own transports. Entries the room
    /// no longer holds are pruned.
    fn resolve_transport(&mut self, room: &Room, transport_id: &str) -> Result<Arc<TransportEntry>, SignalingError> {
        let not_found = || MediaError::TransportNotFound(transport_id.to_string()).into();
        let entry = self.transports.get(transport_id).cloned().ok_or_else(not_found)?;
        if room.transport(transport_id).is_none() {
            // Released by DTLS closure since we last looked
            self.transports.remove(transport_id);
            return Err(not_found());
        }
        Ok(entry)
    }

    async fn handle_join(&mut self, request: JoinRequest) -> HandlerResult {
        let room_id = request
            .room_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(SignalingError::MissingRoomId)?;
        let role = request.role.unwrap_or_default();

        let rejoin = self
            .room
            .as_ref()
            .is_some_and(|room| room.id == room_id && !room.is_closed());
        let room = self.room_manager.get_or_create_room(&room_id).await?;
        if !rejoin {
            self.leave();
        }
        if !room.add_member(&self.peer_id, self.sender.clone()) {
            return Err(MediaError::RoomClosed(room_id).into());
        }

        self.role = role;
        self.room = Some(room.clone());
        self.metrics.inc(Counter::Joins);
        info!("Peer {} joined room {} as {}", self.peer_id, room.id, role.name());

        Ok(Some(ServerMessage::Joined {
            router_rtp_capabilities: room.router().rtp_capabilities(),
            ice_servers: self.ice_servers.for_peer(&self.peer_id),
            producers: room.producer_ids(),
        }))
    }

    async fn handle_create_transport(&mut self) -> HandlerResult {
        let room = self.joined_room()?;
        let (entry, info) = self.room_manager.create_transport(&room, &self.peer_id).await?;
        self.transports.insert(entry.app_id.clone(), entry);
        Ok(Some(ServerMessage::TransportCreated(info)))
    }

    async fn handle_connect_transport(&mut self, transport_id: &str, dtls_parameters: Value) -> HandlerResult {
        let room = self.joined_room()?;
        let transport = self.resolve_transport(&room, transport_id)?;
        self.room_manager
            .connect_transport(&room, &transport, dtls_parameters)
            .await?;
        Ok(Some(ServerMessage::TransportConnected {
            transport_id: transport.app_id.clone(),
        }))
    }

    async fn handle_produce(&mut self, transport_id: &str, kind: MediaKind, rtp_parameters: Value) -> HandlerResult {
        let room = self.joined_room()?;
        if !self.role.can_produce() {
            warn!("Peer {} with role {} tried to produce", self.peer_id, self.role.name());
            return Err(SignalingError::NotHost);
        }
        let transport = self.resolve_transport(&room, transport_id)?;

        let producer_id = self
            .room_manager
            .produce(&room, &transport, &self.peer_id, self.role, kind, rtp_parameters)
            .await?;

        room.broadcast_except(
            &self.peer_id,
            &ServerMessage::ProducerAdded {
                producer_id: producer_id.clone(),
            },
        );
        Ok(Some(ServerMessage::Produced { producer_id }))
    }

    async fn handle_consume(
        &mut self,
        transport_id: &str,
        producer_id: Option<&str>,
        rtp_capabilities: Value,
    ) -> HandlerResult {
        let room = self.joined_room()?;
        let transport = self.resolve_transport(&room, transport_id)?;
        let consumer = self
            .room_manager
            .consume(&room, &transport, producer_id, rtp_capabilities)
            .await?;
        Ok(Some(ServerMessage::Consumed(consumer)))
    }

    /// Unknown consumers, and peers with no open room, get no reply at all
    async fn handle_resume_consumer(&mut self, consumer_id: &str) -> HandlerResult {
        let Some(room) = self.room.clone().filter(|room| !room.is_closed()) else {
            return Ok(None);
        };
        match self.room_manager.resume_consumer(&room, consumer_id).await? {
            ResumeOutcome::Unknown => {
                debug!("Ignoring resume of unknown consumer {} from peer {}", consumer_id, self.peer_id);
                Ok(None)
            }
            ResumeOutcome::Resumed | ResumeOutcome::AlreadyActive => Ok(Some(ServerMessage::ConsumerResumed {
                consumer_id: consumer_id.to_string(),
            })),
        }
    }

    /// Closes this peer's transports and drops its room membership. The room
    /// itself stays.
    fn leave(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        for (app_id, _) in self.transports.drain() {
            self.room_manager.close_transport(&room, &app_id);
        }
        room.remove_member(&self.peer_id);
        info!("Peer {} left room {}", self.peer_id, room.id);
    }

    /// Disconnect cleanup
    pub fn close(&mut self) {
        self.leave();
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    ice_servers: Arc<IceServerConfig>,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this peer
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer_id = peer_id.clone();
    let send_metrics = metrics.clone();
    let mut keepalive = tokio::time::interval(ping_interval(idle_timeout));
    let send_task = tokio::spawn(async move {
        keepalive.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                json = rx.recv() => {
                    let Some(json) = json else { break };
                    send_metrics.inc(Counter::MessagesSent);
                    if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let mut session = PeerSession::new(peer_id.clone(), tx, room_manager, ice_servers, metrics);

    loop {
        // Idle timeout: close connection if no frame, pongs included, arrives
        // within idle_timeout
        let msg = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for peer {}: {}", peer_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => session.handle_text(text.as_str()).await,
            Message::Binary(_) => {
                debug!("Ignoring binary frame from peer {}", peer_id);
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.close();
    // Dropping the session drops the last sender, which ends the send task
    drop(session);
    if let Err(e) = send_task.await {
        error!("Send task for peer {} failed: {}", peer_id, e);
    }

    info!("WebSocket connection closed: {}", peer_id);
}
