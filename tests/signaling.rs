// End-to-end signaling over a real WebSocket against the in-memory engine

use futures_util::{SinkExt, StreamExt};
use liveclass_sfu::config::{EngineKind, ServerConfig};
use liveclass_sfu::media::MockEngine;
use liveclass_sfu::metrics::ServerMetrics;
use liveclass_sfu::room::RoomManager;
use liveclass_sfu::signaling::SignalingServer;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    engine: MockEngine,
    rooms: Arc<RoomManager>,
}

async fn start(config: ServerConfig) -> TestServer {
    let engine = MockEngine::new();
    let metrics = ServerMetrics::new();
    let rooms = Arc::new(RoomManager::new(
        Arc::new(engine.clone()),
        config.media.clone(),
        config.engine_timeout,
        metrics.clone(),
    ));
    let server = SignalingServer::new(rooms.clone(), &config, metrics);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener, std::future::pending()));

    TestServer { addr, engine, rooms }
}

fn mock_config() -> ServerConfig {
    ServerConfig {
        engine: EngineKind::Mock,
        ..ServerConfig::default()
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws/sfu")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, action: &str, data: Value) {
    let text = json!({ "action": action, "data": data }).to_string();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no message within 2s")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn request(ws: &mut Ws, action: &str, data: Value) -> Value {
    send(ws, action, data).await;
    recv(ws).await
}

async fn connected_transport(ws: &mut Ws) -> String {
    let created = request(ws, "createTransport", json!({})).await;
    assert_eq!(created["action"], "transportCreated", "{created}");
    assert!(created["data"]["iceParameters"].is_object());
    assert!(created["data"]["iceCandidates"].is_array());
    let transport_id = created["data"]["transportId"].as_str().unwrap().to_string();

    let connected = request(
        ws,
        "connectTransport",
        json!({
            "transportId": transport_id,
            "dtlsParameters": { "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA" }] }
        }),
    )
    .await;
    assert_eq!(connected["action"], "transportConnected", "{connected}");
    transport_id
}

/// Keeps reading for `period` without sending anything, so the client only
/// answers server pings. Returns the text messages seen meanwhile.
async fn stay_silent(ws: &mut Ws, period: Duration) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + period;
    let mut seen = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, ws.next()).await {
        match msg.unwrap() {
            Message::Text(text) => seen.push(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => panic!("server closed a silent connection"),
            _ => {}
        }
    }
    seen
}

/// Minimal HTTP/1.1 exchange, returns status code and body
async fn http(addr: SocketAddr, method: &str, path: &str, token: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let auth = token.map(|t| format!("Authorization: Bearer {t}\r\n")).unwrap_or_default();
    let request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\n{auth}Content-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = response.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn host_and_viewer_exchange_media() {
    let server = start(mock_config()).await;
    let mut host = connect(server.addr).await;
    let mut viewer = connect(server.addr).await;

    let joined = request(&mut host, "join", json!({ "role": "host", "roomId": "class-1" })).await;
    assert_eq!(joined["action"], "joined");
    assert_eq!(joined["data"]["producers"], json!([]));

    let host_transport = connected_transport(&mut host).await;
    let produced = request(
        &mut host,
        "produce",
        json!({
            "transportId": host_transport,
            "kind": "video",
            "rtpParameters": { "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }] }
        }),
    )
    .await;
    assert_eq!(produced["action"], "produced", "{produced}");
    let producer_id = produced["data"]["producerId"].as_str().unwrap().to_string();

    let joined = request(&mut viewer, "join", json!({ "role": "viewer", "roomId": "class-1" })).await;
    assert_eq!(joined["data"]["producers"], json!([producer_id]));

    let viewer_transport = connected_transport(&mut viewer).await;
    let consumed = request(
        &mut viewer,
        "consume",
        json!({
            "transportId": viewer_transport,
            "producerId": producer_id,
            "rtpCapabilities": { "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] }
        }),
    )
    .await;
    assert_eq!(consumed["action"], "consumed", "{consumed}");
    assert_eq!(consumed["data"]["kind"], "video");
    let consumer_id = consumed["data"]["id"].as_str().unwrap().to_string();

    let resumed = request(&mut viewer, "resumeConsumer", json!({ "consumerId": consumer_id })).await;
    assert_eq!(resumed["action"], "consumerResumed");
    assert_eq!(server.engine.resume_calls(&consumer_id), 1);

    // Viewer disconnect releases its transport and consumer, the room stays
    viewer.close(None).await.unwrap();
    let room = server.rooms.get_room("class-1").unwrap();
    for _ in 0..200 {
        if room.consumer_count() == 0 && room.member_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(room.consumer_count(), 0);
    assert_eq!(room.producer_count(), 1);
    assert_eq!(server.engine.open_consumers(), 0);
    assert_eq!(server.rooms.room_count(), 1);
}

#[tokio::test]
async fn viewer_receives_producer_added() {
    let server = start(mock_config()).await;
    let mut host = connect(server.addr).await;
    let mut viewer = connect(server.addr).await;

    request(&mut viewer, "join", json!({ "role": "viewer", "roomId": "class-9" })).await;
    request(&mut host, "join", json!({ "role": "host", "roomId": "class-9" })).await;
    let transport = connected_transport(&mut host).await;
    let produced = request(
        &mut host,
        "produce",
        json!({
            "transportId": transport,
            "kind": "audio",
            "rtpParameters": { "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }] }
        }),
    )
    .await;

    let notice = recv(&mut viewer).await;
    assert_eq!(notice["action"], "producerAdded");
    assert_eq!(notice["data"]["producerId"], produced["data"]["producerId"]);

    let reply = request(
        &mut viewer,
        "produce",
        json!({ "transportId": "x", "kind": "video", "rtpParameters": {} }),
    )
    .await;
    assert_eq!(reply, json!({ "action": "error", "data": { "message": "only host can produce" } }));
}

#[tokio::test]
async fn http_endpoints() {
    let config = ServerConfig {
        metrics_token: Some("m".to_string()),
        control_token: Some("c".to_string()),
        ..mock_config()
    };
    let server = start(config).await;

    let (status, body) = http(server.addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert!(body.contains("\"rooms\":0"));

    assert_eq!(http(server.addr, "GET", "/metrics", None).await.0, 401);
    let (status, body) = http(server.addr, "GET", "/metrics", Some("m")).await;
    assert_eq!(status, 200);
    assert!(body.contains("liveclass_sfu_connections_total"));

    assert_eq!(http(server.addr, "GET", "/elsewhere", None).await.0, 404);
    assert!(connect_async(format!("ws://{}/chat", server.addr)).await.is_err());

    let mut ws = connect(server.addr).await;
    request(&mut ws, "join", json!({ "role": "host", "roomId": "class-3" })).await;

    assert_eq!(http(server.addr, "POST", "/rooms/class-3/close", None).await.0, 401);
    assert_eq!(http(server.addr, "POST", "/rooms/class-3/close", Some("c")).await.0, 200);
    assert_eq!(http(server.addr, "POST", "/rooms/class-3/close", Some("c")).await.0, 404);

    let notice = recv(&mut ws).await;
    assert_eq!(notice, json!({ "action": "roomClosed", "data": { "roomId": "class-3" } }));
    assert_eq!(server.engine.open_routers(), 0);
}

#[tokio::test]
async fn nested_signaling_path_upgrades() {
    let server = start(mock_config()).await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws/sfu/class-4", server.addr)).await.unwrap();
    let reply = request(&mut ws, "join", json!({ "roomId": "class-4" })).await;
    assert_eq!(reply["action"], "joined");
}

#[tokio::test]
async fn silent_peers_outlive_idle_timeout() {
    let config = ServerConfig {
        idle_timeout: Duration::from_secs(1),
        ..mock_config()
    };
    let server = start(config).await;
    let mut host = connect(server.addr).await;
    let mut viewer = connect(server.addr).await;

    request(&mut host, "join", json!({ "role": "host", "roomId": "class-5" })).await;
    let host_transport = connected_transport(&mut host).await;
    let produced = request(
        &mut host,
        "produce",
        json!({
            "transportId": host_transport,
            "kind": "video",
            "rtpParameters": { "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }] }
        }),
    )
    .await;
    let producer_id = produced["data"]["producerId"].as_str().unwrap().to_string();

    request(&mut viewer, "join", json!({ "role": "viewer", "roomId": "class-5" })).await;
    let viewer_transport = connected_transport(&mut viewer).await;
    let consumed = request(
        &mut viewer,
        "consume",
        json!({
            "transportId": viewer_transport,
            "producerId": producer_id,
            "rtpCapabilities": { "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }] }
        }),
    )
    .await;
    let consumer_id = consumed["data"]["id"].as_str().unwrap().to_string();
    request(&mut viewer, "resumeConsumer", json!({ "consumerId": consumer_id })).await;

    let (host_seen, viewer_seen) = tokio::join!(
        stay_silent(&mut host, Duration::from_secs(2)),
        stay_silent(&mut viewer, Duration::from_secs(2)),
    );
    assert!(host_seen.is_empty(), "{host_seen:?}");
    assert!(viewer_seen.is_empty(), "{viewer_seen:?}");

    let room = server.rooms.get_room("class-5").unwrap();
    assert_eq!(room.member_count(), 2);
    assert_eq!(room.producer_count(), 1);
    assert!(room.consumer(&consumer_id).is_some());
    assert!(server.engine.is_consumer_open(&consumer_id));
}
