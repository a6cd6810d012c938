#![forbid(unsafe_code)]

// In-process media engine. Keeps every entity in memory, counts what is open,
// and checks consumer compatibility by codec mime type. Backs the test suite
// and `MEDIA_ENGINE=mock` for protocol work without a mediasoup worker.

use crate::media::config::{RouterConfig, WebRtcTransportConfig};
use crate::media::engine::{
    DtlsClosedCallback, EngineConsumer, EngineProducer, EngineRouter, EngineTransport, MediaEngine,
};
use crate::media::types::{MediaError, MediaKind, MediaResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    workers_started: usize,
    routers_created: usize,
    open_routers: HashSet<String>,
    open_transports: HashMap<String, Arc<MockTransport>>,
    /// producer id -> codec mime types (lowercase) and kind
    open_producers: HashMap<String, (MediaKind, Vec<String>, Value)>,
    open_consumers: HashSet<String>,
    resume_calls: HashMap<String, usize>,
    close_log: Vec<String>,
    max_incoming_bitrates: Vec<Option<u32>>,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    router_delay: Arc<Mutex<Option<Duration>>>,
    stall_transports: Arc<AtomicBool>,
    stall_produce: Arc<AtomicBool>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delays router creation so concurrent joins overlap
    pub fn set_router_delay(&self, delay: Duration) {
        *self.router_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Makes transport creation hang forever
    pub fn set_stall_transports(&self, stall: bool) {
        self.stall_transports.store(stall, Ordering::SeqCst);
    }

    /// Makes produce hang forever
    pub fn set_stall_produce(&self, stall: bool) {
        self.stall_produce.store(stall, Ordering::SeqCst);
    }

    pub fn workers_started(&self) -> usize {
        self.state().workers_started
    }

    pub fn routers_created(&self) -> usize {
        self.state().routers_created
    }

    pub fn open_routers(&self) -> usize {
        self.state().open_routers.len()
    }

    pub fn open_transports(&self) -> usize {
        self.state().open_transports.len()
    }

    pub fn open_producers(&self) -> usize {
        self.state().open_producers.len()
    }

    pub fn open_consumers(&self) -> usize {
        self.state().open_consumers.len()
    }

    pub fn is_consumer_open(&self, consumer_id: &str) -> bool {
        self.state().open_consumers.contains(consumer_id)
    }

    pub fn resume_calls(&self, consumer_id: &str) -> usize {
        self.state().resume_calls.get(consumer_id).copied().unwrap_or(0)
    }

    /// Close events in order, e.g. `consumer:<id>`, `transport:<id>`
    pub fn close_log(&self) -> Vec<String> {
        self.state().close_log.clone()
    }

    pub fn max_incoming_bitrates(&self) -> Vec<Option<u32>> {
        self.state().max_incoming_bitrates.clone()
    }

    /// Simulates the DTLS state of a transport reaching `closed`
    pub fn trigger_dtls_closed(&self, transport_id: &str) -> bool {
        let transport = self.state().open_transports.get(transport_id).cloned();
        match transport {
            Some(transport) => {
                let callbacks = transport.callbacks.lock().unwrap_or_else(|e| e.into_inner());
                for callback in callbacks.iter() {
                    callback();
                }
                true
            }
            None => false,
        }
    }
}

fn codec_mime_types(parameters: &Value) -> Vec<String> {
    parameters
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|codec| codec.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn EngineRouter>> {
        {
            let mut state = self.state();
            if state.workers_started == 0 {
                state.workers_started = 1;
            }
        }

        let delay = *self.router_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let codecs = serde_json::to_value(&config.media_codecs)
            .map_err(|e| MediaError::Router(e.to_string()))?;
        let router = MockRouter {
            id: Uuid::new_v4().to_string(),
            rtp_capabilities: json!({ "codecs": codecs, "headerExtensions": [] }),
            engine: self.clone(),
        };

        let mut state = self.state();
        state.routers_created += 1;
        state.open_routers.insert(router.id.clone());
        Ok(Arc::new(router))
    }
}

struct MockRouter {
    id: String,
    rtp_capabilities: Value,
    engine: MockEngine,
}

#[async_trait]
impl EngineRouter for MockRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let state = self.engine.state();
        let Some((_, producer_mimes, _)) = state.open_producers.get(producer_id) else {
            return false;
        };
        let accepted = codec_mime_types(rtp_capabilities);
        producer_mimes.iter().any(|mime| accepted.contains(mime))
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>> {
        if self.engine.stall_transports.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let transport = Arc::new(MockTransport {
            id: Uuid::new_v4().to_string(),
            engine: self.engine.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        });

        let mut state = self.engine.state();
        state.max_incoming_bitrates.push(config.max_incoming_bitrate);
        state.open_transports.insert(transport.id.clone(), transport.clone());
        Ok(transport)
    }

    fn close(&self) {
        let mut state = self.engine.state();
        if state.open_routers.remove(&self.id) {
            state.close_log.push(format!("router:{}", self.id));
        }
    }
}

pub struct MockTransport {
    id: String,
    engine: MockEngine,
    connected: AtomicBool,
    closed: AtomicBool,
    callbacks: Mutex<Vec<DtlsClosedCallback>>,
}

impl MockTransport {
    fn ensure_open(&self) -> MediaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Transport(format!("transport {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ice_parameters(&self) -> Value {
        json!({ "usernameFragment": format!("ufrag-{}", &self.id[..8]), "password": "mock", "iceLite": true })
    }

    fn ice_candidates(&self) -> Value {
        json!([{
            "foundation": "udpcandidate",
            "priority": 1076302079,
            "address": "127.0.0.1",
            "protocol": "udp",
            "port": 40000,
            "type": "host"
        }])
    }

    fn dtls_parameters(&self) -> Value {
        json!({ "role": "auto", "fingerprints": [{ "algorithm": "sha-256", "value": "00:11" }] })
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_open()?;
        if dtls_parameters.get("fingerprints").is_none() {
            return Err(MediaError::InvalidParameters("dtlsParameters: missing fingerprints".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Transport(format!("transport {} already connected", self.id)));
        }
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Arc<dyn EngineProducer>> {
        self.ensure_open()?;
        if self.engine.stall_produce.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mimes = codec_mime_types(&rtp_parameters);
        if mimes.is_empty() {
            return Err(MediaError::InvalidParameters("rtpParameters: no codecs".to_string()));
        }

        let producer = MockProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            engine: self.engine.clone(),
        };
        self.engine
            .state()
            .open_producers
            .insert(producer.id.clone(), (kind, mimes, rtp_parameters));
        Ok(Arc::new(producer))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        _paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>> {
        self.ensure_open()?;
        let mut state = self.engine.state();
        let (kind, _, rtp_parameters) = state
            .open_producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;

        let consumer = MockConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            engine: self.engine.clone(),
        };
        state.open_consumers.insert(consumer.id.clone());
        Ok(Arc::new(consumer))
    }

    fn on_dtls_closed(&self, callback: DtlsClosedCallback) {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).push(callback);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the callbacks releases any watcher waiting on them
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let mut state = self.engine.state();
        state.open_transports.remove(&self.id);
        state.close_log.push(format!("transport:{}", self.id));
    }
}

struct MockProducer {
    id: String,
    kind: MediaKind,
    engine: MockEngine,
}

impl EngineProducer for MockProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        let mut state = self.engine.state();
        if state.open_producers.remove(&self.id).is_some() {
            state.close_log.push(format!("producer:{}", self.id));
        }
    }
}

struct MockConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    engine: MockEngine,
}

#[async_trait]
impl EngineConsumer for MockConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> MediaResult<()> {
        let mut state = self.engine.state();
        if !state.open_consumers.contains(&self.id) {
            return Err(MediaError::Consumer(format!("consumer {} is closed", self.id)));
        }
        *state.resume_calls.entry(self.id.clone()).or_default() += 1;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.engine.state();
        if state.open_consumers.remove(&self.id) {
            state.close_log.push(format!("consumer:{}", self.id));
        }
    }
}
