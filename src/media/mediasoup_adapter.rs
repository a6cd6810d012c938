#![forbid(unsafe_code)]

// mediasoup-backed engine entities.
//
// mediasoup closes an entity when its last handle is dropped, so each wrapper
// keeps its handle in an Option and `close` takes it out.

use crate::media::config::WebRtcTransportConfig;
use crate::media::engine::{
    DtlsClosedCallback, EngineConsumer, EngineProducer, EngineRouter, EngineTransport,
};
use crate::media::types::{MediaError, MediaKind, MediaResult};
use async_trait::async_trait;
use mediasoup::data_structures::DtlsState;
use mediasoup::prelude::{
    Consumer, ConsumerOptions, DtlsParameters, Producer, ProducerId, ProducerOptions, Router,
    RtpCapabilities, RtpParameters, Transport, WebRtcTransport, WebRtcTransportRemoteParameters,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

fn to_json<T: Serialize>(value: &T, what: &str) -> MediaResult<Value> {
    serde_json::to_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

fn to_engine_kind(kind: MediaKind) -> mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
        MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
    }
}

fn from_engine_kind(kind: mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

pub struct MediasoupRouter {
    id: String,
    rtp_capabilities: Value,
    router: Mutex<Option<Router>>,
}

impl MediasoupRouter {
    pub fn new(router: Router) -> MediaResult<Self> {
        Ok(Self {
            id: router.id().to_string(),
            rtp_capabilities: to_json(router.rtp_capabilities(), "router rtpCapabilities")?,
            router: Mutex::new(Some(router)),
        })
    }

    fn handle(&self) -> MediaResult<Router> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Router(format!("router {} is closed", self.id)))
    }
}

#[async_trait]
impl EngineRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.handle() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        let Ok(capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn EngineTransport>> {
        let router = self.handle()?;

        let transport = router
            .create_webrtc_transport(config.to_transport_options())
            .await
            .map_err(|e| MediaError::Transport(format!("failed to create transport: {e}")))?;

        transport
            .set_min_outgoing_bitrate(config.minimum_available_outgoing_bitrate)
            .await?;
        if let Some(bitrate) = config.max_incoming_bitrate {
            transport.set_max_incoming_bitrate(bitrate).await?;
        }

        let transport_id = transport.id().to_string();
        transport
            .on_ice_state_change({
                let transport_id = transport_id.clone();
                move |ice_state| {
                    debug!("ICE state {:?} for transport {}", ice_state, transport_id);
                }
            })
            .detach();

        Ok(Arc::new(MediasoupTransport::new(transport)?))
    }

    fn close(&self) {
        if self.router.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Closed router {}", self.id);
        }
    }
}

pub struct MediasoupTransport {
    id: String,
    ice_parameters: Value,
    ice_candidates: Value,
    dtls_parameters: Value,
    transport: Mutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    fn new(transport: WebRtcTransport) -> MediaResult<Self> {
        Ok(Self {
            id: transport.id().to_string(),
            ice_parameters: to_json(transport.ice_parameters(), "iceParameters")?,
            ice_candidates: to_json(transport.ice_candidates(), "iceCandidates")?,
            dtls_parameters: to_json(&transport.dtls_parameters(), "dtlsParameters")?,
            transport: Mutex::new(Some(transport)),
        })
    }

    fn handle(&self) -> MediaResult<WebRtcTransport> {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Transport(format!("transport {} is closed", self.id)))
    }
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn ice_parameters(&self) -> Value {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Value {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Value {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtlsParameters")?;
        self.handle()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await?;
        Ok(())
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: Value) -> MediaResult<Arc<dyn EngineProducer>> {
        let rtp_parameters: RtpParameters = from_json(rtp_parameters, "rtpParameters")?;
        let producer = self
            .handle()?
            .produce(ProducerOptions::new(to_engine_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("failed to produce: {e}")))?;

        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> MediaResult<Arc<dyn EngineConsumer>> {
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::ProducerNotFound(producer_id.to_string()))?;
        let rtp_capabilities: RtpCapabilities = from_json(rtp_capabilities, "rtpCapabilities")?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = self
            .handle()?
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("failed to consume: {e}")))?;

        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: from_engine_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters(), "rtpParameters")?,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    fn on_dtls_closed(&self, callback: DtlsClosedCallback) {
        let Ok(transport) = self.handle() else {
            return;
        };
        let transport_id = self.id.clone();
        transport
            .on_dtls_state_change(move |dtls_state| {
                debug!("DTLS state {:?} for transport {}", dtls_state, transport_id);
                if matches!(dtls_state, DtlsState::Closed | DtlsState::Failed) {
                    callback();
                }
            })
            .detach();
    }

    fn close(&self) {
        if self.transport.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            info!("Closed transport {}", self.id);
        }
    }
}

pub struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if self.producer.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Closed producer {}", self.id);
        }
    }
}

pub struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer: Mutex<Option<Consumer>>,
}

#[async_trait]
impl EngineConsumer for MediasoupConsumer {
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
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Consumer(format!("consumer {} is closed", self.id)))?;
        consumer.resume().await?;
        Ok(())
    }

    fn close(&self) {
        if self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!("Closed consumer {}", self.id);
        }
    }
}
