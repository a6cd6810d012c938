#![forbid(unsafe_code)]

// Media module - capability interface onto the relay engine, its mediasoup
// and in-memory implementations, and the transport factory

pub mod config;
pub mod engine;
pub mod mediasoup_adapter;
pub mod mock;
pub mod transport_manager;
pub mod types;
pub mod worker_manager;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use engine::{EngineConsumer, EngineProducer, EngineRouter, EngineTransport, MediaEngine};
pub use mock::MockEngine;
pub use transport_manager::TransportFactory;
pub use types::{ConsumerInfo, MediaError, MediaKind, MediaResult, TransportInfo};
pub use worker_manager::MediasoupEngine;
