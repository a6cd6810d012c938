#![forbid(unsafe_code)]

// liveclass-sfu library - signaling and media-session control plane for a
// mediasoup-based live classroom SFU

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
