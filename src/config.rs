#![forbid(unsafe_code)]

// Server configuration from environment variables

use crate::media::MediaConfig;
use crate::turn::{IceServerConfig, TurnCredentials, TurnServers};
use anyhow::{anyhow, bail, Context, Result};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_WS_PATH: &str = "/ws/sfu";
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Which media engine backs the rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Mediasoup,
    /// In-memory engine, no media flows
    Mock,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub ws_path: String,
    pub engine: EngineKind,
    pub media: MediaConfig,
    pub ice_servers: IceServerConfig,
    pub engine_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub metrics_token: Option<String>,
    pub control_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            ws_path: DEFAULT_WS_PATH.to_string(),
            engine: EngineKind::Mediasoup,
            media: MediaConfig::default(),
            ice_servers: IceServerConfig::default(),
            engine_timeout: Duration::from_millis(10_000),
            idle_timeout: Duration::from_secs(300),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
            control_token: None,
        }
    }
}

fn parse<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}")),
    }
}

fn url_list(value: Option<String>) -> Vec<String> {
    value
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_ws_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || !trimmed.starts_with('/') {
        bail!("invalid WS_PATH={raw:?}: must be an absolute path below /");
    }
    Ok(trimmed.to_string())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = parse("PORT", var("PORT"))? {
            config.port = port;
        }
        if let Some(path) = var("WS_PATH") {
            config.ws_path = normalize_ws_path(&path)?;
        }
        config.engine = match var("MEDIA_ENGINE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("mediasoup") => EngineKind::Mediasoup,
            Some("mock") => EngineKind::Mock,
            Some(other) => bail!("invalid MEDIA_ENGINE={other:?}: expected mediasoup or mock"),
        };

        let transport = &mut config.media.webrtc_transport_config;
        if let Some(ip) = parse::<IpAddr>("LISTEN_IP", var("LISTEN_IP"))? {
            transport.listen_ip = ip;
        }
        if let Some(ip) = parse::<IpAddr>("ANNOUNCED_IP", var("ANNOUNCED_IP"))? {
            *transport = transport.clone().with_public_ip(ip);
        }
        if let Some(port) = parse("RTC_MIN_PORT", var("RTC_MIN_PORT"))? {
            transport.rtc_min_port = port;
        }
        if let Some(port) = parse("RTC_MAX_PORT", var("RTC_MAX_PORT"))? {
            transport.rtc_max_port = port;
        }
        if transport.rtc_min_port > transport.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) is above RTC_MAX_PORT ({})",
                transport.rtc_min_port,
                transport.rtc_max_port
            );
        }
        if let Some(bitrate) = parse("INITIAL_OUTGOING_BITRATE", var("INITIAL_OUTGOING_BITRATE"))? {
            transport.initial_available_outgoing_bitrate = bitrate;
        }
        if let Some(bitrate) = parse("MIN_OUTGOING_BITRATE", var("MIN_OUTGOING_BITRATE"))? {
            transport.minimum_available_outgoing_bitrate = bitrate;
        }
        transport.max_incoming_bitrate = parse("MAX_INCOMING_BITRATE", var("MAX_INCOMING_BITRATE"))?;

        config.ice_servers = Self::ice_servers(&var)?;

        if let Some(ms) = parse::<u64>("ENGINE_TIMEOUT_MS", var("ENGINE_TIMEOUT_MS"))? {
            if ms == 0 {
                bail!("ENGINE_TIMEOUT_MS must be positive, 0 would fail every engine call");
            }
            config.engine_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>("IDLE_TIMEOUT_SECS", var("IDLE_TIMEOUT_SECS"))? {
            if secs == 0 {
                bail!("IDLE_TIMEOUT_SECS must be positive, 0 would drop every connection");
            }
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<usize>("MAX_CONNECTIONS", var("MAX_CONNECTIONS"))? {
            if max == 0 {
                warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            } else {
                config.max_connections = max;
            }
        }
        config.metrics_token = var("METRICS_TOKEN");
        config.control_token = var("CONTROL_TOKEN");

        Ok(config)
    }

    fn ice_servers(var: &dyn Fn(&str) -> Option<String>) -> Result<IceServerConfig> {
        let stun_urls = url_list(var("STUN_URLS"));
        let turn_urls = url_list(var("TURN_URLS"));
        if turn_urls.is_empty() {
            return Ok(IceServerConfig { stun_urls, turn: None });
        }

        let credentials = match (var("TURN_SECRET"), var("TURN_USERNAME"), var("TURN_CREDENTIAL")) {
            (Some(secret), _, _) => TurnCredentials::Ephemeral {
                secret,
                ttl_secs: parse("TURN_TTL", var("TURN_TTL"))?.unwrap_or(86_400),
            },
            (None, Some(username), Some(credential)) => TurnCredentials::Static { username, credential },
            _ => bail!("TURN_URLS needs TURN_SECRET or TURN_USERNAME and TURN_CREDENTIAL"),
        };

        Ok(IceServerConfig {
            stun_urls,
            turn: Some(TurnServers { urls: turn_urls, credentials }),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

/// Reads configuration and reports which variable broke it
pub fn load() -> Result<ServerConfig> {
    ServerConfig::from_env().context("failed to load configuration from environment")
}
