#![forbid(unsafe_code)]

// ICE server list handed to peers at join.
// Time-limited TURN credentials use HMAC-SHA1 per the TURN REST API scheme
// (coturn --use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TurnCredentials {
    Static { username: String, credential: String },
    /// Shared secret, credentials expire after `ttl_secs`
    Ephemeral { secret: String, ttl_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct TurnServers {
    pub urls: Vec<String>,
    pub credentials: TurnCredentials,
}

/// Relay-traversal servers from the environment
#[derive(Debug, Clone, Default)]
pub struct IceServerConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServers>,
}

impl IceServerConfig {
    /// Server list for one peer; ephemeral TURN credentials are minted per call
    pub fn for_peer(&self, peer_id: &str) -> Vec<IceServer> {
        let mut servers = Vec::with_capacity(2);
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = &self.turn {
            let (username, credential) = match &turn.credentials {
                TurnCredentials::Static { username, credential } => (username.clone(), credential.clone()),
                TurnCredentials::Ephemeral { secret, ttl_secs } => {
                    let expiry = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs()
                        + ttl_secs;
                    let username = format!("{expiry}:{peer_id}");
                    let credential = sign(secret, &username);
                    (username, credential)
                }
            };
            servers.push(IceServer {
                urls: turn.urls.clone(),
                username: Some(username),
                credential: Some(credential),
            });
        }
        servers
    }
}

/// base64(HMAC-SHA1(secret, username))
fn sign(secret: &str, username: &str) -> String {
    // HMAC takes keys of any length, so this never fails in practice
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_yields_no_servers() {
        assert!(IceServerConfig::default().for_peer("p1").is_empty());
    }

    #[test]
    fn test_static_credentials() {
        let config = IceServerConfig {
            stun_urls: vec!["stun:stun.example.com:3478".to_string()],
            turn: Some(TurnServers {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                credentials: TurnCredentials::Static {
                    username: "classroom".to_string(),
                    credential: "s3cret".to_string(),
                },
            }),
        };
        let servers = config.for_peer("p1");
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].username, None);
        assert_eq!(servers[1].username.as_deref(), Some("classroom"));
        assert_eq!(servers[1].credential.as_deref(), Some("s3cret"));

        let value = serde_json::to_value(&servers[0]).unwrap();
        assert!(value.get("username").is_none());
    }

    #[test]
    fn test_ephemeral_credentials() {
        let config = IceServerConfig {
            stun_urls: vec![],
            turn: Some(TurnServers {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                credentials: TurnCredentials::Ephemeral {
                    secret: "shared".to_string(),
                    ttl_secs: 3600,
                },
            }),
        };
        let servers = config.for_peer("peer-7");
        assert_eq!(servers.len(), 1);

        let username = servers[0].username.clone().unwrap();
        let (expiry, peer) = username.split_once(':').unwrap();
        assert_eq!(peer, "peer-7");
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let expiry: u64 = expiry.parse().unwrap();
        assert!(expiry > now && expiry <= now + 3600);
        assert_eq!(servers[0].credential.as_deref(), Some(sign("shared", &username).as_str()));
    }

    #[test]
    fn test_sign_known_vector() {
        // RFC 2202 test case 2
        assert_eq!(sign("Jefe", "what do ya want for nothing?"), "7/zfauXrL6LSdBbV8YTfnCWafHk=");
    }
}
