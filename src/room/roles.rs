#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Role a peer claims at `join`. Anything unrecognised falls back to viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    #[default]
    #[serde(other)]
    Viewer,
}

impl PeerRole {
    pub fn name(&self) -> &'static str {
        match self {
            PeerRole::Host => "host",
            PeerRole::Viewer => "viewer",
        }
    }

    pub fn can_produce(&self) -> bool {
        matches!(self, PeerRole::Host)
    }
}
