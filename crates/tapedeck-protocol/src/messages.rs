use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of the ingest endpoint: `param` holds the encoded offer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub param: Value,
}

impl IngestRequest {
    pub fn offer(&self) -> Option<&str> {
        self.param.as_str()
    }
}

/// Body of the playback endpoint.
///
/// `base` holds the encoded offer; the relay server fields are used for this
/// connection only. `recording` selects a stored session, the demo files are
/// played when it is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybackRequest {
    #[serde(default)]
    pub base: Value,
    pub url: Option<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
    pub recording: Option<String>,
}

impl PlaybackRequest {
    pub fn offer(&self) -> Option<&str> {
        self.base.as_str()
    }

    pub fn relay_server(&self) -> Option<RelayServer> {
        match (&self.url, &self.username, &self.credential) {
            (Some(url), Some(username), Some(credential)) if !url.is_empty() => Some(RelayServer {
                url: url.clone(),
                username: username.clone(),
                credential: credential.clone(),
            }),
            _ => None,
        }
    }
}

/// Relay (TURN) server supplied by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Response of the recording listing endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingList {
    pub uuids: Vec<String>,
}
