use crate::session::SessionManager;
use crate::storage::RecordingStore;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub storage_root: PathBuf,
    pub allowed_origins: Vec<String>,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Deadline for candidate gathering during a handshake
    pub gather_timeout: Duration,
    /// Deadline for a playback peer to reach Connected
    pub connect_timeout: Duration,
    /// Period of keyframe requests on received video
    pub keyframe_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Flat settings as read from the environment
#[derive(Debug, Deserialize)]
struct RawConfig {
    bind_address: String,
    storage_root: String,
    allowed_origins: String,
    stun_servers: String,
    turn_url: Option<String>,
    turn_username: Option<String>,
    turn_credential: Option<String>,
    gather_timeout_ms: u64,
    connect_timeout_ms: u64,
    keyframe_interval_ms: u64,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Defaults, overridden by `TAPEDECK_*` variables (a `.env` file is honoured)
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        let raw: RawConfig = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:4000")?
            .set_default("storage_root", "./files")?
            .set_default("allowed_origins", "http://localhost:5173")?
            .set_default("stun_servers", "stun:stun.l.google.com:19302")?
            .set_default("gather_timeout_ms", 5_000_i64)?
            .set_default("connect_timeout_ms", 30_000_i64)?
            .set_default("keyframe_interval_ms", 3_000_i64)?
            .add_source(config::Environment::with_prefix("TAPEDECK").try_parsing(true))
            .build()?
            .try_deserialize()?;

        let turn_servers = match (raw.turn_url, raw.turn_username, raw.turn_credential) {
            (Some(url), Some(username), Some(credential)) => vec![TurnServer {
                url,
                username,
                credential,
            }],
            (Some(url), _, _) => {
                tracing::warn!("TURN server {} configured without credentials, ignoring", url);
                vec![]
            }
            _ => vec![],
        };

        Ok(Config {
            bind_address: raw.bind_address,
            storage_root: PathBuf::from(raw.storage_root),
            allowed_origins: split_list(&raw.allowed_origins),
            stun_servers: split_list(&raw.stun_servers),
            turn_servers,
            gather_timeout: Duration::from_millis(raw.gather_timeout_ms),
            connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
            keyframe_interval: Duration::from_millis(raw.keyframe_interval_ms),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: RecordingStore,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store = RecordingStore::new(config.storage_root.clone());
        let sessions = Arc::new(SessionManager::new(&config, store.clone())?);

        Ok(Self {
            config,
            store,
            sessions,
        })
    }
}
