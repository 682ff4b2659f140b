//! Recording and playback sessions
//!
//! A session is one peer connection plus the pipelines attached to it. Its
//! lifetime is driven by connection-state events fed through the transition
//! table in [`state`].

pub mod binding;
pub mod ingest;
pub mod negotiator;
pub mod orchestrator;
pub mod playback;
pub mod state;

pub use binding::{Direction, TrackBinding};
pub use orchestrator::SessionManager;
pub use state::{ConnectedSignal, SessionState};

use binding::LocalSampleSink;
use ingest::SharedWriter;
use state::{transition, Action};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapedeck_media::MediaKind;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;

/// How long teardown waits for ingest pipelines to finalize their files
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Ingest,
    Playback,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Ingest => f.write_str("ingest"),
            SessionMode::Playback => f.write_str("playback"),
        }
    }
}

pub struct Session {
    pub id: Uuid,
    pub mode: SessionMode,
    pc: Arc<RTCPeerConnection>,
    state: RwLock<SessionState>,
    connected: ConnectedSignal,
    bindings: RwLock<Vec<TrackBinding>>,
    /// Container writers to finalize on teardown
    writers: Mutex<Vec<SharedWriter>>,
    /// Local tracks to stop on teardown
    sinks: Mutex<Vec<Arc<LocalSampleSink>>>,
    audio_claimed: AtomicBool,
    video_claimed: AtomicBool,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(id: Uuid, mode: SessionMode, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            mode,
            pc,
            state: RwLock::new(SessionState::New),
            connected: ConnectedSignal::new(),
            bindings: RwLock::new(vec![]),
            writers: Mutex::new(vec![]),
            sinks: Mutex::new(vec![]),
            audio_claimed: AtomicBool::new(false),
            video_claimed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub fn connected(&self) -> &ConnectedSignal {
        &self.connected
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn bindings(&self) -> Vec<TrackBinding> {
        self.bindings.read().await.clone()
    }

    pub async fn add_binding(&self, binding: TrackBinding) {
        self.bindings.write().await.push(binding);
    }

    /// First caller for a kind wins; one pipeline per kind
    pub fn claim(&self, kind: MediaKind) -> bool {
        let flag = match kind {
            MediaKind::Audio => &self.audio_claimed,
            MediaKind::Video => &self.video_claimed,
        };
        !flag.swap(true, Ordering::SeqCst)
    }

    pub async fn add_writer(&self, writer: SharedWriter) {
        self.writers.lock().await.push(writer);
    }

    pub async fn add_sink(&self, sink: Arc<LocalSampleSink>) {
        self.sinks.lock().await.push(sink);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Feed one observed state through the transition table
    pub async fn apply(&self, observed: SessionState) -> Option<Action> {
        let mut state = self.state.write().await;
        let (next, action) = transition(*state, observed);
        if next != *state {
            tracing::info!("Session {} ({}) {} -> {}", self.id, self.mode, *state, next);
        }
        *state = next;
        action
    }

    /// Stop tracks, close the connection and finalize containers. Runs once.
    ///
    /// Closing the connection ends every remote track, so ingest pipelines
    /// flush their last frame and close their own writers. Writers still open
    /// after [`DRAIN_TIMEOUT`] are closed here.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for sink in self.sinks.lock().await.iter() {
            sink.close();
        }

        self.connected.close();

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }

        let writers = self.writers.lock().await.clone();
        if tokio::time::timeout(DRAIN_TIMEOUT, wait_closed(&writers))
            .await
            .is_err()
        {
            tracing::warn!("Session {} pipelines did not drain in time", self.id);
        }
        for writer in &writers {
            if let Err(e) = writer.lock().await.close() {
                tracing::error!("Session {} failed to finalize container: {}", self.id, e);
            }
        }

        tracing::info!("Session {} ({}) torn down", self.id, self.mode);
    }
}

async fn wait_closed(writers: &[SharedWriter]) {
    for writer in writers {
        while !writer.lock().await.is_closed() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// Live sessions by identifier
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.id, session);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Consume connection-state events until the session ends
pub fn spawn_driver(
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<SessionState>,
    registry: Arc<SessionRegistry>,
) {
    tokio::spawn(async move {
        while let Some(observed) = events.recv().await {
            match session.apply(observed).await {
                Some(Action::SignalConnected) => {
                    session.connected().fire();
                }
                Some(Action::Teardown) => {
                    session.teardown().await;
                    break;
                }
                None => {}
            }
        }

        // Also reached when the connection drops its observer
        session.teardown().await;
        registry.remove(session.id).await;
    });
}
