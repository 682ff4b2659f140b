//! Session connection state machine
//!
//! ICE connection-state callbacks are turned into `SessionState` events and
//! fed through [`transition`], which is the only place that decides when the
//! connected signal fires and when a session is torn down.

use crate::error::PipelineError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn from_ice(state: RTCIceConnectionState) -> Option<Self> {
        match state {
            RTCIceConnectionState::New => Some(SessionState::New),
            RTCIceConnectionState::Checking => Some(SessionState::Checking),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                Some(SessionState::Connected)
            }
            RTCIceConnectionState::Disconnected => Some(SessionState::Disconnected),
            RTCIceConnectionState::Failed => Some(SessionState::Failed),
            RTCIceConnectionState::Closed => Some(SessionState::Closed),
            RTCIceConnectionState::Unspecified => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Checking => "checking",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SignalConnected,
    Teardown,
}

/// Apply an observed state to the current one.
///
/// Terminal states absorb every later event. Reaching Connected again after
/// it already fired yields no action.
pub fn transition(
    current: SessionState,
    observed: SessionState,
) -> (SessionState, Option<Action>) {
    if current.is_terminal() {
        return (current, None);
    }

    match observed {
        SessionState::Connected if current != SessionState::Connected => {
            (SessionState::Connected, Some(Action::SignalConnected))
        }
        SessionState::Disconnected | SessionState::Failed | SessionState::Closed => {
            (observed, Some(Action::Teardown))
        }
        _ => (observed, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    Connected,
    Closed,
}

/// One-shot broadcast released when the peer first connects
#[derive(Clone)]
pub struct ConnectedSignal {
    tx: Arc<watch::Sender<Signal>>,
}

impl Default for ConnectedSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectedSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Signal::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Release all waiters. Returns false if the signal was already settled.
    pub fn fire(&self) -> bool {
        self.settle(Signal::Connected)
    }

    /// Release all waiters with an error, unless already connected
    pub fn close(&self) -> bool {
        self.settle(Signal::Closed)
    }

    fn settle(&self, to: Signal) -> bool {
        self.tx.send_if_modified(|value| {
            if *value == Signal::Pending {
                *value = to;
                true
            } else {
                false
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow() == Signal::Connected
    }

    /// Wait until the signal settles or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> Result<(), PipelineError> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(|s| *s != Signal::Pending))
            .await
            .map_err(|_| PipelineError::ConnectTimeout(timeout))?;

        match settled.map(|s| *s) {
            Ok(Signal::Connected) => Ok(()),
            _ => Err(PipelineError::SessionClosed),
        }
    }
}
