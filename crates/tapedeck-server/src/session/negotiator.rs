//! Single-shot, non-trickle offer/answer handshake
//!
//! Every local capability is attached before the answer is generated, and the
//! answer is only returned once candidate gathering has finished, so the
//! caller gets a complete description in one response.

use super::state::SessionState;
use crate::error::{AppError, Result};
use crate::webrtc::rtp_codec_type;
use std::sync::Arc;
use std::time::Duration;
use tapedeck_media::MediaKind;
use tapedeck_protocol::SessionDescription;
use tokio::sync::mpsc;
use webrtc::api::API;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Something the local side declares before answering
pub enum Capability {
    /// Accept media of this kind from the peer
    Receive(MediaKind),
    /// Offer this local track to the peer
    Send(Arc<TrackLocalStaticSample>),
}

/// Result of a completed handshake
pub struct Negotiated {
    pub answer: SessionDescription,
    /// Connection state changes, in the order they were observed
    pub events: mpsc::UnboundedReceiver<SessionState>,
}

pub struct Negotiator {
    pc: Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
}

impl Negotiator {
    /// Validate the offer and create a fresh peer connection
    pub async fn new(
        api: &API,
        ice_servers: Vec<RTCIceServer>,
        offer: &SessionDescription,
    ) -> Result<Self> {
        let offer = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| AppError::MalformedOffer(e.to_string()))?;

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        Ok(Self { pc, offer })
    }

    /// The connection being negotiated, for wiring track observers
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Attach `capabilities`, apply the offer and produce the final answer.
    /// The connection is closed if any step fails.
    pub async fn run(
        self,
        capabilities: Vec<Capability>,
        gather_timeout: Duration,
    ) -> Result<Negotiated> {
        match self.handshake(capabilities, gather_timeout).await {
            Ok(negotiated) => Ok(negotiated),
            Err(e) => {
                tracing::warn!("Negotiation failed: {}", e);
                if let Err(close_err) = self.pc.close().await {
                    tracing::warn!("Error closing peer connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        capabilities: Vec<Capability>,
        gather_timeout: Duration,
    ) -> Result<Negotiated> {
        for capability in capabilities {
            self.attach(capability).await?;
        }

        let (tx, events) = mpsc::unbounded_channel();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                tracing::debug!("ICE connection state changed to {}", state);
                if let Some(state) = SessionState::from_ice(state) {
                    let _ = tx.send(state);
                }
                Box::pin(async {})
            }));

        self.pc
            .set_remote_description(self.offer.clone())
            .await
            .map_err(|e| AppError::RemoteDescriptionRejected(e.to_string()))?;

        let answer = self.pc.create_answer(None).await?;

        // Gathering starts once the local description is set
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await?;

        tokio::time::timeout(gather_timeout, gather_complete.recv())
            .await
            .map_err(|_| AppError::NegotiationTimeout("candidate gathering"))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("local description missing after gathering"))?;

        Ok(Negotiated {
            answer: SessionDescription::answer(local.sdp),
            events,
        })
    }

    async fn attach(&self, capability: Capability) -> Result<()> {
        match capability {
            Capability::Receive(kind) => {
                self.pc
                    .add_transceiver_from_kind(
                        rtp_codec_type(kind),
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
                tracing::debug!("Declared receive-only {} transceiver", kind);
            }
            Capability::Send(track) => {
                let track_id = track.id().to_string();
                let sender = self
                    .pc
                    .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await?;

                // Incoming RTCP must be read for the interceptors to process it
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while sender.read(&mut buf).await.is_ok() {}
                });
                tracing::debug!("Attached local track {}", track_id);
            }
        }
        Ok(())
    }
}
