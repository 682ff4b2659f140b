//! WebRTC API construction
//!
//! Ingest and playback each get their own API instance so that the codec
//! table offered in an answer only lists what that direction can handle.

use crate::state::Config;
use anyhow::Result;
use tapedeck_media::{Codec, MediaKind};
use tapedeck_protocol::RelayServer;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

/// Codecs accepted from a publishing peer
pub const INGEST_CODECS: [Codec; 3] = [Codec::Vp8, Codec::Vp9, Codec::Opus];

/// Codecs that can be replayed from disk
pub const PLAYBACK_CODECS: [Codec; 4] = [Codec::Vp8, Codec::Vp9, Codec::Av1, Codec::Opus];

pub fn payload_type(codec: Codec) -> u8 {
    match codec {
        Codec::Vp8 => 96,
        Codec::Vp9 => 98,
        Codec::Av1 => 45,
        Codec::Opus => 111,
    }
}

pub fn rtp_codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// Capability used both for registration and for local tracks
pub fn codec_capability(codec: Codec) -> RTCRtpCodecCapability {
    let (sdp_fmtp_line, rtcp_feedback) = match codec {
        Codec::Opus => ("minptime=10;useinbandfec=1", vec![]),
        Codec::Vp9 => ("profile-id=0", video_feedback()),
        Codec::Vp8 | Codec::Av1 => ("", video_feedback()),
    };

    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: codec.clock_rate(),
        channels: codec.channels(),
        sdp_fmtp_line: sdp_fmtp_line.to_string(),
        rtcp_feedback,
    }
}

/// Build an API whose media engine knows exactly `codecs`
pub fn build_api(codecs: &[Codec]) -> Result<API> {
    let mut media_engine = MediaEngine::default();

    for &codec in codecs {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(codec),
                payload_type: payload_type(codec),
                ..Default::default()
            },
            rtp_codec_type(codec.kind()),
        )?;
    }

    // NACK, RTCP reports and TWCC
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(SettingEngine::default())
        .build())
}

/// STUN and TURN servers from configuration
pub fn configured_ice_servers(config: &Config) -> Vec<RTCIceServer> {
    let mut ice_servers = vec![];

    for stun_url in &config.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    ice_servers
}

/// Configured servers plus a relay supplied with the request
pub fn ice_servers_with_relay(config: &Config, relay: &RelayServer) -> Vec<RTCIceServer> {
    let mut ice_servers = configured_ice_servers(config);
    ice_servers.push(RTCIceServer {
        urls: vec![relay.url.clone()],
        username: relay.username.clone(),
        credential: relay.credential.clone(),
        ..Default::default()
    });
    ice_servers
}
