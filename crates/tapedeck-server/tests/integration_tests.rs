//! Integration tests for the Tapedeck server
//!
//! Each test starts the HTTP server on an ephemeral port with its own
//! temporary storage root. Negotiation tests drive the server with an
//! in-process peer connection; no STUN server is contacted.
//!
//! Run with: cargo test -p tapedeck-server --test integration_tests

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tapedeck_media::{
    Codec, ContainerReader, ContainerWriter, EncodedUnit, IvfHeader, IvfWriter, OggReader,
    OggWriter,
};
use tapedeck_protocol::{RecordingList, SessionDescription};
use tempfile::TempDir;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const ORIGIN: &str = "http://localhost:5173";

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    storage: TempDir,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let storage = tempfile::tempdir()?;

        let config = tapedeck_server::state::Config {
            bind_address: "127.0.0.1:0".to_string(),
            storage_root: storage.path().to_path_buf(),
            allowed_origins: vec![ORIGIN.to_string()],
            stun_servers: vec![],
            turn_servers: vec![],
            gather_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            keyframe_interval: Duration::from_secs(3),
        };

        let router = tapedeck_server::create_app(config)?;

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            storage,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn root(&self) -> &Path {
        self.storage.path()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Peer connection standing in for a browser
async fn create_client_peer() -> anyhow::Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    Ok(Arc::new(
        api.new_peer_connection(RTCConfiguration::default()).await?,
    ))
}

/// Create an offer with all candidates gathered, encoded for the HTTP API
async fn encoded_offer(pc: &RTCPeerConnection) -> anyhow::Result<String> {
    let offer = pc.create_offer(None).await?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    tokio::time::timeout(Duration::from_secs(5), gather_complete.recv()).await?;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow::anyhow!("No local description"))?;
    Ok(SessionDescription::offer(local.sdp).encode()?)
}

async fn apply_answer(pc: &RTCPeerConnection, encoded: &str) -> anyhow::Result<String> {
    let answer = SessionDescription::decode(encoded)?;
    pc.set_remote_description(RTCSessionDescription::answer(answer.sdp.clone())?)
        .await?;
    Ok(answer.sdp)
}

/// Receives `()` each time the peer reaches Connected
fn watch_connected(pc: &RTCPeerConnection) -> tokio::sync::mpsc::UnboundedReceiver<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if state == RTCPeerConnectionState::Connected {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));
    rx
}

fn read_pages(path: &Path) -> tapedeck_media::Result<Vec<EncodedUnit>> {
    let mut reader = OggReader::open(path)?;
    let mut units = vec![];
    while let Some(unit) = reader.next_unit()? {
        units.push(unit);
    }
    Ok(units)
}

/// Poll a recording until it holds `expected` pages or `timeout` passes
async fn wait_for_pages(path: &Path, expected: usize, timeout: Duration) -> Vec<EncodedUnit> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let units = read_pages(path).unwrap_or_default();
        if units.len() >= expected || tokio::time::Instant::now() >= deadline {
            return units;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Demo containers directly under the storage root
fn write_demo_files(root: &Path) -> anyhow::Result<()> {
    let mut video = IvfWriter::create(
        root.join("output.ivf"),
        IvfHeader::for_codec(Codec::Vp8)?,
    )?;
    for i in 0..30u8 {
        video.write_frame(&[i; 64])?;
    }
    video.close()?;

    let mut audio = OggWriter::create(root.join("output.opus"), 48000, 2)?;
    for i in 0..50u8 {
        audio.write_unit(&EncodedUnit::new(vec![i; 40], Duration::from_millis(20)))?;
    }
    audio.close()?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_hello() {
    let server = start_test_server().await;

    let response = Client::new().get(server.http_url()).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "Hello, World!");
}

#[tokio::test]
async fn test_get_files_empty() {
    let server = start_test_server().await;

    let response = Client::new()
        .get(format!("{}/getFiles", server.http_url()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "No UUID folders found.");
}

#[tokio::test]
async fn test_get_files_lists_only_uuid_folders() {
    let server = start_test_server().await;
    std::fs::create_dir(server.root().join("123e4567-e89b-12d3-a456-426614174000")).unwrap();
    std::fs::create_dir(server.root().join("notauuid")).unwrap();

    let response = Client::new()
        .get(format!("{}/getFiles", server.http_url()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let list: RecordingList = response.json().await.unwrap();
    assert_eq!(list.uuids, vec!["123e4567-e89b-12d3-a456-426614174000"]);
}

#[tokio::test]
async fn test_ingest_missing_param() {
    let server = start_test_server().await;

    let response = Client::new()
        .post(server.http_url())
        .json(&json!({ "param": 7 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.text().await.unwrap(),
        "Parameter 'param' not found or not a string"
    );
}

#[tokio::test]
async fn test_ingest_malformed_offer() {
    let server = start_test_server().await;

    let response = Client::new()
        .post(server.http_url())
        .json(&json!({ "param": "this is not base64!" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().starts_with("Malformed offer"));
    assert!(std::fs::read_dir(server.root()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_playback_validation() {
    let server = start_test_server().await;
    let client = Client::new();
    let url = format!("{}/video", server.http_url());
    let offer = SessionDescription::offer("v=0").encode().unwrap();

    let response = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.text().await.unwrap(),
        "Parameter 'base' not found or not a string"
    );

    // Relay credentials are mandatory
    let response = client
        .post(&url)
        .json(&json!({ "base": offer, "url": "turn:127.0.0.1:3478" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(&url)
        .json(&json!({
            "base": offer,
            "url": "turn:127.0.0.1:3478",
            "username": "user",
            "credential": "secret",
            "recording": "../outside"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing recorded yet
    let response = client
        .post(&url)
        .json(&json!({
            "base": offer,
            "url": "turn:127.0.0.1:3478",
            "username": "user",
            "credential": "secret"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cors_preflight() {
    let server = start_test_server().await;

    let response = Client::new()
        .request(reqwest::Method::OPTIONS, format!("{}/video", server.http_url()))
        .header("Origin", ORIGIN)
        .header("Access-Control-Request-Method", "POST")
        .header("Access-Control-Request-Headers", "content-type")
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.headers()["access-control-allow-origin"], ORIGIN);
}

#[tokio::test]
async fn test_ingest_negotiation() {
    let server = start_test_server().await;
    let pc = create_client_peer().await.unwrap();

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "client".to_string(),
    ));
    pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();

    let offer = encoded_offer(&pc).await.unwrap();
    let response = Client::new()
        .post(server.http_url())
        .json(&json!({ "param": offer }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let recording_id = response.headers()[tapedeck_server::api::RECORDING_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let recording_id = uuid::Uuid::parse_str(&recording_id).unwrap();
    assert!(server.root().join(recording_id.to_string()).is_dir());

    let answer = apply_answer(&pc, &response.text().await.unwrap())
        .await
        .unwrap();
    assert!(answer.to_lowercase().contains("opus/48000/2"));
    // Only codecs the recorder can store are answered
    assert!(!answer.contains("AV1"));
    assert!(!answer.contains("H264"));

    pc.close().await.unwrap();
}

#[tokio::test]
async fn test_playback_negotiation_offers_stored_tracks() {
    let server = start_test_server().await;
    write_demo_files(server.root()).unwrap();

    let pc = create_client_peer().await.unwrap();
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
    }

    let offer = encoded_offer(&pc).await.unwrap();
    let response = Client::new()
        .post(format!("{}/video", server.http_url()))
        .json(&json!({
            "base": offer,
            "url": "turn:127.0.0.1:3478",
            "username": "user",
            "credential": "secret"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let answer = apply_answer(&pc, &response.text().await.unwrap())
        .await
        .unwrap();
    assert!(answer.contains("VP8/90000"));
    assert!(answer.to_lowercase().contains("opus/48000/2"));
    assert!(answer.contains("a=sendonly"));

    pc.close().await.unwrap();
}

#[tokio::test]
async fn test_playback_rejects_unknown_fourcc() {
    let server = start_test_server().await;

    let mut header = b"DKIF".to_vec();
    header.extend_from_slice(&0u16.to_le_bytes());
    header.extend_from_slice(&32u16.to_le_bytes());
    header.extend_from_slice(b"H264");
    header.extend_from_slice(&[0u8; 20]);
    std::fs::write(server.root().join("output.ivf"), header).unwrap();

    let offer = SessionDescription::offer("v=0").encode().unwrap();
    let response = Client::new()
        .post(format!("{}/video", server.http_url()))
        .json(&json!({
            "base": offer,
            "url": "turn:127.0.0.1:3478",
            "username": "user",
            "credential": "secret"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "Unable to handle codec H264");
}

#[tokio::test]
async fn test_ingest_records_every_opus_packet() {
    let server = start_test_server().await;
    let pc = create_client_peer().await.unwrap();
    let mut connected = watch_connected(&pc);

    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "client".to_string(),
    ));
    let sender = pc
        .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut rtcp = vec![0u8; 1500];
        while sender.read(&mut rtcp).await.is_ok() {}
    });

    let offer = encoded_offer(&pc).await.unwrap();
    let response = Client::new()
        .post(server.http_url())
        .json(&json!({ "param": offer }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let recording_id = response.headers()[tapedeck_server::api::RECORDING_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    apply_answer(&pc, &response.text().await.unwrap())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), connected.recv())
        .await
        .expect("client never connected");

    for i in 0..50u8 {
        track
            .write_sample(&Sample {
                data: Bytes::from(vec![i; 40]),
                duration: Duration::from_millis(20),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pc.close().await.unwrap();

    let path = server.root().join(&recording_id).join("output.opus");
    let units = wait_for_pages(&path, 50, Duration::from_secs(30)).await;

    assert_eq!(units.len(), 50);
    for (i, unit) in units.iter().enumerate() {
        assert_eq!(unit.data.as_ref(), vec![i as u8; 40].as_slice());
        assert_eq!(unit.duration, Duration::from_millis(20));
    }
}

#[tokio::test]
async fn test_playback_delivers_frames_in_file_order() {
    let server = start_test_server().await;
    write_demo_files(server.root()).unwrap();

    let pc = create_client_peer().await.unwrap();
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        pc.add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
    }

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let frame_tx = frame_tx.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Video {
                    return;
                }
                tokio::spawn(async move {
                    let mut builder = SampleBuilder::new(64, Vp8Packet::default(), 90000);
                    while let Ok((packet, _)) = track.read_rtp().await {
                        builder.push(packet);
                        while let Some(sample) = builder.pop() {
                            if frame_tx.send(sample.data.to_vec()).is_err() {
                                return;
                            }
                        }
                    }
                });
            })
        },
    ));

    let offer = encoded_offer(&pc).await.unwrap();
    let response = Client::new()
        .post(format!("{}/video", server.http_url()))
        .json(&json!({
            "base": offer,
            "url": "turn:127.0.0.1:3478",
            "username": "user",
            "credential": "secret"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    apply_answer(&pc, &response.text().await.unwrap())
        .await
        .unwrap();

    // The receiving builder holds the newest frame until a successor arrives,
    // so the final stored frame is never surfaced here
    let mut frames = vec![];
    let collected = tokio::time::timeout(Duration::from_secs(15), async {
        while frames.len() < 29 {
            match frame_rx.recv().await {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "received only {} frames", frames.len());

    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.as_slice(), &[i as u8; 64], "frame {} out of order", i);
    }

    pc.close().await.unwrap();
}
