//! Builds sessions from a declared set of capabilities
//!
//! Ingest and playback share the same handshake. They differ in what is
//! declared before answering and in what is wired up afterwards.

use super::binding::{
    is_stream_closed, LocalSampleSink, RemoteTrackSource, TrackBinding, UnitSource,
};
use super::ingest::{run_ingest, SharedWriter};
use super::negotiator::{Capability, Negotiator};
use super::playback::run_playback;
use super::{spawn_driver, Session, SessionMode, SessionRegistry};
use crate::error::{AppError, PipelineError, Result};
use crate::state::Config;
use crate::storage::{self, RecordingStore};
use crate::webrtc::{
    build_api, codec_capability, configured_ice_servers, ice_servers_with_relay, INGEST_CODECS,
    PLAYBACK_CODECS,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tapedeck_media::{
    Codec, ContainerReader, ContainerWriter, IvfHeader, IvfReader, IvfWriter, MediaError,
    MediaKind, OggReader, OggWriter, NOMINAL_OPUS_FRAME,
};
use tapedeck_protocol::{RelayServer, SessionDescription};
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::api::API;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "tapedeck";

pub struct SessionManager {
    ingest_api: API,
    playback_api: API,
    config: Config,
    store: RecordingStore,
    registry: Arc<SessionRegistry>,
}

impl SessionManager {
    pub fn new(config: &Config, store: RecordingStore) -> anyhow::Result<Self> {
        Ok(Self {
            ingest_api: build_api(&INGEST_CODECS)?,
            playback_api: build_api(&PLAYBACK_CODECS)?,
            config: config.clone(),
            store,
            registry: Arc::new(SessionRegistry::default()),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Answer an offer from a publishing peer. Audio and video are written to
    /// a fresh directory named after the returned session id.
    pub async fn start_ingest(
        &self,
        offer: &SessionDescription,
    ) -> Result<(Uuid, SessionDescription)> {
        let id = Uuid::new_v4();
        let dir = self.store.create_session_dir(id).await?;

        match self.negotiate_ingest(id, &dir, offer).await {
            Ok(answer) => Ok((id, answer)),
            Err(e) => {
                // Nothing was recorded; do not leave an empty recording behind
                if let Err(rm_err) = tokio::fs::remove_dir(&dir).await {
                    tracing::warn!("Could not remove {}: {}", dir.display(), rm_err);
                }
                Err(e)
            }
        }
    }

    async fn negotiate_ingest(
        &self,
        id: Uuid,
        dir: &Path,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        let negotiator =
            Negotiator::new(&self.ingest_api, configured_ice_servers(&self.config), offer).await?;
        let pc = negotiator.peer_connection().clone();
        let session = Arc::new(Session::new(id, SessionMode::Ingest, pc.clone()));

        let weak = Arc::downgrade(&session);
        let dir = dir.to_path_buf();
        let keyframe_interval = self.config.keyframe_interval;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let session = weak.clone();
                let dir = dir.clone();
                Box::pin(async move {
                    if let Some(session) = session.upgrade() {
                        route_remote_track(session, track, &dir, keyframe_interval).await;
                    }
                })
            },
        ));

        let negotiated = negotiator
            .run(
                vec![
                    Capability::Receive(MediaKind::Audio),
                    Capability::Receive(MediaKind::Video),
                ],
                self.config.gather_timeout,
            )
            .await?;

        session.add_binding(TrackBinding::receive(MediaKind::Audio)).await;
        session.add_binding(TrackBinding::receive(MediaKind::Video)).await;

        self.registry.insert(session.clone()).await;
        spawn_driver(session, negotiated.events, self.registry.clone());

        tracing::info!("Ingest session {} negotiated", id);
        Ok(negotiated.answer)
    }

    /// Answer an offer from a viewing peer with the stored recording, or the
    /// demo files under the storage root when `recording` is `None`.
    pub async fn start_playback(
        &self,
        offer: &SessionDescription,
        relay: &RelayServer,
        recording: Option<Uuid>,
    ) -> Result<(Uuid, SessionDescription)> {
        let dir = self.store.playback_dir(recording).await.ok_or_else(|| {
            AppError::NotFound(format!(
                "Recording {}",
                recording.map(|r| r.to_string()).unwrap_or_default()
            ))
        })?;

        // Open the containers before any connection exists
        let (video, audio) = open_recording(dir.clone()).await?;
        if video.is_none() && audio.is_none() {
            return Err(AppError::NoMediaAvailable(dir.display().to_string()));
        }

        let id = Uuid::new_v4();
        let negotiator = Negotiator::new(
            &self.playback_api,
            ice_servers_with_relay(&self.config, relay),
            offer,
        )
        .await?;
        let session = Arc::new(Session::new(
            id,
            SessionMode::Playback,
            negotiator.peer_connection().clone(),
        ));

        let mut capabilities = vec![];
        let mut pipelines: Vec<(Arc<LocalSampleSink>, Box<dyn ContainerReader>, Duration)> =
            vec![];

        if let Some(reader) = video {
            let codec = reader.codec();
            let fallback = reader.frame_duration();
            let track = local_track(codec, "video");
            capabilities.push(Capability::Send(track.clone()));
            session.add_binding(TrackBinding::send(codec)).await;
            let reader: Box<dyn ContainerReader> = Box::new(reader);
            pipelines.push((Arc::new(LocalSampleSink::new(track)), reader, fallback));
            tracing::info!("Session {} replays {} video from {}", id, codec, dir.display());
        }

        if let Some(reader) = audio {
            let track = local_track(Codec::Opus, "audio");
            capabilities.push(Capability::Send(track.clone()));
            session.add_binding(TrackBinding::send(Codec::Opus)).await;
            let reader: Box<dyn ContainerReader> = Box::new(reader);
            pipelines.push((Arc::new(LocalSampleSink::new(track)), reader, NOMINAL_OPUS_FRAME));
        }

        let negotiated = negotiator
            .run(capabilities, self.config.gather_timeout)
            .await?;

        self.registry.insert(session.clone()).await;
        spawn_driver(session.clone(), negotiated.events, self.registry.clone());

        for (sink, reader, fallback) in pipelines {
            session.add_sink(sink.clone()).await;
            spawn_playback(
                session.clone(),
                sink,
                reader,
                self.config.connect_timeout,
                fallback,
            );
        }

        tracing::info!("Playback session {} negotiated", id);
        Ok((id, negotiated.answer))
    }
}

fn local_track(codec: Codec, id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_capability(codec),
        id.to_string(),
        STREAM_ID.to_string(),
    ))
}

/// Open whichever of the two containers exist in `dir`
async fn open_recording(dir: PathBuf) -> Result<(Option<IvfReader>, Option<OggReader>)> {
    tokio::task::spawn_blocking(move || -> Result<_> {
        let video = open_if_exists(&storage::video_path(&dir), |p| IvfReader::open(p))?;
        let audio = open_if_exists(&storage::audio_path(&dir), |p| OggReader::open(p))?;
        Ok((video, audio))
    })
    .await
    .map_err(anyhow::Error::from)?
}

/// `Ok(None)` when the file is absent; an unknown video tag maps to `UnsupportedCodec`
fn open_if_exists<T>(
    path: &Path,
    open: impl FnOnce(&Path) -> tapedeck_media::Result<T>,
) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    match open(path) {
        Ok(reader) => Ok(Some(reader)),
        Err(MediaError::UnsupportedCodec(tag)) => Err(AppError::UnsupportedCodec(tag)),
        Err(e) => Err(e.into()),
    }
}

fn spawn_playback(
    session: Arc<Session>,
    sink: Arc<LocalSampleSink>,
    reader: Box<dyn ContainerReader>,
    connect_timeout: Duration,
    fallback: Duration,
) {
    tokio::spawn(async move {
        let result = run_playback(
            reader,
            sink.as_ref(),
            session.connected(),
            connect_timeout,
            fallback,
        )
        .await;

        match result {
            Ok(sent) => tracing::info!("Session {} finished playback of {} units", session.id, sent),
            Err(PipelineError::ConnectTimeout(timeout)) => {
                tracing::warn!(
                    "Session {} peer did not connect within {:?}, tearing down",
                    session.id,
                    timeout
                );
                session.teardown().await;
            }
            Err(PipelineError::SessionClosed) => {
                tracing::debug!("Session {} closed before playback started", session.id);
            }
            Err(e) => tracing::error!("Session {} playback stopped: {}", session.id, e),
        }
    });
}

/// Route an arriving track to the pipeline matching its negotiated codec
async fn route_remote_track(
    session: Arc<Session>,
    track: Arc<TrackRemote>,
    dir: &Path,
    keyframe_interval: Duration,
) {
    let mime_type = track.codec().capability.mime_type;
    let Some(codec) = Codec::from_mime_type(&mime_type) else {
        tracing::warn!("Session {} ignoring track with codec {}", session.id, mime_type);
        return;
    };

    let kind = codec.kind();
    if !session.claim(kind) {
        tracing::warn!("Session {} already records {}, ignoring extra track", session.id, kind);
        return;
    }

    tracing::info!(
        "Session {} recording {} track ssrc={}",
        session.id,
        codec,
        track.ssrc()
    );

    let path = dir.to_path_buf();
    let opened = tokio::task::spawn_blocking(move || open_writer(codec, &path)).await;
    let writer: SharedWriter = match opened {
        Ok(Ok(writer)) => Arc::new(Mutex::new(writer)),
        Ok(Err(e)) => {
            tracing::error!("Session {} cannot record {}: {}", session.id, codec, e);
            return;
        }
        Err(e) => {
            tracing::error!("Session {} writer task failed: {}", session.id, e);
            return;
        }
    };
    session.add_writer(writer.clone()).await;

    let weak = Arc::downgrade(&session);
    match codec {
        Codec::Opus => {
            let source = RemoteTrackSource::new(track, OpusPacket, codec);
            spawn_ingest(weak, kind, source, writer);
        }
        Codec::Vp8 => {
            spawn_keyframe_requests(weak.clone(), track.ssrc(), keyframe_interval);
            let source = RemoteTrackSource::new(track, Vp8Packet::default(), codec);
            spawn_ingest(weak, kind, source, writer);
        }
        Codec::Vp9 => {
            spawn_keyframe_requests(weak.clone(), track.ssrc(), keyframe_interval);
            let source = RemoteTrackSource::new(track, Vp9Packet::default(), codec);
            spawn_ingest(weak, kind, source, writer);
        }
        // Never registered for ingest
        Codec::Av1 => {
            tracing::warn!("Session {} cannot depacketize {}", session.id, codec);
        }
    }
}

fn open_writer(codec: Codec, dir: &Path) -> tapedeck_media::Result<Box<dyn ContainerWriter>> {
    match codec {
        Codec::Opus => Ok(Box::new(OggWriter::create(
            storage::audio_path(dir),
            codec.clock_rate(),
            codec.channels() as u8,
        )?)),
        _ => Ok(Box::new(IvfWriter::create(
            storage::video_path(dir),
            IvfHeader::for_codec(codec)?,
        )?)),
    }
}

fn spawn_ingest<S: UnitSource + 'static>(
    session: Weak<Session>,
    kind: MediaKind,
    source: S,
    writer: SharedWriter,
) {
    tokio::spawn(ingest_track(session, kind, source, writer));
}

/// Run one track's ingest pipeline. A broken transport ends the whole
/// session; a container error only stops this track.
async fn ingest_track<S: UnitSource>(
    session: Weak<Session>,
    kind: MediaKind,
    source: S,
    writer: SharedWriter,
) {
    let result = run_ingest(source, writer).await;
    let Some(session) = session.upgrade() else {
        return;
    };

    match result {
        Ok(written) => tracing::info!(
            "Session {} {} track ended after {} units",
            session.id,
            kind,
            written
        ),
        Err(PipelineError::Transport(e)) => {
            tracing::error!(
                "Session {} {} track read failed, tearing down: {}",
                session.id,
                kind,
                e
            );
            session.teardown().await;
        }
        Err(e) => tracing::error!("Session {} {} ingest stopped: {}", session.id, kind, e),
    }
}

/// Periodically ask the publisher for a keyframe so recordings stay decodable
fn spawn_keyframe_requests(session: Weak<Session>, media_ssrc: u32, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let Some(session) = session.upgrade() else {
                break;
            };
            if session.is_torn_down() {
                break;
            }

            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = session.peer_connection().write_rtcp(&[Box::new(pli)]).await {
                if is_stream_closed(&e) {
                    break;
                }
                tracing::debug!("Session {} keyframe request failed: {}", session.id, e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Config;
    use async_trait::async_trait;
    use tapedeck_media::EncodedUnit;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    fn config(root: &Path) -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            storage_root: root.to_path_buf(),
            allowed_origins: vec![],
            stun_servers: vec![],
            turn_servers: vec![],
            gather_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            keyframe_interval: Duration::from_secs(3),
        }
    }

    fn manager(root: &Path) -> SessionManager {
        SessionManager::new(&config(root), RecordingStore::new(root)).unwrap()
    }

    fn relay() -> RelayServer {
        RelayServer {
            url: "turn:127.0.0.1:3478".to_string(),
            username: "user".to_string(),
            credential: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn playback_without_files_is_no_media() {
        let root = tempfile::tempdir().unwrap();
        let result = manager(root.path())
            .start_playback(&SessionDescription::offer("v=0"), &relay(), None)
            .await;
        assert!(matches!(result, Err(AppError::NoMediaAvailable(_))));
    }

    #[tokio::test]
    async fn unknown_recording_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let result = manager(root.path())
            .start_playback(
                &SessionDescription::offer("v=0"),
                &relay(),
                Some(Uuid::new_v4()),
            )
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn unsupported_fourcc_fails_before_any_track() {
        let root = tempfile::tempdir().unwrap();

        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(b"DKIF");
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&32u16.to_le_bytes());
        header.extend_from_slice(b"H264");
        header.extend_from_slice(&640u16.to_le_bytes());
        header.extend_from_slice(&480u16.to_le_bytes());
        header.extend_from_slice(&30u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(storage::video_path(root.path()), header).unwrap();

        let manager = manager(root.path());
        let result = manager
            .start_playback(&SessionDescription::offer("v=0"), &relay(), None)
            .await;

        match result {
            Err(AppError::UnsupportedCodec(tag)) => assert_eq!(tag, "H264"),
            other => panic!("expected UnsupportedCodec, got {:?}", other.map(|(id, _)| id)),
        }
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn malformed_ingest_offer_leaves_no_recording() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let result = manager
            .start_ingest(&SessionDescription::offer("definitely not sdp"))
            .await;

        assert!(matches!(result, Err(AppError::MalformedOffer(_))));
        assert!(manager.store.list_recordings().await.unwrap().is_empty());
        assert!(manager.registry().is_empty().await);
    }

    #[test]
    fn writers_follow_codec() {
        let dir = tempfile::tempdir().unwrap();

        let mut audio = open_writer(Codec::Opus, dir.path()).unwrap();
        audio.close().unwrap();
        assert!(storage::audio_path(dir.path()).is_file());

        let mut video = open_writer(Codec::Vp9, dir.path()).unwrap();
        video.close().unwrap();
        let reader = IvfReader::open(storage::video_path(dir.path())).unwrap();
        assert_eq!(reader.codec(), Codec::Vp9);
    }

    /// Yields `frames` units, then either ends or fails with a transport error
    struct TrackStub {
        frames: usize,
        fail: bool,
    }

    #[async_trait]
    impl UnitSource for TrackStub {
        async fn read_unit(&mut self) -> std::result::Result<Option<EncodedUnit>, webrtc::Error> {
            if self.frames > 0 {
                self.frames -= 1;
                return Ok(Some(EncodedUnit::new(vec![0u8; 16], Duration::from_millis(33))));
            }
            if self.fail {
                return Err(webrtc::Error::new("srtp decrypt failed".to_string()));
            }
            Ok(None)
        }
    }

    async fn ingest_session() -> Arc<Session> {
        let api = build_api(&INGEST_CODECS).unwrap();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        Arc::new(Session::new(Uuid::new_v4(), SessionMode::Ingest, Arc::new(pc)))
    }

    fn video_writer(dir: &Path) -> SharedWriter {
        Arc::new(Mutex::new(open_writer(Codec::Vp8, dir).unwrap()))
    }

    #[tokio::test]
    async fn broken_transport_tears_session_down() {
        let dir = tempfile::tempdir().unwrap();
        let session = ingest_session().await;
        let writer = video_writer(dir.path());
        session.add_writer(writer.clone()).await;

        let source = TrackStub { frames: 3, fail: true };
        ingest_track(Arc::downgrade(&session), MediaKind::Video, source, writer.clone()).await;

        assert!(session.is_torn_down());
        assert!(writer.lock().await.is_closed());
        let reader = IvfReader::open(storage::video_path(dir.path())).unwrap();
        assert_eq!(reader.header().frame_count, 3);
    }

    #[tokio::test]
    async fn clean_track_end_keeps_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let session = ingest_session().await;

        let source = TrackStub { frames: 2, fail: false };
        ingest_track(
            Arc::downgrade(&session),
            MediaKind::Video,
            source,
            video_writer(dir.path()),
        )
        .await;

        assert!(!session.is_torn_down());
    }
}
