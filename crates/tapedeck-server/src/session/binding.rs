//! Track bindings and the unit-level seams between transport and pipelines

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapedeck_media::{Codec, EncodedUnit, MediaKind};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Packets a depacketizer may hold back waiting for reordering
const MAX_LATE_PACKETS: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Media flows from this node to the peer
    Send,
    /// Media flows from the peer to this node
    Receive,
}

/// A logical audio or video stream tied to a negotiated media channel.
/// Receive bindings learn their codec only once the remote track arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackBinding {
    pub kind: MediaKind,
    pub codec: Option<Codec>,
    pub direction: Direction,
}

impl TrackBinding {
    pub fn send(codec: Codec) -> Self {
        Self {
            kind: codec.kind(),
            codec: Some(codec),
            direction: Direction::Send,
        }
    }

    pub fn receive(kind: MediaKind) -> Self {
        Self {
            kind,
            codec: None,
            direction: Direction::Receive,
        }
    }
}

/// True for the errors a track read or write returns once the connection is gone
pub fn is_stream_closed(err: &webrtc::Error) -> bool {
    matches!(
        err,
        webrtc::Error::ErrClosedPipe
            | webrtc::Error::ErrConnectionClosed
            | webrtc::Error::ErrDataChannelNotOpen
            | webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                webrtc::srtp::Error::Util(webrtc::util::Error::ErrBufferClosed)
            ))
    )
}

/// Destination of a playback pipeline
#[async_trait]
pub trait UnitSink: Send + Sync {
    async fn write_unit(&self, unit: &EncodedUnit) -> Result<(), webrtc::Error>;
}

/// Origin of an ingest pipeline. `Ok(None)` means the stream ended.
#[async_trait]
pub trait UnitSource: Send {
    async fn read_unit(&mut self) -> Result<Option<EncodedUnit>, webrtc::Error>;
}

/// Writes whole frames to a sample track, which packetizes them into RTP
pub struct LocalSampleSink {
    track: Arc<TrackLocalStaticSample>,
    closed: AtomicBool,
}

impl LocalSampleSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            track,
            closed: AtomicBool::new(false),
        }
    }

    /// Later writes fail with a closed-pipe error
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitSink for LocalSampleSink {
    async fn write_unit(&self, unit: &EncodedUnit) -> Result<(), webrtc::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(webrtc::Error::ErrClosedPipe);
        }

        let sample = Sample {
            data: unit.data.clone(),
            duration: unit.duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await
    }
}

/// Reassembles depacketized RTP payloads into whole frames.
///
/// `SampleBuilder` holds a frame back until a packet of the following frame
/// arrives. [`FrameAssembler::finish`] releases that last frame once the
/// stream has ended.
pub struct FrameAssembler<D: Depacketizer> {
    builder: SampleBuilder<D>,
    clock_rate: u32,
    fallback: Duration,
    last_header: Option<Header>,
    last_duration: Option<Duration>,
}

impl<D: Depacketizer> FrameAssembler<D> {
    pub fn new(depacketizer: D, clock_rate: u32, fallback: Duration) -> Self {
        Self {
            builder: SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, clock_rate),
            clock_rate,
            fallback,
            last_header: None,
            last_duration: None,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        self.last_header = Some(packet.header.clone());
        self.builder.push(packet);
    }

    pub fn pop(&mut self) -> Option<EncodedUnit> {
        let sample = self.builder.pop()?;
        if !sample.duration.is_zero() {
            self.last_duration = Some(sample.duration);
        }
        Some(EncodedUnit::new(sample.data, sample.duration))
    }

    /// Push an empty packet one frame after the last one seen. The frame held
    /// back is then available from `pop`, lasting as long as the frame before
    /// it. No further packets may be pushed afterwards.
    pub fn finish(&mut self) {
        let Some(last) = self.last_header.take() else {
            return;
        };

        let duration = self.last_duration.unwrap_or(self.fallback);
        let ticks = (duration.as_secs_f64() * f64::from(self.clock_rate)).round() as u32;
        self.builder.push(Packet {
            header: Header {
                version: 2,
                payload_type: last.payload_type,
                sequence_number: last.sequence_number.wrapping_add(1),
                timestamp: last.timestamp.wrapping_add(ticks),
                ssrc: last.ssrc,
                ..Default::default()
            },
            payload: Bytes::new(),
        });
    }
}

/// Reads a remote track and yields whole frames
pub struct RemoteTrackSource<D: Depacketizer> {
    track: Arc<TrackRemote>,
    frames: FrameAssembler<D>,
    packets: u64,
    ended: bool,
}

impl<D: Depacketizer> RemoteTrackSource<D> {
    pub fn new(track: Arc<TrackRemote>, depacketizer: D, codec: Codec) -> Self {
        Self {
            track,
            frames: FrameAssembler::new(
                depacketizer,
                codec.clock_rate(),
                codec.nominal_frame_duration(),
            ),
            packets: 0,
            ended: false,
        }
    }
}

#[async_trait]
impl<D: Depacketizer + Send> UnitSource for RemoteTrackSource<D> {
    async fn read_unit(&mut self) -> Result<Option<EncodedUnit>, webrtc::Error> {
        loop {
            if let Some(unit) = self.frames.pop() {
                return Ok(Some(unit));
            }
            if self.ended {
                return Ok(None);
            }

            match self.track.read_rtp().await {
                Ok((packet, _attributes)) => {
                    self.packets += 1;
                    if self.packets == 1 {
                        tracing::debug!(
                            "Track {} ssrc={} received first RTP packet",
                            self.track.id(),
                            self.track.ssrc()
                        );
                    }
                    self.frames.push(packet);
                }
                Err(e) if is_stream_closed(&e) => {
                    tracing::debug!(
                        "Track {} closed after {} packets",
                        self.track.id(),
                        self.packets
                    );
                    self.ended = true;
                    self.frames.finish();
                }
                Err(e) => return Err(e),
            }
        }
    }
}
