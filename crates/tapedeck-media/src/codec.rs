use std::fmt;
use std::time::Duration;

use crate::error::{MediaError, Result};
use crate::pacer::NOMINAL_OPUS_FRAME;

/// Logical media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Codecs known to the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Vp8,
    Vp9,
    Av1,
    Opus,
}

impl Codec {
    pub const VIDEO: [Codec; 3] = [Codec::Av1, Codec::Vp9, Codec::Vp8];

    /// Map an IVF FourCC to a video codec
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Result<Self> {
        match fourcc {
            b"VP80" => Ok(Codec::Vp8),
            b"VP90" => Ok(Codec::Vp9),
            b"AV01" => Ok(Codec::Av1),
            other => Err(MediaError::UnsupportedCodec(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Match a negotiated MIME type, case-insensitively
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        [Codec::Vp8, Codec::Vp9, Codec::Av1, Codec::Opus]
            .into_iter()
            .find(|codec| codec.mime_type().eq_ignore_ascii_case(mime_type))
    }

    pub fn fourcc(&self) -> Option<[u8; 4]> {
        match self {
            Codec::Vp8 => Some(*b"VP80"),
            Codec::Vp9 => Some(*b"VP90"),
            Codec::Av1 => Some(*b"AV01"),
            Codec::Opus => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Vp8 => "video/VP8",
            Codec::Vp9 => "video/VP9",
            Codec::Av1 => "video/AV1",
            Codec::Opus => "audio/opus",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48_000,
            _ => 90_000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            Codec::Opus => 2,
            _ => 0,
        }
    }

    /// Length of one frame when the stream itself gives no timing: a 20 ms
    /// Opus packet, or one tick of the 1/30 IVF timebase
    pub fn nominal_frame_duration(&self) -> Duration {
        match self {
            Codec::Opus => NOMINAL_OPUS_FRAME,
            _ => Duration::from_nanos(1_000_000_000 / 30),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}
