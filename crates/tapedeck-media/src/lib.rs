//! Tapedeck Media
//!
//! On-disk containers and timing for recorded sessions. Video is stored as IVF,
//! audio as Ogg/Opus. Both sides exchange [`EncodedUnit`]s, so the rest of the
//! system never sees container framing.

pub mod codec;
pub mod error;
pub mod ivf;
pub mod ogg;
pub mod pacer;
pub mod unit;

pub use codec::{Codec, MediaKind};
pub use error::{MediaError, Result};
pub use ivf::{IvfFrame, IvfHeader, IvfReader, IvfWriter};
pub use ogg::{OggPage, OggReader, OggWriter, OpusHeader};
pub use pacer::{Pacer, NOMINAL_OPUS_FRAME};
pub use unit::{ContainerReader, ContainerWriter, EncodedUnit};
