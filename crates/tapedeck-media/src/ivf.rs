//! IVF video container
//!
//! A 32 byte file header followed by frames, each prefixed with a 12 byte
//! header (payload size and timestamp). All integers are little endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use crate::codec::Codec;
use crate::error::{MediaError, Result};
use crate::unit::{read_full, ContainerReader, ContainerWriter, EncodedUnit};

const SIGNATURE: &[u8; 4] = b"DKIF";
const HEADER_SIZE: usize = 32;
const FRAME_HEADER_SIZE: usize = 12;
const FRAME_COUNT_OFFSET: u64 = 24;
const MAX_PREALLOCATED_FRAME: usize = 1 << 20;

/// Metadata stored in the IVF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_denominator: u32,
    pub timebase_numerator: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    /// Header for a new recording: 640x480 with a 1/30 timebase
    pub fn for_codec(codec: Codec) -> Result<Self> {
        let fourcc = codec
            .fourcc()
            .ok_or_else(|| MediaError::UnsupportedCodec(codec.mime_type().to_string()))?;

        Ok(Self {
            fourcc,
            width: 640,
            height: 480,
            timebase_denominator: 30,
            timebase_numerator: 1,
            frame_count: 0,
        })
    }

    pub fn codec(&self) -> Result<Codec> {
        Codec::from_fourcc(&self.fourcc)
    }

    /// Nominal duration of one frame, `numerator / denominator` seconds
    pub fn frame_duration(&self) -> Result<Duration> {
        if self.timebase_numerator == 0 || self.timebase_denominator == 0 {
            return Err(MediaError::InvalidTimebase {
                numerator: self.timebase_numerator,
                denominator: self.timebase_denominator,
            });
        }

        let nanos = u64::from(self.timebase_numerator) * 1_000_000_000
            / u64::from(self.timebase_denominator);
        Ok(Duration::from_nanos(nanos))
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(SIGNATURE);
        buf.put_u16_le(0); // version
        buf.put_u16_le(HEADER_SIZE as u16);
        buf.put_slice(&self.fourcc);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u32_le(self.timebase_denominator);
        buf.put_u32_le(self.timebase_numerator);
        buf.put_u32_le(self.frame_count);
        buf.put_u32_le(0); // unused
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || &buf[..4] != SIGNATURE {
            return Err(MediaError::InvalidHeader("missing DKIF signature".to_string()));
        }
        buf.advance(4);

        let version = buf.get_u16_le();
        if version != 0 {
            return Err(MediaError::InvalidHeader(format!(
                "unknown IVF version {}",
                version
            )));
        }
        let header_size = buf.get_u16_le();
        if usize::from(header_size) != HEADER_SIZE {
            return Err(MediaError::InvalidHeader(format!(
                "unexpected header size {}",
                header_size
            )));
        }

        let mut fourcc = [0u8; 4];
        buf.copy_to_slice(&mut fourcc);

        Ok(Self {
            fourcc,
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
            timebase_denominator: buf.get_u32_le(),
            timebase_numerator: buf.get_u32_le(),
            frame_count: buf.get_u32_le(),
        })
    }
}

/// One frame as stored in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfFrame {
    pub data: Bytes,
    pub timestamp: u64,
}

pub struct IvfReader<R = BufReader<File>> {
    reader: R,
    header: IvfHeader,
    codec: Codec,
    frame_duration: Duration,
}

impl IvfReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> IvfReader<R> {
    /// Parse the file header; fails on unknown FourCCs and zero timebases
    pub fn new(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        if read_full(&mut reader, &mut buf)? < HEADER_SIZE {
            return Err(MediaError::Truncated("IVF file header"));
        }

        let header = IvfHeader::decode(&buf)?;
        let codec = header.codec()?;
        let frame_duration = header.frame_duration()?;

        Ok(Self {
            reader,
            header,
            codec,
            frame_duration,
        })
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Next frame in file order, `None` once the file is exhausted
    pub fn next_frame(&mut self) -> Result<Option<IvfFrame>> {
        let mut frame_header = [0u8; FRAME_HEADER_SIZE];
        match read_full(&mut self.reader, &mut frame_header)? {
            0 => return Ok(None),
            FRAME_HEADER_SIZE => {}
            _ => return Err(MediaError::Truncated("IVF frame header")),
        }

        let mut buf = &frame_header[..];
        let size = buf.get_u32_le() as usize;
        let timestamp = buf.get_u64_le();

        // The size field is untrusted; allocate as bytes arrive
        let mut data = Vec::with_capacity(size.min(MAX_PREALLOCATED_FRAME));
        (&mut self.reader).take(size as u64).read_to_end(&mut data)?;
        if data.len() < size {
            return Err(MediaError::Truncated("IVF frame payload"));
        }

        Ok(Some(IvfFrame {
            data: Bytes::from(data),
            timestamp,
        }))
    }
}

impl<R: Read + Send> ContainerReader for IvfReader<R> {
    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        let frame_duration = self.frame_duration;
        Ok(self
            .next_frame()?
            .map(|frame| EncodedUnit::new(frame.data, frame_duration)))
    }
}

pub struct IvfWriter<W: Write + Seek = BufWriter<File>> {
    writer: Option<W>,
    frame_count: u32,
}

impl IvfWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, header: IvfHeader) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write + Seek> IvfWriter<W> {
    pub fn new(mut writer: W, header: IvfHeader) -> Result<Self> {
        writer.write_all(&header.encode())?;
        Ok(Self {
            writer: Some(writer),
            frame_count: 0,
        })
    }

    /// Append one frame. Timestamps are frame indices; arrival order is frame order.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(MediaError::Closed)?;
        let size =
            u32::try_from(frame.len()).map_err(|_| MediaError::FrameTooLarge(frame.len()))?;

        let mut frame_header = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        frame_header.put_u32_le(size);
        frame_header.put_u64_le(u64::from(self.frame_count));

        writer.write_all(&frame_header)?;
        writer.write_all(frame)?;
        self.frame_count += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }
}

impl<W: Write + Seek + Send> ContainerWriter for IvfWriter<W> {
    fn write_unit(&mut self, unit: &EncodedUnit) -> Result<()> {
        self.write_frame(&unit.data)
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        writer.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))?;
        writer.write_all(&self.frame_count.to_le_bytes())?;
        writer.seek(SeekFrom::End(0))?;
        writer.flush()?;

        tracing::debug!("IVF container closed after {} frames", self.frame_count);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl<W: Write + Seek> Drop for IvfWriter<W> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            tracing::warn!("IVF writer dropped without close; frame count not finalized");
        }
    }
}
