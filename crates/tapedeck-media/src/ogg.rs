//! Ogg/Opus audio container
//!
//! Every Opus packet is stored in its own page. The first page carries the
//! `OpusHead` identification header, the second the `OpusTags` comment header.
//! The granule position of a data page is the running sample count at the end
//! of that page, so page durations fall out of consecutive granule deltas.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{MediaError, Result};
use crate::unit::{read_full, ContainerReader, ContainerWriter, EncodedUnit};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const PAGE_HEADER_SIZE: usize = 27;
const CHECKSUM_OFFSET: usize = 22;
const MAX_SEGMENTS: usize = 255;

const HEADER_TYPE_BOS: u8 = 0x02;
const HEADER_TYPE_EOS: u8 = 0x04;

const OPUS_HEAD: &[u8; 8] = b"OpusHead";
const OPUS_TAGS: &[u8; 8] = b"OpusTags";
const VENDOR: &str = "tapedeck";

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, byte| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize]
    })
}

fn samples_in(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * u128::from(sample_rate) / 1_000_000_000) as u64
}

/// Opus identification header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusHeader {
    pub channels: u8,
    pub pre_skip: u16,
    pub sample_rate: u32,
    pub output_gain: i16,
    pub channel_mapping: u8,
}

impl OpusHeader {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            channels,
            pre_skip: 0,
            sample_rate,
            output_gain: 0,
            channel_mapping: 0,
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(19);
        buf.put_slice(OPUS_HEAD);
        buf.put_u8(1); // version
        buf.put_u8(self.channels);
        buf.put_u16_le(self.pre_skip);
        buf.put_u32_le(self.sample_rate);
        buf.put_i16_le(self.output_gain);
        buf.put_u8(self.channel_mapping);
        buf.freeze()
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < 19 || &buf[..8] != OPUS_HEAD {
            return Err(MediaError::InvalidHeader(
                "first page is not an OpusHead".to_string(),
            ));
        }
        buf.advance(9);

        let header = Self {
            channels: buf.get_u8(),
            pre_skip: buf.get_u16_le(),
            sample_rate: buf.get_u32_le(),
            output_gain: buf.get_i16_le(),
            channel_mapping: buf.get_u8(),
        };
        if header.sample_rate == 0 {
            return Err(MediaError::InvalidHeader("zero sample rate".to_string()));
        }
        Ok(header)
    }
}

fn comment_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + VENDOR.len());
    buf.put_slice(OPUS_TAGS);
    buf.put_u32_le(VENDOR.len() as u32);
    buf.put_slice(VENDOR.as_bytes());
    buf.put_u32_le(0); // no user comments
    buf.freeze()
}

/// One Ogg page holding a single packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggPage {
    pub header_type: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub data: Bytes,
}

impl OggPage {
    fn encode(&self) -> Result<BytesMut> {
        let len = self.data.len();
        let segments = len / 255 + 1;
        if segments > MAX_SEGMENTS {
            return Err(MediaError::PacketTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(PAGE_HEADER_SIZE + segments + len);
        buf.put_slice(CAPTURE_PATTERN);
        buf.put_u8(0); // version
        buf.put_u8(self.header_type);
        buf.put_u64_le(self.granule_position);
        buf.put_u32_le(self.serial);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(0); // checksum, filled below
        buf.put_u8(segments as u8);
        for _ in 0..segments - 1 {
            buf.put_u8(255);
        }
        buf.put_u8((len % 255) as u8);
        buf.put_slice(&self.data);

        let crc = checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

pub struct OggReader<R = BufReader<File>> {
    reader: R,
    header: OpusHeader,
    peeked: Option<OggPage>,
    last_granule: u64,
}

impl OggReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> OggReader<R> {
    /// Parse the Opus headers; data pages are returned by [`OggReader::next_page`]
    pub fn new(mut reader: R) -> Result<Self> {
        let first = Self::read_page(&mut reader)?
            .ok_or(MediaError::Truncated("Ogg identification page"))?;
        let header = OpusHeader::decode(&first.data)?;

        let peeked = match Self::read_page(&mut reader)? {
            Some(page) if page.data.starts_with(OPUS_TAGS) => None,
            other => other,
        };

        Ok(Self {
            reader,
            header,
            peeked,
            last_granule: 0,
        })
    }

    pub fn header(&self) -> &OpusHeader {
        &self.header
    }

    pub fn next_page(&mut self) -> Result<Option<OggPage>> {
        if let Some(page) = self.peeked.take() {
            return Ok(Some(page));
        }
        Self::read_page(&mut self.reader)
    }

    fn read_page(reader: &mut R) -> Result<Option<OggPage>> {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        match read_full(reader, &mut header)? {
            0 => return Ok(None),
            PAGE_HEADER_SIZE => {}
            _ => return Err(MediaError::Truncated("Ogg page header")),
        }
        if &header[..4] != CAPTURE_PATTERN {
            return Err(MediaError::InvalidHeader("missing OggS capture pattern".to_string()));
        }

        let segment_count = usize::from(header[26]);
        let mut segments = vec![0u8; segment_count];
        if read_full(reader, &mut segments)? < segment_count {
            return Err(MediaError::Truncated("Ogg segment table"));
        }

        let size: usize = segments.iter().map(|s| usize::from(*s)).sum();
        let mut data = vec![0u8; size];
        if read_full(reader, &mut data)? < size {
            return Err(MediaError::Truncated("Ogg page payload"));
        }

        let mut fields = &header[5..];
        let header_type = fields.get_u8();
        let granule_position = fields.get_u64_le();
        let serial = fields.get_u32_le();
        let sequence = fields.get_u32_le();
        let expected = fields.get_u32_le();

        header[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let mut page_bytes = Vec::with_capacity(PAGE_HEADER_SIZE + segment_count + size);
        page_bytes.extend_from_slice(&header);
        page_bytes.extend_from_slice(&segments);
        page_bytes.extend_from_slice(&data);
        let actual = checksum(&page_bytes);
        if actual != expected {
            return Err(MediaError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(OggPage {
            header_type,
            granule_position,
            serial,
            sequence,
            data: Bytes::from(data),
        }))
    }
}

impl<R: Read + Send> ContainerReader for OggReader<R> {
    /// Page duration is the granule delta since the previous page, seeded at zero
    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        let Some(page) = self.next_page()? else {
            return Ok(None);
        };

        let granule = page.granule_position;
        if granule < self.last_granule {
            return Err(MediaError::GranuleRegression {
                previous: self.last_granule,
                current: granule,
            });
        }

        let samples = granule - self.last_granule;
        self.last_granule = granule;
        let nanos = u128::from(samples) * 1_000_000_000 / u128::from(self.header.sample_rate);

        Ok(Some(EncodedUnit::new(
            page.data,
            Duration::from_nanos(nanos as u64),
        )))
    }
}

struct PendingPage {
    header_type: u8,
    granule_position: u64,
    data: Bytes,
}

/// Writes one page per packet.
///
/// The most recent page is held back until the next write or `close`, so the
/// final page of the stream can carry the end-of-stream flag.
pub struct OggWriter<W: Write = BufWriter<File>> {
    writer: Option<W>,
    serial: u32,
    sequence: u32,
    sample_rate: u32,
    granule: u64,
    pending: Option<PendingPage>,
}

impl OggWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32, channels: u8) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file), sample_rate, channels)
    }
}

impl<W: Write> OggWriter<W> {
    pub fn new(writer: W, sample_rate: u32, channels: u8) -> Result<Self> {
        let serial = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();

        let mut ogg = Self {
            writer: Some(writer),
            serial,
            sequence: 0,
            sample_rate,
            granule: 0,
            pending: None,
        };

        let head = OpusHeader::new(sample_rate, channels).encode();
        ogg.emit(HEADER_TYPE_BOS, 0, head)?;
        ogg.pending = Some(PendingPage {
            header_type: 0,
            granule_position: 0,
            data: comment_header(),
        });

        Ok(ogg)
    }

    /// Append a packet with an explicit granule position
    pub fn write_page(&mut self, data: impl Into<Bytes>, granule_position: u64) -> Result<()> {
        if self.writer.is_none() {
            return Err(MediaError::Closed);
        }
        if granule_position < self.granule {
            return Err(MediaError::GranuleRegression {
                previous: self.granule,
                current: granule_position,
            });
        }

        let data = data.into();
        let page_size = data.len();
        if page_size / 255 + 1 > MAX_SEGMENTS {
            return Err(MediaError::PacketTooLarge(page_size));
        }

        self.flush_pending(0)?;
        self.granule = granule_position;
        self.pending = Some(PendingPage {
            header_type: 0,
            granule_position,
            data,
        });
        Ok(())
    }

    pub fn granule_position(&self) -> u64 {
        self.granule
    }

    fn flush_pending(&mut self, extra_flags: u8) -> Result<()> {
        if let Some(page) = self.pending.take() {
            self.emit(page.header_type | extra_flags, page.granule_position, page.data)?;
        }
        Ok(())
    }

    fn emit(&mut self, header_type: u8, granule_position: u64, data: Bytes) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(MediaError::Closed)?;
        let page = OggPage {
            header_type,
            granule_position,
            serial: self.serial,
            sequence: self.sequence,
            data,
        };
        writer.write_all(&page.encode()?)?;
        self.sequence += 1;
        Ok(())
    }
}

impl<W: Write + Send> ContainerWriter for OggWriter<W> {
    /// Advances the granule position by the unit's duration worth of samples
    fn write_unit(&mut self, unit: &EncodedUnit) -> Result<()> {
        let granule = self.granule + samples_in(unit.duration, self.sample_rate);
        self.write_page(unit.data.clone(), granule)
    }

    fn close(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }

        self.flush_pending(HEADER_TYPE_EOS)?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        tracing::debug!(
            "Ogg container closed after {} pages, granule {}",
            self.sequence,
            self.granule
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}
