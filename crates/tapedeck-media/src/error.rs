use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid container header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid timebase {numerator}/{denominator}")]
    InvalidTimebase { numerator: u32, denominator: u32 },

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Page checksum mismatch: expected {expected:#010x}, found {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Granule position went backwards: {previous} -> {current}")]
    GranuleRegression { previous: u64, current: u64 },

    #[error("Packet of {0} bytes does not fit in a single page")]
    PacketTooLarge(usize),

    #[error("Frame of {0} bytes exceeds the IVF size field")]
    FrameTooLarge(usize),

    #[error("Container is already closed")]
    Closed,
}

impl MediaError {
    /// Whether the error means the container content itself is unusable
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MediaError::InvalidHeader(_)
                | MediaError::Truncated(_)
                | MediaError::ChecksumMismatch { .. }
                | MediaError::GranuleRegression { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
