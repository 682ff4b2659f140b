use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;

/// One self-contained chunk of encoded media plus its playout duration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub duration: Duration,
}

impl EncodedUnit {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self {
            data: data.into(),
            duration,
        }
    }
}

/// Read side of a container.
///
/// Produces units lazily in file order. `Ok(None)` marks the end of data;
/// a damaged file is reported as an error instead.
pub trait ContainerReader: Send {
    fn next_unit(&mut self) -> Result<Option<EncodedUnit>>;
}

impl<R: ContainerReader + ?Sized> ContainerReader for Box<R> {
    fn next_unit(&mut self) -> Result<Option<EncodedUnit>> {
        (**self).next_unit()
    }
}

/// Write side of a container.
///
/// `close` finalizes the trailer/metadata. Calling it more than once is a no-op,
/// writing after it fails with [`crate::MediaError::Closed`].
pub trait ContainerWriter: Send {
    fn write_unit(&mut self, unit: &EncodedUnit) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// Fill `buf` from `reader`, returning how many bytes were read before end of file
pub(crate) fn read_full<R: std::io::Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
