//! Compression-aware transport detection and counting readers.
//!
//! The Streamer auto-detects the compression transport by inspecting the
//! first magic bytes of the archive source; everything downstream reads
//! through a single decoded byte stream regardless of which transport was
//! in play.

use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Read};
use std::rc::Rc;

use crate::error::ExtractError;

/// Supported compression transports, auto-detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Gzip,
    Bzip2,
    Xz,
}

impl Transport {
    /// Detect the transport from a peeked prefix of the archive source.
    /// Returns `None` if no supported magic sequence matches (the Streamer
    /// maps this to `UnsupportedFormatError`, not a silent plain-TAR
    /// fallback is never chosen speculatively beyond the no-magic case).
    #[must_use]
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if prefix.starts_with(b"BZh") {
            Self::Bzip2
        } else if prefix.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else {
            Self::Plain
        }
    }
}

/// Shared byte counter, read by the Streamer after every chunk.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Rc<Cell<u64>>);

impl ByteCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    fn add(&self, n: u64) {
        self.0.set(self.0.get().saturating_add(n));
    }
}

/// Wraps a reader, tallying every byte that passes through into a shared
/// [`ByteCounter`]. Used on the compressed source to track
/// `compressed_bytes_read`.
pub struct CountingReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, counter: ByteCounter) -> Self {
        Self { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// A decoded byte stream, regardless of which transport produced it.
pub struct DecodedReader {
    inner: Box<dyn Read>,
    transport: Transport,
}

impl DecodedReader {
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }
}

impl Read for DecodedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Detect the transport from `reader`'s first bytes and wrap it with the
/// matching decoder. `reader` should already be counting compressed bytes
/// (see [`CountingReader`]) before being passed here.
pub fn open<R>(reader: R) -> Result<DecodedReader, ExtractError>
where
    R: Read + 'static,
{
    let mut buffered = BufReader::new(reader);
    let prefix = {
        let filled = buffered
            .fill_buf()
            .map_err(|e| ExtractError::ArchiveOpen { detail: e.to_string() })?;
        filled[..filled.len().min(6)].to_vec()
    };
    let transport = Transport::detect(&prefix);

    let inner: Box<dyn Read> = match transport {
        Transport::Plain => Box::new(buffered),
        #[cfg(feature = "gzip")]
        Transport::Gzip => Box::new(flate2::read::MultiGzDecoder::new(buffered)),
        #[cfg(not(feature = "gzip"))]
        Transport::Gzip => return Err(ExtractError::UnsupportedFormat),
        #[cfg(feature = "bzip2-support")]
        Transport::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(buffered)),
        #[cfg(not(feature = "bzip2-support"))]
        Transport::Bzip2 => return Err(ExtractError::UnsupportedFormat),
        #[cfg(feature = "xz")]
        Transport::Xz => Box::new(xz2::read::XzDecoder::new(buffered)),
        #[cfg(not(feature = "xz"))]
        Transport::Xz => return Err(ExtractError::UnsupportedFormat),
    };

    Ok(DecodedReader { inner, transport })
}
