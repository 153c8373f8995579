//! Input transformations for spooled layer bytes.
//!
//! Layer producers wrap their tarballs in whatever compression they like;
//! the merger sniffs the frame from the first bytes and peels it off, the
//! same way `docker save` consumers do. Only the input side is transformed:
//! merged output is always a plain tar stream.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use tokio::io::{AsyncBufRead, AsyncRead};

/// Compression framing detected around a layer's archive bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar bytes.
    None,

    /// The layer is compressed with gzip.
    Gzip,

    /// The layer is compressed with zstd.
    Zstd,
}

impl Compression {
    const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
    const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

    /// Sniff the frame from the first bytes of a layer.
    ///
    /// Anything that is not a recognized compression magic is treated as
    /// plain tar and left for the archive parser to accept or reject.
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&Self::GZIP_MAGIC) {
            Self::Gzip
        } else if head.starts_with(&Self::ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

/// Wrap `reader` in the decoder matching the detected compression.
pub fn decompress(
    reader: impl AsyncBufRead + Send + Sync + Unpin + 'static,
    compression: Compression,
) -> Box<dyn AsyncRead + Send + Sync + Unpin> {
    match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(GzipDecoder::new(reader)),
        Compression::Zstd => Box::new(ZstdDecoder::new(reader)),
    }
}
