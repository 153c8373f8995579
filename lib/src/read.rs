//! Streaming reads over a single layer archive.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::derive::Display;
use futures_lite::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_tar::{Archive, Entries, Entry, EntryType, Header};
use tracing::trace;

use crate::{merge::MergeError, path};

/// Streaming parse of one layer archive.
///
/// Entries must be taken in archive order; requesting the next entry discards
/// whatever remains of the previous entry's body.
pub(crate) struct LayerArchive<R: AsyncRead + Send + Sync + Unpin> {
    entries: Entries<R>,
    layer: usize,
}

impl<R: AsyncRead + Send + Sync + Unpin> LayerArchive<R> {
    /// Start reading a layer archive from the beginning of `reader`.
    pub(crate) fn open(layer: usize, reader: R) -> Result<Self, MergeError> {
        let mut archive = Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|source| MergeError::ArchiveRead { layer, source })?;
        Ok(Self { entries, layer })
    }

    /// The next entry in archive order, or `None` at the end of the archive.
    ///
    /// An empty byte stream ends immediately; malformed or truncated headers
    /// surface as [`MergeError::ArchiveRead`].
    pub(crate) async fn next(&mut self) -> Result<Option<LayerEntry<R>>, MergeError> {
        let layer = self.layer;
        let archive_read = |source: io::Error| MergeError::ArchiveRead { layer, source };

        let Some(entry) = self.entries.next().await else {
            return Ok(None);
        };
        let entry = entry.map_err(archive_read)?;

        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let canonical = path::canonicalize(&raw_path);
        let size = entry.header().entry_size().map_err(archive_read)?;
        let kind = match entry.header().entry_type() {
            EntryType::Directory => EntryKind::Directory,
            EntryType::Link => {
                let target = entry.link_name_bytes().ok_or_else(|| {
                    archive_read(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("hardlink entry {raw_path:?} has no target"),
                    ))
                })?;
                EntryKind::Hardlink(path::canonicalize(&String::from_utf8_lossy(&target)))
            }
            EntryType::Symlink => EntryKind::Symlink,
            kind if kind.is_file() => EntryKind::File,
            _ => EntryKind::Other,
        };

        trace!(layer, path = %canonical, %kind, size, "read entry");
        Ok(Some(LayerEntry {
            inner: entry,
            layer,
            raw_path,
            canonical,
            kind,
            size,
        }))
    }
}

/// One record read from a layer archive: parsed header fields plus a lazy,
/// bounded body reader.
pub(crate) struct LayerEntry<R: AsyncRead + Send + Sync + Unpin> {
    inner: Entry<Archive<R>>,
    layer: usize,
    raw_path: String,
    canonical: String,
    kind: EntryKind,
    size: u64,
}

impl<R: AsyncRead + Send + Sync + Unpin> LayerEntry<R> {
    /// The path exactly as the layer declared it.
    pub(crate) fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// The canonical path used for identity decisions.
    pub(crate) fn canonical(&self) -> &str {
        &self.canonical
    }

    pub(crate) fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub(crate) fn layer(&self) -> usize {
        self.layer
    }

    /// Declared body size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn header(&self) -> &Header {
        self.inner.header()
    }

    /// Consume the entry, yielding its body reader.
    pub(crate) fn into_body(self) -> Body<Entry<Archive<R>>> {
        Body {
            inner: self.inner,
            layer: self.layer,
            remaining: self.size,
            failed: false,
        }
    }
}

/// Entry kinds the merger distinguishes. Hardlinks carry their canonical
/// target path; everything the merger does not treat specially is `Other`
/// and passes through with its header intact.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub(crate) enum EntryKind {
    #[display("file")]
    File,
    #[display("directory")]
    Directory,
    #[display("hardlink -> {_0}")]
    Hardlink(String),
    #[display("symlink")]
    Symlink,
    #[display("other")]
    Other,
}

/// Lazy reader over one entry's bytes, bounded by the declared size.
///
/// Remembers whether a failure originated on this side, so that errors raised
/// while copying a body can be attributed to the layer being read rather than
/// to the output writer. A body that ends before its declared size is a
/// truncated archive and fails with `UnexpectedEof`.
pub(crate) struct Body<R> {
    inner: R,
    layer: usize,
    remaining: u64,
    failed: bool,
}

impl<R> Body<R> {
    pub(crate) fn layer(&self) -> usize {
        self.layer
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Body<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        let filled = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - filled;
                if read == 0 {
                    this.failed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("entry body truncated with {} bytes left", this.remaining),
                    )));
                }
                this.remaining = this.remaining.saturating_sub(read as u64);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.failed = true;
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
