//! Output archive framing.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tar::{Builder, Header};

use crate::{merge::MergeError, read::Body};

/// Writes merged entries into a single output archive.
///
/// The builder owns all framing: block padding after each body, GNU
/// long-name extensions when an output path does not fit the header, and the
/// end-of-archive zero blocks on [`TarSink::finish`].
pub(crate) struct TarSink<W: AsyncWrite + Send + Sync + Unpin + 'static> {
    inner: Builder<W>,
}

impl<W: AsyncWrite + Send + Sync + Unpin + 'static> TarSink<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            inner: Builder::new(writer),
        }
    }

    /// Append one entry under the given output path, copying its body through.
    ///
    /// The source header is kept as-is apart from the rewritten name and
    /// checksum. Failures are attributed to the layer when the body reader
    /// raised them, and to the output otherwise.
    pub(crate) async fn write_entry<R: AsyncRead + Unpin>(
        &mut self,
        header: &Header,
        path: &str,
        mut body: Body<R>,
    ) -> Result<(), MergeError> {
        let mut header = header.clone();
        match self.inner.append_data(&mut header, path, &mut body).await {
            Ok(()) => Ok(()),
            Err(source) if body.failed() => Err(MergeError::ArchiveRead {
                layer: body.layer(),
                source,
            }),
            Err(source) => Err(MergeError::Write(source)),
        }
    }

    /// Write the end-of-archive blocks and flush the underlying writer.
    pub(crate) async fn finish(mut self) -> Result<(), MergeError> {
        self.inner.finish().await.map_err(MergeError::Write)?;
        let mut writer = self.inner.into_inner().await.map_err(MergeError::Write)?;
        writer.shutdown().await.map_err(MergeError::Write)
    }
}
