//! Flattens an ordered stack of layer archives into one output archive.
//!
//! Layers are processed strictly top to bottom. The first entry observed at
//! a canonical path wins; AUFS whiteout entries (`.wh.<name>`) mask the named
//! path and its whole subtree in every layer below; hardlinks whose target
//! is masked are rewritten into regular files carrying the target's bytes so
//! the flattened archive stays self-contained.

use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
};

use async_tempfile::TempFile;
use bon::Builder;
use bytes::Bytes;
use futures_lite::Stream;
use tap::Pipe;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio_tar::EntryType;
use tracing::{debug, warn};

use crate::{
    path, pipe,
    read::{EntryKind, LayerArchive, LayerEntry},
    transform::{self, Compression},
    write::TarSink,
    LayerSource, PathPrefix,
};

/// Errors surfaced while producing the merged archive.
///
/// The stream stops after yielding an error; any prefix of the output that
/// was already pulled remains valid-so-far and the caller decides whether to
/// keep it.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A layer's bytes were not a valid tar archive, or a header or body was
    /// truncated mid-entry.
    #[error("layer {layer} is not a valid tar archive")]
    ArchiveRead {
        /// Index of the offending layer, top layer first.
        layer: usize,
        #[source]
        source: io::Error,
    },

    /// A layer source failed to open or deliver its byte stream.
    #[error("open layer {layer}")]
    OpenLayer {
        /// Index of the offending layer, top layer first.
        layer: usize,
        #[source]
        source: io::Error,
    },

    /// The output side rejected bytes, e.g. the consumer went away.
    #[error("write merged archive")]
    Write(#[source] io::Error),
}

impl From<MergeError> for io::Error {
    fn from(err: MergeError) -> Self {
        io::Error::other(err)
    }
}

/// Lazily produced bytes of the merged archive.
///
/// The error type converts into [`io::Error`], so the stream can be fed
/// directly to [`tokio_util::io::StreamReader`].
pub type MergeStream = Pin<Box<dyn Stream<Item = Result<Bytes, MergeError>> + Send>>;

/// Merges an ordered stack of layer archives, top layer first, into a single
/// tar stream.
///
/// ```no_run
/// # use strata_lib::LayerMerger;
/// # async fn example(layers: Vec<std::path::PathBuf>) {
/// let merged = LayerMerger::builder().build().merge(layers);
/// # }
/// ```
#[derive(Debug, Clone, Default, Builder)]
pub struct LayerMerger {
    /// Prefix prepended to every emitted entry path.
    path_prefix: Option<PathPrefix>,
}

impl LayerMerger {
    /// Merge the given layers into a single archive byte stream.
    ///
    /// Layers are ordered top to bottom: the first layer wins conflicts.
    /// Each source is opened exactly once and at most one layer is open at
    /// any instant. The stream ends with the archive terminator once every
    /// layer has been folded in; dropping it early tears the merge down.
    pub fn merge<L>(self, layers: impl IntoIterator<Item = L>) -> MergeStream
    where
        L: LayerSource + 'static,
    {
        let layers = layers.into_iter().collect::<Vec<_>>();
        pipe::stream_producer(move |out| self.run(layers, out))
    }

    #[tracing::instrument(skip_all, fields(layers = layers.len()))]
    async fn run<L, W>(self, layers: Vec<L>, out: W) -> Result<(), MergeError>
    where
        L: LayerSource,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let mut sink = TarSink::new(out);
        let mut state = MergeState::new(self.path_prefix);

        for (layer, source) in layers.into_iter().enumerate() {
            let spool = Spool::collect(layer, source).await?;
            if spool.is_empty() {
                debug!(layer, "skip: empty layer");
                continue;
            }
            merge_layer(&spool, &mut state, &mut sink).await?;
        }

        sink.finish().await
    }
}

/// Fold one layer's entries into the output.
#[tracing::instrument(skip_all, fields(layer = spool.layer()))]
async fn merge_layer<W>(
    spool: &Spool,
    state: &mut MergeState,
    sink: &mut TarSink<W>,
) -> Result<(), MergeError>
where
    W: AsyncWrite + Send + Sync + Unpin,
{
    let layer = spool.layer();
    let mut archive = LayerArchive::open(layer, spool.reader().await?)?;

    while let Some(entry) = archive.next().await? {
        let canonical = entry.canonical().to_owned();

        // A whiteout is a deletion record, not content. It masks the named
        // path and its subtree in this layer and below; entries already
        // emitted from higher layers are unaffected.
        if let Some(target) = path::whiteout_target(&canonical) {
            debug!(path = %canonical, target = %target, "whiteout");
            state.delete(target);
            continue;
        }

        if state.shadowed(&canonical) {
            debug!(path = %canonical, "skip: shadowed by higher layer");
            continue;
        }
        if state.deleted(&canonical) {
            debug!(path = %canonical, "skip: deleted by higher layer");
            continue;
        }

        if let EntryKind::Hardlink(target) = entry.kind() {
            if state.link_target_suppressed(target, layer) {
                let target = target.clone();
                rewrite_hardlink(spool, entry, &target, state, sink).await?;
                continue;
            }
        }

        emit(entry, state, sink).await?;
    }

    Ok(())
}

/// Copy an entry through to the output under its (possibly prefixed) name.
async fn emit<R, W>(
    entry: LayerEntry<R>,
    state: &mut MergeState,
    sink: &mut TarSink<W>,
) -> Result<(), MergeError>
where
    R: AsyncRead + Send + Sync + Unpin,
    W: AsyncWrite + Send + Sync + Unpin,
{
    let layer = entry.layer();
    let canonical = entry.canonical().to_owned();
    let out_path = state.emit_path(entry.raw_path());
    let header = entry.header().clone();

    debug!(path = %canonical, kind = %entry.kind(), "emit");
    sink.write_entry(&header, &out_path, entry.into_body()).await?;
    state.record_emitted(canonical, layer);
    Ok(())
}

/// Replace a hardlink whose target will not appear in the output with a
/// regular file carrying the target's bytes.
///
/// The target's body is read in a second pass over the spooled layer, so
/// every such link gets its own copy regardless of where the target sits in
/// the archive. If the target genuinely is not in this layer the link is
/// emitted unchanged.
async fn rewrite_hardlink<R, W>(
    spool: &Spool,
    link: LayerEntry<R>,
    target: &str,
    state: &mut MergeState,
    sink: &mut TarSink<W>,
) -> Result<(), MergeError>
where
    R: AsyncRead + Send + Sync + Unpin,
    W: AsyncWrite + Send + Sync + Unpin,
{
    let layer = spool.layer();
    let canonical = link.canonical().to_owned();

    let mut scan = LayerArchive::open(layer, spool.reader().await?)?;
    while let Some(entry) = scan.next().await? {
        if entry.canonical() != target || !matches!(entry.kind(), EntryKind::File) {
            continue;
        }

        debug!(path = %canonical, target = %target, "rewrite hardlink as regular file");
        let mut header = link.header().clone();
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.size());

        let out_path = state.emit_path(link.raw_path());
        sink.write_entry(&header, &out_path, entry.into_body()).await?;
        state.record_emitted(canonical, layer);
        return Ok(());
    }

    warn!(path = %canonical, target = %target, "hardlink target not in layer, keeping link");
    emit(link, state, sink).await
}

/// Bookkeeping for one merge run.
struct MergeState {
    path_prefix: Option<PathPrefix>,

    /// Canonical path -> index of the layer that emitted it.
    emitted: HashMap<String, usize>,

    /// Canonical paths masked by a whiteout. Each member masks itself and
    /// everything under it, so deleting a directory needs no knowledge of
    /// its contents.
    deleted: HashSet<String>,
}

impl MergeState {
    fn new(path_prefix: Option<PathPrefix>) -> Self {
        Self {
            path_prefix,
            emitted: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    fn shadowed(&self, canonical: &str) -> bool {
        self.emitted.contains_key(canonical)
    }

    fn deleted(&self, canonical: &str) -> bool {
        if self.deleted.contains(canonical) {
            return true;
        }
        canonical
            .bytes()
            .enumerate()
            .any(|(at, byte)| byte == b'/' && self.deleted.contains(&canonical[..at]))
    }

    fn delete(&mut self, target: String) {
        self.deleted.insert(target);
    }

    fn record_emitted(&mut self, canonical: String, layer: usize) {
        self.emitted.insert(canonical, layer);
    }

    /// Whether a hardlink target from `layer` cannot appear in the output:
    /// either it is deleted, or an earlier layer already owns that path so
    /// this layer's body for it is shadowed. A target emitted from the same
    /// layer is fine; the link resolves against it.
    fn link_target_suppressed(&self, target: &str, layer: usize) -> bool {
        if self.deleted(target) {
            return true;
        }
        matches!(self.emitted.get(target), Some(&emitted_in) if emitted_in != layer)
    }

    /// The name an entry is emitted under: the declared path, prefixed when
    /// a prefix is configured. Identity bookkeeping never sees this form.
    fn emit_path(&self, declared: &str) -> String {
        match &self.path_prefix {
            Some(prefix) => format!("{prefix}{declared}"),
            None => declared.to_string(),
        }
    }
}

/// One layer's bytes staged to a temp file so the archive can be read more
/// than once without going back to the source.
struct Spool {
    layer: usize,
    file: TempFile,
    len: u64,
    compression: Compression,
}

impl Spool {
    /// Open a layer source and drain it to disk, sniffing the compression
    /// frame from the first bytes.
    #[tracing::instrument(skip(source))]
    async fn collect<L: LayerSource>(layer: usize, source: L) -> Result<Self, MergeError> {
        let open_err = |source: io::Error| MergeError::OpenLayer { layer, source };

        let mut stream = source.open_layer().await.map_err(open_err)?;
        let file = TempFile::new()
            .await
            .map_err(io::Error::other)
            .map_err(open_err)?;

        let mut writer = BufWriter::new(file);
        let len = tokio::io::copy(&mut stream, &mut writer)
            .await
            .map_err(open_err)?;
        writer.flush().await.map_err(open_err)?;
        let file = writer.into_inner();
        file.sync_all().await.map_err(open_err)?;

        let compression = match len {
            0 => Compression::None,
            _ => sniff(file.file_path()).await.map_err(open_err)?,
        };

        debug!(len, ?compression, "spooled layer");
        Ok(Self {
            layer,
            file,
            len,
            compression,
        })
    }

    fn layer(&self) -> usize {
        self.layer
    }

    /// A zero-byte layer carries no archive at all and is skipped outright.
    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Open a fresh read pass over the layer's archive bytes.
    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Sync + Unpin>, MergeError> {
        tokio::fs::File::open(self.file.file_path())
            .await
            .map_err(|source| MergeError::OpenLayer {
                layer: self.layer,
                source,
            })?
            .pipe(BufReader::new)
            .pipe(|reader| transform::decompress(reader, self.compression))
            .pipe(Ok)
    }
}

/// Read the magic bytes at the start of the spooled file.
async fn sniff(path: &std::path::Path) -> io::Result<Compression> {
    let mut probe = tokio::fs::File::open(path).await?;
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        let read = probe.read(&mut head[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(Compression::detect(&head[..filled]))
}
