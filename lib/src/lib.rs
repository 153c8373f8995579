#![deny(clippy::uninlined_format_args)]
#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::{future::Future, io, path::PathBuf, str::FromStr};

use bytes::Bytes;
use derive_more::derive::Display;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod merge;
mod path;
mod pipe;
mod read;
pub mod transform;
mod write;

pub use merge::{LayerMerger, MergeError, MergeStream};

/// A handle that can open the raw byte stream of one layer archive.
///
/// Sources are consumed by [`LayerMerger::merge`]: each layer's stream is
/// opened exactly once, read front to back, and closed before the next layer
/// opens. Consuming `self` is what makes the "exactly once" part hold at the
/// type level.
///
/// Implementations are provided for in-memory buffers (tests, small layers)
/// and filesystem paths (the CLI). Anything else can implement the trait
/// directly, wrapping its failures in [`io::Error`].
pub trait LayerSource: Send {
    /// The stream of raw archive bytes for this layer.
    type Stream: AsyncRead + Send + Unpin;

    /// Open a fresh byte stream over the layer archive.
    fn open_layer(self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

impl LayerSource for Bytes {
    type Stream = io::Cursor<Bytes>;

    async fn open_layer(self) -> io::Result<Self::Stream> {
        Ok(io::Cursor::new(self))
    }
}

impl LayerSource for Vec<u8> {
    type Stream = io::Cursor<Vec<u8>>;

    async fn open_layer(self) -> io::Result<Self::Stream> {
        Ok(io::Cursor::new(self))
    }
}

impl LayerSource for &'static [u8] {
    type Stream = io::Cursor<&'static [u8]>;

    async fn open_layer(self) -> io::Result<Self::Stream> {
        Ok(io::Cursor::new(self))
    }
}

impl LayerSource for PathBuf {
    type Stream = tokio::fs::File;

    async fn open_layer(self) -> io::Result<Self::Stream> {
        tokio::fs::File::open(self).await
    }
}

impl LayerSource for tokio::fs::File {
    type Stream = tokio::fs::File;

    async fn open_layer(self) -> io::Result<Self::Stream> {
        Ok(self)
    }
}

/// Prefix prepended to every path emitted into the merged archive.
///
/// Must be non-empty and end with `/` so joined paths keep their component
/// boundary. The prefix only affects emitted names; shadowing and deletion
/// decisions are always made on the un-prefixed canonical paths.
///
/// ```
/// # use std::str::FromStr;
/// # use strata_lib::PathPrefix;
/// let prefix = PathPrefix::from_str("rootfs/").expect("parse prefix");
/// assert_eq!(prefix.as_str(), "rootfs/");
/// assert!(PathPrefix::from_str("rootfs").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{_0}")]
pub struct PathPrefix(String);

impl PathPrefix {
    /// The prefix as a string slice, trailing `/` included.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PathPrefix {
    type Err = InvalidPrefix;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidPrefix::Empty);
        }
        if !s.ends_with('/') {
            return Err(InvalidPrefix::MissingSlash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

/// Rejected [`PathPrefix`] input.
#[derive(Debug, Error)]
pub enum InvalidPrefix {
    /// The prefix was empty; omit it instead.
    #[error("path prefix cannot be empty")]
    Empty,

    /// The prefix did not end with a `/`.
    #[error("path prefix must end with '/', got {0:?}")]
    MissingSlash(String),
}
