use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use futures_lite::StreamExt;
use strata_lib::{LayerMerger, PathPrefix};
use tokio_tar::Archive;
use tokio_util::io::StreamReader;
use tracing::debug;

#[derive(Debug, Parser)]
pub struct Options {
    /// Layer tarballs to merge, listed top layer first
    #[arg(required = true)]
    layers: Vec<PathBuf>,

    /// Prefix prepended to every entry path (must end with '/')
    #[arg(long, value_parser = PathPrefix::from_str)]
    prefix: Option<PathPrefix>,
}

/// Print the entry paths of the merged result, one per line, without
/// materializing the archive anywhere.
#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let merger = LayerMerger::builder()
        .maybe_path_prefix(opts.prefix)
        .build();
    let reader = StreamReader::new(merger.merge(opts.layers));

    let mut archive = Archive::new(reader);
    let mut entries = archive
        .entries()
        .context("read entries from merged archive")?;
    while let Some(entry) = entries.next().await {
        let entry = entry.context("read entry")?;
        let path = entry.path().context("read entry path")?;
        debug!(?path, "enumerate");
        println!("{}", path.display());
    }

    Ok(())
}
