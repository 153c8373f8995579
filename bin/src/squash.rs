use std::{path::PathBuf, str::FromStr};

use async_compression::tokio::write::GzipEncoder;
use clap::Parser;
use color_eyre::eyre::{Context, Result};
use pluralizer::pluralize;
use strata_lib::{LayerMerger, PathPrefix};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tracing::info;

#[derive(Debug, Parser)]
pub struct Options {
    /// Layer tarballs to merge, listed top layer first
    ///
    /// Each layer may be a plain, gzip-compressed, or zstd-compressed
    /// tarball; compression is detected per layer.
    #[arg(required = true)]
    layers: Vec<PathBuf>,

    /// File path where the merged tarball will be written
    #[arg(long, short, default_value = "image.tar")]
    output: PathBuf,

    /// Prefix prepended to every entry path in the output (must end with '/')
    #[arg(long, value_parser = PathPrefix::from_str)]
    prefix: Option<PathPrefix>,

    /// Compress the merged tarball with gzip
    #[arg(long)]
    gzip: bool,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    info!(
        "merging {}",
        pluralize("layer", opts.layers.len() as isize, true)
    );

    let merger = LayerMerger::builder()
        .maybe_path_prefix(opts.prefix)
        .build();
    let mut merged = StreamReader::new(merger.merge(opts.layers));

    let output = tokio::fs::File::create(&opts.output)
        .await
        .context("create output file")?;
    let mut writer = BufWriter::new(output);

    if opts.gzip {
        let mut encoder = GzipEncoder::new(writer);
        tokio::io::copy(&mut merged, &mut encoder)
            .await
            .context("write merged archive")?;
        encoder.shutdown().await.context("finish compression")?;
    } else {
        tokio::io::copy(&mut merged, &mut writer)
            .await
            .context("write merged archive")?;
        writer.shutdown().await.context("flush output")?;
    }

    info!(output = %opts.output.display(), "wrote merged archive");
    Ok(())
}
