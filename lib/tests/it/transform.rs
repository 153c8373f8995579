use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};
use bytes::Bytes;
use color_eyre::Result;
use simple_test_case::test_case;
use strata_lib::transform::{self, Compression};
use tokio::io::{AsyncReadExt, BufReader};

use crate::{assert_has_file, file, layer, read_entries, squash};

#[derive(Debug, Clone, Copy)]
pub enum Codec {
    Gzip,
    Zstd,
}

async fn compress(data: &[u8], codec: Codec) -> Result<Bytes> {
    let mut out = Vec::new();
    match codec {
        Codec::Gzip => {
            let mut encoder = GzipEncoder::new(data);
            tokio::io::copy(&mut encoder, &mut out).await?;
        }
        Codec::Zstd => {
            let mut encoder = ZstdEncoder::new(data);
            tokio::io::copy(&mut encoder, &mut out).await?;
        }
    }
    Ok(Bytes::from(out))
}

#[test_case(Codec::Gzip, Compression::Gzip; "gzip")]
#[test_case(Codec::Zstd, Compression::Zstd; "zstd")]
#[test_log::test(tokio::test)]
async fn detect_and_decompress(codec: Codec, expected: Compression) -> Result<()> {
    let input = b"Hello, World!";
    let compressed = compress(input, codec).await?;

    let detected = Compression::detect(&compressed);
    assert_eq!(detected, expected);

    let cursor = std::io::Cursor::new(compressed.clone());
    let mut reader = transform::decompress(BufReader::new(cursor), detected);
    let mut output = Vec::new();
    reader.read_to_end(&mut output).await?;
    assert_eq!(output, input);
    Ok(())
}

#[test_case(Codec::Gzip; "gzip")]
#[test_case(Codec::Zstd; "zstd")]
#[test_log::test(tokio::test)]
async fn compressed_layer_merges_like_raw(codec: Codec) -> Result<()> {
    let raw = layer([
        file("some_file", b"foo"),
        file("another_file", b"bar"),
        file("third_file", b"meh"),
    ])
    .await?;
    let compressed = compress(&raw, codec).await?;

    let entries = read_entries(&squash(vec![compressed]).await?).await?;

    assert_has_file(&entries, "some_file", b"foo");
    assert_has_file(&entries, "another_file", b"bar");
    assert_has_file(&entries, "third_file", b"meh");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn mixed_compression_stack() -> Result<()> {
    let top = compress(&layer([file("top_file", b"top")]).await?, Codec::Gzip).await?;
    let bottom = layer([file("bottom_file", b"bottom")]).await?;

    let entries = read_entries(&squash(vec![top, bottom]).await?).await?;

    assert_has_file(&entries, "top_file", b"top");
    assert_has_file(&entries, "bottom_file", b"bottom");
    Ok(())
}
