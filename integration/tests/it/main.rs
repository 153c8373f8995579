use std::path::{Path, PathBuf};

use color_eyre::Result;
use futures_lite::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_tar::{Builder, Header};

mod squash;

/// The root directory of the workspace.
pub fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

/// Write a layer tarball of regular files to `path`.
pub async fn write_layer(path: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    let mut builder = Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        let mut contents = *contents;
        builder.append_data(&mut header, name, &mut contents).await?;
    }
    builder.finish().await?;
    tokio::fs::write(path, builder.into_inner().await?).await?;
    Ok(())
}

/// Read back the (path, contents) pairs of a tarball on disk.
pub async fn read_layer(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = tokio::fs::File::open(path).await?;
    let mut archive = tokio_tar::Archive::new(file);
    let mut entries = archive.entries()?;

    let mut out = Vec::new();
    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).await?;
        out.push((name, contents));
    }
    Ok(out)
}
