use assert_fs::prelude::*;
use color_eyre::{eyre::Context, Result};
use xshell::{cmd, Shell};

use crate::{read_layer, workspace_root, write_layer};

#[test_log::test(tokio::test)]
async fn squash_two_layers() -> Result<()> {
    let workspace = workspace_root();
    let temp = assert_fs::TempDir::new().context("create temp dir")?;

    let top = temp.child("top.tar").path().to_path_buf();
    let bottom = temp.child("bottom.tar").path().to_path_buf();
    let output = temp.child("merged.tar").path().to_path_buf();
    write_layer(&top, &[("shared_file", b"top"), ("top_file", b"one")]).await?;
    write_layer(
        &bottom,
        &[("shared_file", b"bottom"), ("bottom_file", b"two")],
    )
    .await?;

    tracing::info!(workspace = %workspace.display(), "run strata squash");
    let sh = Shell::new().context("create shell")?;
    sh.change_dir(&workspace);
    cmd!(sh, "cargo run -p strata -- squash -o {output} {top} {bottom}").run()?;

    let entries = read_layer(&output).await?;
    let lookup = |name: &str| {
        entries
            .iter()
            .find(|(path, _)| path == name)
            .map(|(_, contents)| contents.clone())
    };

    pretty_assertions::assert_eq!(lookup("shared_file"), Some(b"top".to_vec()));
    pretty_assertions::assert_eq!(lookup("top_file"), Some(b"one".to_vec()));
    pretty_assertions::assert_eq!(lookup("bottom_file"), Some(b"two".to_vec()));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn list_merged_entries() -> Result<()> {
    let workspace = workspace_root();
    let temp = assert_fs::TempDir::new().context("create temp dir")?;

    let top = temp.child("top.tar").path().to_path_buf();
    let bottom = temp.child("bottom.tar").path().to_path_buf();
    write_layer(&top, &[("top_file", b"one")]).await?;
    write_layer(&bottom, &[("bottom_file", b"two")]).await?;

    tracing::info!(workspace = %workspace.display(), "run strata list");
    let sh = Shell::new().context("create shell")?;
    sh.change_dir(&workspace);
    let listing = cmd!(sh, "cargo run -p strata -- list --prefix rootfs/ {top} {bottom}").read()?;

    let lines = listing.lines().collect::<Vec<_>>();
    assert!(lines.contains(&"rootfs/top_file"), "listing: {listing}");
    assert!(lines.contains(&"rootfs/bottom_file"), "listing: {listing}");
    Ok(())
}
