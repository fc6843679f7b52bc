//! CLI smoke tests covering the extract/list subcommands.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

#[test]
fn extract_writes_files_to_destination() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let archive_path = temp.path().join("bundle.tar");
    std::fs::write(&archive_path, build_tar(&[("file.bin", b"abc123")]))?;
    let extract_dir = temp.path().join("out");

    cargo_bin_cmd!("safetar")
        .arg("extract")
        .arg(&archive_path)
        .arg("--directory")
        .arg(&extract_dir)
        .assert()
        .success();

    assert!(extract_dir.join("file.bin").exists());
    assert_eq!(std::fs::read(extract_dir.join("file.bin"))?, b"abc123");
    Ok(())
}

#[test]
fn list_outputs_member_paths() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let archive_path = temp.path().join("bundle.tar");
    std::fs::write(&archive_path, build_tar(&[("file.bin", b"abc123")]))?;

    cargo_bin_cmd!("safetar")
        .arg("list")
        .arg(&archive_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("file.bin"));
    Ok(())
}

#[test]
fn extract_rejects_path_traversal_with_nonzero_exit() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let archive_path = temp.path().join("evil.tar");

    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_path("../escape.txt").unwrap();
    header.set_cksum();
    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..])?;
    std::fs::write(&archive_path, builder.into_inner()?)?;

    let extract_dir = temp.path().join("out");
    cargo_bin_cmd!("safetar")
        .arg("extract")
        .arg(&archive_path)
        .arg("--directory")
        .arg(&extract_dir)
        .assert()
        .failure()
        .code(3);
    Ok(())
}
