//! End-to-end extraction tests driving the real pipeline against
//! hand-built TAR archives, covering the attack scenarios the core
//! defends against.

use camino::Utf8PathBuf;
use safetar::error::ExtractError;
use safetar::policy::{HardlinkPolicy, Policy, SymlinkPolicy};
use tempfile::tempdir;

struct TarTestBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl TarTestBuilder {
    fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn add_file(mut self, path: &str, data: &[u8]) -> Self {
        self.add_file_with_mode(path, data, 0o644)
    }

    fn add_file_with_mode(mut self, path: &str, data: &[u8], mode: u32) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        self.builder.append_data(&mut header, path, data).unwrap();
        self
    }

    fn add_raw_path(mut self, raw_path: &str, data: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_path(raw_path).unwrap();
        header.set_cksum();
        self.builder.append(&header, data).unwrap();
        self
    }

    fn add_symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_link_name(target).unwrap();
        header.set_cksum();
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    fn add_hardlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Link);
        header.set_link_name(target).unwrap();
        header.set_cksum();
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    fn build(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

fn write_archive(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap();
    std::fs::write(path.as_std_path(), bytes).unwrap();
    path
}

#[test]
fn rejects_absolute_path_tarslip() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_raw_path("/etc/passwd", b"pwned")
        .build();
    let archive_path = write_archive(&dir, "evil.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();

    let err = safetar::extract(&archive_path, &dest, Policy::new(), None).unwrap_err();
    assert!(matches!(err, ExtractError::UnsafePath { .. }));
}

#[test]
fn rejects_parent_traversal_tarslip() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_raw_path("../../outside.txt", b"pwned")
        .build();
    let archive_path = write_archive(&dir, "evil.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();

    let err = safetar::extract(&archive_path, &dest, Policy::new(), None).unwrap_err();
    assert!(matches!(err, ExtractError::UnsafePath { .. }));
}

#[test]
fn extracts_well_formed_archive_and_strips_setuid() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_file("readme.txt", b"hello world")
        .add_file_with_mode("bin/tool", b"#!/bin/sh\necho hi\n", 0o4755)
        .build();
    let archive_path = write_archive(&dir, "good.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();

    let state = safetar::extract(&archive_path, &dest, Policy::new(), None).unwrap();
    assert_eq!(state.files_seen, 2);
    assert!(dest.join("readme.txt").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(dest.join("bin/tool").as_std_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o4000, 0, "setuid bit must be stripped");
    }
}

#[test]
fn symlink_escape_rejected_under_resolve_internal() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_symlink("link", "../../../outside")
        .build();
    let archive_path = write_archive(&dir, "escape.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_symlink_policy(SymlinkPolicy::ResolveInternal);

    let err = safetar::extract(&archive_path, &dest, policy, None).unwrap_err();
    assert!(matches!(err, ExtractError::LinkEscape { .. }));
}

#[test]
fn symlink_within_root_accepted_under_resolve_internal() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_file("real.txt", b"content")
        .add_symlink("alias.txt", "real.txt")
        .build();
    let archive_path = write_archive(&dir, "ok.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_symlink_policy(SymlinkPolicy::ResolveInternal);

    let state = safetar::extract(&archive_path, &dest, policy, None).unwrap();
    assert_eq!(state.files_seen, 2);
    assert!(dest.join("alias.txt").exists());
}

#[test]
fn hardlink_to_missing_target_rejected() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_hardlink("copy.txt", "never-present.txt")
        .build();
    let archive_path = write_archive(&dir, "dangling.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_hardlink_policy(HardlinkPolicy::Internal);

    let err = safetar::extract(&archive_path, &dest, policy, None).unwrap_err();
    assert!(matches!(err, ExtractError::LinkEscape { .. }));
}

#[test]
fn hardlink_to_committed_target_accepted_regardless_of_order() {
    let dir = tempdir().unwrap();
    // The hardlink member precedes its target in archive order; this must
    // still succeed because hardlinks are committed only after every
    // regular file has landed.
    let archive = TarTestBuilder::new()
        .add_hardlink("copy.txt", "original.txt")
        .add_file("original.txt", b"shared content")
        .build();
    let archive_path = write_archive(&dir, "ordered.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_hardlink_policy(HardlinkPolicy::Internal);

    let state = safetar::extract(&archive_path, &dest, policy, None).unwrap();
    assert_eq!(state.files_seen, 2);
    assert!(dest.join("copy.txt").exists());
}

#[test]
fn file_exceeding_max_file_size_rejected() {
    let dir = tempdir().unwrap();
    let payload = vec![b'x'; 4096];
    let archive = TarTestBuilder::new().add_file("big.bin", &payload).build();
    let archive_path = write_archive(&dir, "oversized.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_max_file_size(1024);

    let err = safetar::extract(&archive_path, &dest, policy, None).unwrap_err();
    assert!(matches!(err, ExtractError::FileTooLarge { .. }));
}

#[test]
fn file_count_budget_enforced() {
    let dir = tempdir().unwrap();
    let mut builder = TarTestBuilder::new();
    for i in 0..5 {
        builder = builder.add_file(&format!("f{i}.txt"), b"x");
    }
    let archive = builder.build();
    let archive_path = write_archive(&dir, "many.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_max_files(3);

    let err = safetar::extract(&archive_path, &dest, policy, None).unwrap_err();
    assert!(matches!(err, ExtractError::MaxFilesExceeded { .. }));
}

#[test]
fn ratio_bomb_rejected_once_warmup_threshold_passed() {
    let dir = tempdir().unwrap();
    // Two megabytes of zeros compress to a tiny gzip stream: well past the
    // 1 MiB ratio-warmup threshold and far beyond any sane ratio limit.
    let payload = vec![0u8; 2 * 1024 * 1024];
    let archive = TarTestBuilder::new().add_file("zeros.bin", &payload).build();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
    std::io::Write::write_all(&mut encoder, &archive).unwrap();
    let gz_bytes = encoder.finish().unwrap();

    let archive_path = write_archive(&dir, "bomb.tar.gz", &gz_bytes);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();
    let policy = Policy::new().with_max_ratio(10.0).with_max_total_size(u64::MAX);

    let err = safetar::extract(&archive_path, &dest, policy, None).unwrap_err();
    assert!(matches!(err, ExtractError::RatioExceeded { .. }));
}

#[test]
fn rollback_leaves_no_partial_output_on_rejection() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_file("ok.txt", b"fine")
        .add_raw_path("../escape.txt", b"bad")
        .build();
    let archive_path = write_archive(&dir, "mixed.tar", &archive);
    let dest = Utf8PathBuf::from_path_buf(dir.path().join("out")).unwrap();

    let result = safetar::extract(&archive_path, &dest, Policy::new(), None);
    assert!(result.is_err());
    assert!(!dest.join("ok.txt").exists(), "accepted member must be rolled back");
}

#[test]
fn names_lists_without_touching_filesystem() {
    let dir = tempdir().unwrap();
    let archive = TarTestBuilder::new()
        .add_file("a.txt", b"1")
        .add_file("dir/b.txt", b"2")
        .build();
    let archive_path = write_archive(&dir, "list.tar", &archive);

    let names = safetar::list(&archive_path, Policy::new()).unwrap();
    let rendered: Vec<String> = names.iter().map(|n| n.path.to_string()).collect();
    assert_eq!(rendered, vec!["a.txt".to_string(), "dir/b.txt".to_string()]);
}
