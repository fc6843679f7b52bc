//! The Sandbox: atomic, TOCTOU-resistant materialization of validated
//! members into a destination root, including deferred, order-dependent
//! link creation.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder as TempBuilder;
use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::event::{dispatch, EventCallback, SecurityEvent};
use crate::policy::MAX_LINK_CHAIN;

const CHUNK_SIZE: usize = 64 * 1024;

/// Mode applied to parent directories auto-created on the way to a file or
/// link that has no directory member of its own in the archive. `0o4000 |
/// 0o2000 | 0o1000` (setuid/setgid/sticky) is stripped the same way the
/// Guard strips it from declared directory modes, even though `0o755`
/// carries none of those bits to begin with.
const AUTO_DIR_MODE: u32 = 0o755 & !(0o4000 | 0o2000 | 0o1000);

/// Which primitive a deferred link was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symlink,
    Hardlink,
}

/// A symlink or hardlink staged for creation once every regular file has
/// landed, carrying the resolved relative destination and the raw relative
/// target exactly as declared in the archive.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub kind: LinkKind,
    pub dest_rel: Utf8PathBuf,
    pub raw_target: Utf8PathBuf,
    pub mtime: u32,
}

/// Materialization layer. One `Sandbox` per extraction; dropped without a
/// call to [`Sandbox::finish`] rolls back everything it staged.
pub struct Sandbox {
    root_canon: Utf8PathBuf,
    committed: Vec<Utf8PathBuf>,
    committed_files: HashSet<Utf8PathBuf>,
    finished: bool,
}

impl Sandbox {
    /// Resolve `destination` to an absolute, symlink-free canonical path
    /// and prepare it for writes.
    pub fn open(destination: &Utf8Path) -> Result<Self, ExtractError> {
        fs::create_dir_all(destination.as_std_path())?;
        let canonical = fs::canonicalize(destination.as_std_path())?;
        let root_canon = Utf8PathBuf::from_path_buf(canonical).map_err(|_| ExtractError::Sandbox {
            detail: "destination path is not valid UTF-8".to_string(),
        })?;
        Ok(Self {
            root_canon,
            committed: Vec::new(),
            committed_files: HashSet::new(),
            finished: false,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root_canon
    }

    /// Join `rel` onto the destination root and verify it cannot lexically
    /// escape it. `rel` must already be a Guard-canonicalized relative
    /// path, but this check is repeated here as the Sandbox's own
    /// authority — it never trusts an upstream verdict blindly.
    fn safe_join(&self, rel: &Utf8Path) -> Result<Utf8PathBuf, ExtractError> {
        if rel.is_absolute() {
            return Err(ExtractError::UnsafePath {
                path: rel.to_owned(),
                detail: "absolute relative-path passed to sandbox".to_string(),
            });
        }
        let joined = self.root_canon.join(rel);
        let cleaned_std = joined.as_std_path().to_path_buf();
        let cleaned = Utf8PathBuf::from_path_buf(
            path_clean::PathClean::clean(&cleaned_std),
        )
        .map_err(|_| ExtractError::UnsafePath {
            path: rel.to_owned(),
            detail: "path not valid UTF-8 after cleaning".to_string(),
        })?;
        if !cleaned.starts_with(&self.root_canon) {
            return Err(ExtractError::UnsafePath {
                path: rel.to_owned(),
                detail: "path escapes destination root".to_string(),
            });
        }
        Ok(cleaned)
    }

    /// Create a directory member (or a parent directory needed along the
    /// way to a file/link).
    pub fn stage_directory(&mut self, rel: &Utf8Path, mode: u32) -> Result<(), ExtractError> {
        let abs = self.safe_join(rel)?;
        fs::create_dir_all(abs.as_std_path())?;
        set_mode(&abs, mode);
        self.committed.push(abs);
        Ok(())
    }

    /// Create any missing intermediate directories on the way to `abs`,
    /// one path component at a time, applying `AUTO_DIR_MODE` to each one
    /// this call actually creates. A directory that already exists (e.g.
    /// one staged explicitly by [`Sandbox::stage_directory`] with its own
    /// declared mode) is left untouched.
    fn ensure_parent(&self, abs: &Utf8Path) -> Result<(), ExtractError> {
        let Some(parent) = abs.parent() else {
            return Ok(());
        };
        let relative = parent.strip_prefix(&self.root_canon).unwrap_or(parent);

        let mut built = self.root_canon.clone();
        for component in relative.components() {
            built.push(component.as_str());
            if !built.as_std_path().exists() {
                fs::create_dir(built.as_std_path())?;
                set_mode(&built, AUTO_DIR_MODE);
            }
        }
        Ok(())
    }

    /// Stream `reader`'s payload into a temp file beside the final
    /// destination, then atomically rename it into place. `on_chunk` is
    /// invoked after every chunk with the running total so the Streamer
    /// can re-check its live budgets (I1-I3) without the Sandbox knowing
    /// about policy at all.
    pub fn stage_regular<R, F>(
        &mut self,
        rel: &Utf8Path,
        mode: u32,
        mtime: u32,
        reader: &mut R,
        mut on_chunk: F,
    ) -> Result<u64, ExtractError>
    where
        R: Read,
        F: FnMut(u64) -> Result<(), ExtractError>,
    {
        let abs = self.safe_join(rel)?;
        self.ensure_parent(&abs)?;
        reject_existing_symlink(&abs)?;
        if abs.as_std_path().is_dir() {
            return Err(ExtractError::Sandbox {
                detail: format!("refusing to replace directory at {abs}"),
            });
        }

        let parent = abs.parent().unwrap_or(&self.root_canon);
        let mut temp = TempBuilder::new()
            .prefix(".safetar-tmp-")
            .tempfile_in(parent.as_std_path())
            .map_err(|e| ExtractError::AtomicWrite {
                path: abs.clone(),
                source: e,
            })?;

        let mut total = 0u64;
        let mut buf = [0u8; CHUNK_SIZE];
        let result = (|| -> Result<(), ExtractError> {
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                temp.write_all(&buf[..n]).map_err(|e| ExtractError::AtomicWrite {
                    path: abs.clone(),
                    source: e,
                })?;
                total += n as u64;
                on_chunk(total)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            // TempPath's Drop removes the file; nothing else to clean up.
            return Err(err);
        }

        temp.flush().map_err(|e| ExtractError::AtomicWrite {
            path: abs.clone(),
            source: e,
        })?;
        set_mode_file(temp.as_file(), mode);
        temp.persist(abs.as_std_path()).map_err(|e| ExtractError::AtomicWrite {
            path: abs.clone(),
            source: e.error,
        })?;
        set_mtime(&abs, mtime);

        self.committed.push(abs.clone());
        self.committed_files.insert(abs);
        Ok(total)
    }

    /// Create every deferred link: hardlinks in archive-declaration order,
    /// then symlinks in archive-declaration order, each re-verified
    /// against the now-closed set of committed files.
    pub fn commit_links(
        &mut self,
        links: &[LinkSpec],
        archive_hash: &str,
        on_event: &mut Option<EventCallback<'_>>,
    ) -> Result<(), ExtractError> {
        let (hardlinks, symlinks): (Vec<_>, Vec<_>) =
            links.iter().partition(|l| l.kind == LinkKind::Hardlink);

        for spec in hardlinks {
            self.commit_hardlink(spec, archive_hash, on_event)?;
        }
        for spec in symlinks {
            self.commit_symlink(spec)?;
        }
        Ok(())
    }

    fn commit_hardlink(
        &mut self,
        spec: &LinkSpec,
        archive_hash: &str,
        on_event: &mut Option<EventCallback<'_>>,
    ) -> Result<(), ExtractError> {
        let dest_abs = self.safe_join(&spec.dest_rel)?;
        let target_abs = self.safe_join(&spec.raw_target)?;

        if !self.committed_files.contains(&target_abs) {
            return Err(ExtractError::LinkEscape {
                path: spec.dest_rel.clone(),
                target: spec.raw_target.clone(),
                detail: "hardlink target is a forward reference or not a committed file".to_string(),
            });
        }
        match fs::metadata(target_abs.as_std_path()) {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(ExtractError::LinkEscape {
                    path: spec.dest_rel.clone(),
                    target: spec.raw_target.clone(),
                    detail: "hardlink target does not exist or is not a regular file".to_string(),
                })
            }
        }

        self.ensure_parent(&dest_abs)?;
        reject_existing_symlink(&dest_abs)?;

        match fs::hard_link(target_abs.as_std_path(), dest_abs.as_std_path()) {
            Ok(()) => {
                self.committed.push(dest_abs.clone());
                self.committed_files.insert(dest_abs);
                Ok(())
            }
            Err(_) => {
                // Filesystem does not support hardlinks (e.g. cross-device):
                // fall back to a content copy and record the fact.
                fs::copy(target_abs.as_std_path(), dest_abs.as_std_path())?;
                set_mtime(&dest_abs, spec.mtime);
                self.committed.push(dest_abs.clone());
                self.committed_files.insert(dest_abs);
                debug!(target: "safetar::sandbox", dest = %spec.dest_rel, "hardlink fallback to copy");
                dispatch(
                    on_event,
                    &SecurityEvent::note(
                        archive_hash,
                        "HardlinkFallback",
                        Some(&spec.dest_rel),
                        Default::default(),
                    ),
                );
                Ok(())
            }
        }
    }

    fn commit_symlink(&mut self, spec: &LinkSpec) -> Result<(), ExtractError> {
        let dest_abs = self.safe_join(&spec.dest_rel)?;
        self.ensure_parent(&dest_abs)?;

        if dest_abs.as_std_path().exists() || fs::symlink_metadata(dest_abs.as_std_path()).is_ok() {
            return Err(ExtractError::Sandbox {
                detail: format!("refusing to overwrite existing path at {dest_abs}"),
            });
        }

        let parent = dest_abs.parent().unwrap_or(&self.root_canon).to_owned();
        let resolved = self
            .resolve_within_root(&parent, &spec.raw_target)
            .map_err(|detail| ExtractError::LinkEscape {
                path: spec.dest_rel.clone(),
                target: spec.raw_target.clone(),
                detail,
            })?;
        if !resolved.starts_with(&self.root_canon) {
            return Err(ExtractError::LinkEscape {
                path: spec.dest_rel.clone(),
                target: spec.raw_target.clone(),
                detail: "symlink resolves outside destination root".to_string(),
            });
        }

        create_symlink(&spec.raw_target, &dest_abs).map_err(|e| ExtractError::AtomicWrite {
            path: dest_abs.clone(),
            source: e,
        })?;

        // Re-read and re-validate: defends against a race between the
        // check above and the symlink() call actually landing.
        let reread = fs::read_link(dest_abs.as_std_path());
        let still_safe = reread
            .ok()
            .and_then(|t| Utf8PathBuf::from_path_buf(t).ok())
            .map(|t| {
                self.resolve_within_root(&parent, &t)
                    .map(|r| r.starts_with(&self.root_canon))
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !still_safe {
            let _ = fs::remove_file(dest_abs.as_std_path());
            return Err(ExtractError::LinkEscape {
                path: spec.dest_rel.clone(),
                target: spec.raw_target.clone(),
                detail: "post-creation re-validation failed".to_string(),
            });
        }

        self.committed.push(dest_abs);
        Ok(())
    }

    /// Lexically resolve `target` relative to `parent`, following any
    /// filesystem symlinks already materialized along the way, bounded by
    /// [`MAX_LINK_CHAIN`] hops to defeat cycles.
    fn resolve_within_root(&self, parent: &Utf8Path, target: &Utf8Path) -> Result<Utf8PathBuf, String> {
        let start = if target.is_absolute() {
            target.to_owned()
        } else {
            parent.join(target)
        };

        let mut queue: VecDeque<String> = start
            .components()
            .map(|c| c.as_str().to_string())
            .collect();
        let mut resolved = Utf8PathBuf::new();
        let mut hops = 0usize;

        while let Some(comp) = queue.pop_front() {
            match comp.as_str() {
                "/" => {
                    resolved = Utf8PathBuf::from("/");
                }
                "." | "" => continue,
                ".." => {
                    resolved.pop();
                }
                _ => {
                    resolved.push(&comp);
                    if let Ok(meta) = fs::symlink_metadata(resolved.as_std_path()) {
                        if meta.file_type().is_symlink() {
                            hops += 1;
                            if hops > MAX_LINK_CHAIN {
                                return Err("symlink chain too long".to_string());
                            }
                            let link_target = fs::read_link(resolved.as_std_path())
                                .map_err(|e| e.to_string())?;
                            let link_target = Utf8PathBuf::from_path_buf(link_target)
                                .map_err(|_| "symlink target not valid UTF-8".to_string())?;
                            resolved.pop();
                            let rest: Vec<String> = if link_target.is_absolute() {
                                link_target.components().map(|c| c.as_str().to_string()).collect()
                            } else {
                                let mut v: Vec<String> = resolved
                                    .components()
                                    .map(|c| c.as_str().to_string())
                                    .collect();
                                v.extend(link_target.components().map(|c| c.as_str().to_string()));
                                v
                            };
                            resolved = Utf8PathBuf::new();
                            for seg in rest.into_iter().rev() {
                                queue.push_front(seg);
                            }
                        }
                    }
                }
            }
        }

        if !resolved.starts_with(&self.root_canon) {
            return Err(format!("resolved path {resolved} escapes destination root"));
        }
        Ok(resolved)
    }

    /// Mark this extraction as successfully complete; nothing will be
    /// rolled back on drop after this call.
    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for path in self.committed.iter().rev() {
            let meta = fs::symlink_metadata(path.as_std_path());
            match meta {
                Ok(m) if m.is_dir() => {
                    let _ = fs::remove_dir(path.as_std_path());
                }
                Ok(_) => {
                    let _ = fs::remove_file(path.as_std_path());
                }
                Err(_) => {}
            }
        }
        if !self.committed.is_empty() {
            warn!(target: "safetar::sandbox", count = self.committed.len(), "rolled back incomplete extraction");
        }
    }
}

fn reject_existing_symlink(abs: &Utf8Path) -> Result<(), ExtractError> {
    if let Ok(meta) = fs::symlink_metadata(abs.as_std_path()) {
        if meta.file_type().is_symlink() {
            return Err(ExtractError::Sandbox {
                detail: format!("refusing to write through existing symlink at {abs}"),
            });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(abs: &Utf8Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(abs.as_std_path(), fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_abs: &Utf8Path, _mode: u32) {}

#[cfg(unix)]
fn set_mode_file(file: &std::fs::File, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode_file(_file: &std::fs::File, _mode: u32) {}

fn set_mtime(abs: &Utf8Path, mtime: u32) {
    let when = filetime::FileTime::from_unix_time(mtime as i64, 0);
    let _ = filetime::set_file_mtime(abs.as_std_path(), when);
}

#[cfg(unix)]
fn create_symlink(target: &Utf8Path, dest: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target.as_std_path(), dest.as_std_path())
}

#[cfg(not(unix))]
fn create_symlink(_target: &Utf8Path, _dest: &Utf8Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stage_regular_is_atomic_and_visible_after_rename() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut sandbox = Sandbox::open(&root).unwrap();
        let mut data: &[u8] = b"hello world";
        let written = sandbox
            .stage_regular(Utf8Path::new("a/b.txt"), 0o644, 0, &mut data, |_| Ok(()))
            .unwrap();
        assert_eq!(written, 11);
        assert!(root.join("a/b.txt").exists());
        sandbox.finish();
    }

    #[test]
    fn rollback_removes_staged_files_on_drop() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path;
        {
            let mut sandbox = Sandbox::open(&root).unwrap();
            let mut data: &[u8] = b"transient";
            sandbox
                .stage_regular(Utf8Path::new("gone.txt"), 0o644, 0, &mut data, |_| Ok(()))
                .unwrap();
            path = root.join("gone.txt");
            assert!(path.exists());
            // sandbox dropped here without finish()
        }
        assert!(!path.exists());
    }

    #[test]
    fn rejects_path_escaping_root() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let sandbox = Sandbox::open(&root).unwrap();
        let err = sandbox.safe_join(Utf8Path::new("../escape")).unwrap_err();
        assert!(matches!(err, ExtractError::UnsafePath { .. }));
    }

    #[test]
    fn hardlink_forward_reference_rejected() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut sandbox = Sandbox::open(&root).unwrap();
        let spec = LinkSpec {
            kind: LinkKind::Hardlink,
            dest_rel: Utf8PathBuf::from("b"),
            raw_target: Utf8PathBuf::from("c"),
            mtime: 0,
        };
        let mut cb: Option<EventCallback<'_>> = None;
        let err = sandbox.commit_hardlink(&spec, "deadbeef", &mut cb).unwrap_err();
        assert!(matches!(err, ExtractError::LinkEscape { .. }));
        sandbox.finish();
    }
}
