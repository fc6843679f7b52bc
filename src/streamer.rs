//! The Streamer: drives the underlying archive reader member by member,
//! enforces the live size/ratio/count budgets against the untrusted byte
//! stream (never against header-declared sizes), and hands validated
//! payload to the Sandbox.

use std::fs::File;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::{info, instrument, warn};

use crate::archive::header::member_header;
use crate::archive::transport::{self, ByteCounter, CountingReader};
use crate::error::ExtractError;
use crate::event::{dispatch, EventCallback, SecurityEvent};
use crate::guard::{clamp_detail, Guard, MemberType, Verdict};
use crate::policy::{Policy, RATIO_WARMUP_BYTES};
use crate::sandbox::{LinkKind, LinkSpec, Sandbox};

/// Mutable bookkeeping owned by the Streamer for the lifetime of one
/// extraction. Created on open, torn down on close.
#[derive(Debug, Default)]
pub struct ExtractionState {
    pub files_seen: u32,
    pub bytes_written: u64,
    pub compressed_bytes_read: u64,
    pub archive_hash: String,
    pub deferred_links: Vec<LinkSpec>,
    /// Relative paths of every regular file actually written, in archive
    /// order. Consulted only by the Nesting Controller to find candidate
    /// sub-archives; not part of the invariants in spec.md §3.
    pub extracted_regular_files: Vec<Utf8PathBuf>,
}

/// Running totals an extraction inherits from whatever enclosing extraction
/// invoked it. The top-level call uses [`BudgetBaseline::default`] (all
/// zero); a nested call seeds this from the outer [`ExtractionState`] so
/// live budget checks see the true cumulative totals across nesting levels,
/// not just the bytes this one sub-archive happens to contain.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetBaseline {
    pub files_seen: u32,
    pub bytes_written: u64,
    pub compressed_bytes_read: u64,
}

/// A single accepted member name, as returned by [`ExtractSession::names`].
#[derive(Debug, Clone)]
pub struct CanonicalName {
    pub path: Utf8PathBuf,
    pub member_type: MemberType,
}

/// A cancellation signal the caller may flip between chunks.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for std::sync::atomic::AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// A no-op cancellation token for callers that never cancel.
pub struct NeverCancel;
impl Cancellation for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// An opened archive, not yet extracted. Constructing one never touches
/// the destination filesystem.
pub struct ExtractSession {
    file_path: Utf8PathBuf,
    policy: Policy,
    archive_hash: String,
}

impl ExtractSession {
    /// Open `source` under `policy`. Computes the archive-hash correlation
    /// token from the first 64 KiB and validates the policy, but performs
    /// no extraction.
    pub fn open(source: &Utf8Path, policy: Policy) -> Result<Self, ExtractError> {
        policy.validate()?;
        let mut file = File::open(source.as_std_path()).map_err(|e| ExtractError::ArchiveOpen {
            detail: format!("{source}: {e}"),
        })?;
        let archive_hash = hash_prefix(&mut file)?;
        Ok(Self {
            file_path: source.to_owned(),
            policy,
            archive_hash,
        })
    }

    /// Iterate headers only, applying the Guard, and return the canonical
    /// names of every member that would be accepted. Does not touch the
    /// destination.
    pub fn names(&self) -> Result<Vec<CanonicalName>, ExtractError> {
        let file = File::open(self.file_path.as_std_path()).map_err(|e| ExtractError::ArchiveOpen {
            detail: e.to_string(),
        })?;
        let decoded = open_transport(file)?;
        let mut archive = Archive::new(decoded);
        let guard = Guard::new();
        let mut out = Vec::new();
        for entry in archive
            .entries()
            .map_err(|e| ExtractError::MalformedArchive { detail: e.to_string() })?
        {
            let mut entry = entry.map_err(|e| ExtractError::MalformedArchive { detail: e.to_string() })?;
            let header = member_header(&mut entry)?;
            if let Verdict::Accept(resolved) = guard.check(&header, &self.policy) {
                out.push(CanonicalName {
                    path: resolved.rel_path,
                    member_type: resolved.member_type,
                });
            }
        }
        Ok(out)
    }

    /// Run the full pipeline: validate, stream payload under live budgets,
    /// materialize into `destination`, and commit deferred links.
    ///
    /// `baseline` seeds the live counters `check_budgets` enforces against:
    /// a nested extraction passes the outer extraction's running totals so
    /// that a bomb split across nesting levels still trips the same budgets
    /// a single flat archive would.
    #[instrument(skip(self, on_event, cancel), fields(archive_hash = %self.archive_hash))]
    pub fn extract_all(
        &self,
        destination: &Utf8Path,
        baseline: BudgetBaseline,
        mut on_event: Option<EventCallback<'_>>,
        cancel: &dyn Cancellation,
    ) -> Result<ExtractionState, ExtractError> {
        let file = File::open(self.file_path.as_std_path()).map_err(|e| ExtractError::ArchiveOpen {
            detail: e.to_string(),
        })?;
        let counter = ByteCounter::new();
        let counting = CountingReader::new(file, counter.clone());
        let decoded = open_transport(counting)?;
        let mut archive = Archive::new(decoded);

        let mut sandbox = Sandbox::open(destination)?;
        let guard = Guard::new();
        let mut state = ExtractionState {
            archive_hash: self.archive_hash.clone(),
            files_seen: baseline.files_seen,
            bytes_written: baseline.bytes_written,
            ..Default::default()
        };
        let compressed_baseline = baseline.compressed_bytes_read;

        let run = (|| -> Result<(), ExtractError> {
            for entry in archive
                .entries()
                .map_err(|e| ExtractError::MalformedArchive { detail: e.to_string() })?
            {
                if cancel.is_cancelled() {
                    return Err(ExtractError::Cancelled);
                }
                let mut entry = entry.map_err(|e| ExtractError::MalformedArchive { detail: e.to_string() })?;
                let header = member_header(&mut entry)?;
                let original_mode = header.mode;

                match guard.check(&header, &self.policy) {
                    Verdict::Reject(err) => {
                        dispatch(&mut on_event, &SecurityEvent::from_error(&state.archive_hash, &err));
                        return Err(err);
                    }
                    Verdict::Skip(reason) => {
                        dispatch(
                            &mut on_event,
                            &SecurityEvent::note(
                                &state.archive_hash,
                                "Skip",
                                Some(&Utf8PathBuf::from(header.name.clone())),
                                [("reason".to_string(), reason.to_string())].into(),
                            ),
                        );
                        continue;
                    }
                    Verdict::Accept(resolved) => {
                        state.files_seen += 1;
                        if state.files_seen > self.policy.max_files {
                            let err = ExtractError::MaxFilesExceeded {
                                limit: self.policy.max_files,
                                actual: state.files_seen,
                            };
                            dispatch(&mut on_event, &SecurityEvent::from_error(&state.archive_hash, &err));
                            return Err(err);
                        }

                        if let Some(detail) = clamp_detail(original_mode, &resolved) {
                            dispatch(
                                &mut on_event,
                                &SecurityEvent::note(
                                    &state.archive_hash,
                                    "SpecialBitsClamped",
                                    Some(&resolved.rel_path),
                                    detail,
                                ),
                            );
                        }

                        match resolved.member_type {
                            MemberType::Dir => {
                                sandbox.stage_directory(&resolved.rel_path, resolved.mode)?;
                            }
                            MemberType::Reg => {
                                let max_file_size = self.policy.max_file_size;
                                let max_total_size = self.policy.max_total_size;
                                let max_ratio = self.policy.max_ratio;
                                let compressed = counter.clone();
                                let bytes_before = state.bytes_written;
                                let member_path = resolved.rel_path.clone();
                                let written = sandbox.stage_regular(
                                    &resolved.rel_path,
                                    resolved.mode,
                                    resolved.mtime,
                                    &mut entry,
                                    |running_total| {
                                        let total_written = bytes_before + running_total;
                                        check_budgets(
                                            &member_path,
                                            running_total,
                                            total_written,
                                            compressed_baseline + compressed.get(),
                                            max_file_size,
                                            max_total_size,
                                            max_ratio,
                                        )
                                    },
                                )?;
                                state.bytes_written += written;
                                state.extracted_regular_files.push(resolved.rel_path);
                            }
                            MemberType::Symlink => {
                                let target = resolved.link_target.ok_or_else(|| ExtractError::MalformedArchive {
                                    detail: "symlink member missing target".to_string(),
                                })?;
                                state.deferred_links.push(LinkSpec {
                                    kind: LinkKind::Symlink,
                                    dest_rel: resolved.rel_path,
                                    raw_target: target,
                                    mtime: resolved.mtime,
                                });
                            }
                            MemberType::Hardlink => {
                                let target = resolved.link_target.ok_or_else(|| ExtractError::MalformedArchive {
                                    detail: "hardlink member missing target".to_string(),
                                })?;
                                state.deferred_links.push(LinkSpec {
                                    kind: LinkKind::Hardlink,
                                    dest_rel: resolved.rel_path,
                                    raw_target: target,
                                    mtime: resolved.mtime,
                                });
                            }
                            _ => unreachable!("Guard never accepts other member types"),
                        }
                    }
                }
            }

            state.compressed_bytes_read = compressed_baseline + counter.get();
            sandbox
                .commit_links(&state.deferred_links, &state.archive_hash, &mut on_event)
                .map_err(|err| {
                    dispatch(&mut on_event, &SecurityEvent::from_error(&state.archive_hash, &err));
                    err
                })?;
            Ok(())
        })();

        match run {
            Ok(()) => {
                info!(target: "safetar::streamer", files = state.files_seen, bytes = state.bytes_written, "extraction committed");
                sandbox.finish();
                Ok(state)
            }
            Err(err) => {
                warn!(target: "safetar::streamer", error = %err, "extraction aborted, rolling back");
                drop(sandbox);
                Err(err)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn check_budgets(
    member_path: &Utf8Path,
    chunk_total_for_member: u64,
    total_written: u64,
    compressed_bytes_read: u64,
    max_file_size: u64,
    max_total_size: u64,
    max_ratio: f64,
) -> Result<(), ExtractError> {
    if chunk_total_for_member > max_file_size {
        return Err(ExtractError::FileTooLarge {
            path: member_path.to_owned(),
            limit: max_file_size,
            actual: chunk_total_for_member,
        });
    }
    if total_written > max_total_size {
        return Err(ExtractError::TotalSizeExceeded {
            limit: max_total_size,
            actual: total_written,
        });
    }
    if total_written >= RATIO_WARMUP_BYTES && compressed_bytes_read > 0 {
        let ratio = total_written as f64 / compressed_bytes_read as f64;
        if ratio > max_ratio {
            return Err(ExtractError::RatioExceeded {
                limit: max_ratio,
                observed: ratio,
            });
        }
    }
    Ok(())
}

fn open_transport<R: Read + 'static>(reader: R) -> Result<transport::DecodedReader, ExtractError> {
    transport::open(reader)
}

fn hash_prefix(file: &mut File) -> Result<String, ExtractError> {
    use std::io::{Seek, SeekFrom};
    let mut buf = vec![0u8; 64 * 1024];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_warmup_guard_ignores_tiny_archives() {
        let path = Utf8PathBuf::from("f");
        let result = check_budgets(&path, 100, 100, 1, u64::MAX, u64::MAX, 1.0);
        assert!(result.is_ok());
    }

    #[test]
    fn ratio_exceeded_after_warmup() {
        let path = Utf8PathBuf::from("f");
        let result = check_budgets(
            &path,
            RATIO_WARMUP_BYTES,
            RATIO_WARMUP_BYTES,
            1,
            u64::MAX,
            u64::MAX,
            10.0,
        );
        assert!(matches!(result, Err(ExtractError::RatioExceeded { .. })));
    }

    #[test]
    fn file_too_large_trips_before_total() {
        let path = Utf8PathBuf::from("f");
        let result = check_budgets(&path, 200, 200, 1, 100, u64::MAX, 1000.0);
        assert!(matches!(result, Err(ExtractError::FileTooLarge { .. })));
    }
}
