//! The Guard: a stateless per-member validator. Given one [`MemberHeader`]
//! and a [`Policy`], it decides accept/reject/skip and, on acceptance,
//! produces a normalized [`ResolvedMember`]. The Guard never touches the
//! filesystem — all checks here are lexical.

use std::collections::BTreeMap;

use bstr::BString;
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use path_clean::PathClean;
use unicode_normalization::UnicodeNormalization;

use crate::error::ExtractError;
use crate::policy::{Policy, SparsePolicy, SymlinkPolicy};

/// The archive member type, a strong tag the Guard dispatches on. Every
/// member carries one of these instead of the dynamically-typed mode bits
/// the underlying format uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Reg,
    Dir,
    Symlink,
    Hardlink,
    CharDev,
    BlockDev,
    Fifo,
    Sparse,
    Unknown,
}

/// Raw input to the Guard, extracted from the archive reader before any
/// validation. `name` is already resolved for GNU long-name continuation
/// and PAX `path` overrides by the underlying `tar` crate.
#[derive(Debug, Clone)]
pub struct MemberHeader {
    pub raw_name: BString,
    pub name: String,
    pub member_type: MemberType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub link_target: Option<String>,
    pub pax_size: Option<u64>,
}

/// The Guard's output on acceptance: a canonical relative path and
/// sanitized metadata, ready for the Sandbox to materialize.
#[derive(Debug, Clone)]
pub struct ResolvedMember {
    pub rel_path: Utf8PathBuf,
    pub member_type: MemberType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub link_target: Option<Utf8PathBuf>,
}

/// The Guard's verdict for one member.
#[derive(Debug)]
pub enum Verdict {
    Accept(ResolvedMember),
    Reject(ExtractError),
    Skip(&'static str),
}

const SETUID: u32 = 0o4000;
const SETGID: u32 = 0o2000;
const STICKY: u32 = 0o1000;
const SPECIAL_BITS: u32 = SETUID | SETGID | STICKY;

/// Stateless per-member validator. Holds no mutable state across calls.
#[derive(Debug, Default)]
pub struct Guard;

impl Guard {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate one member under `policy`.
    pub fn check(&self, header: &MemberHeader, policy: &Policy) -> Verdict {
        if let Err(err) = check_size_sanity(header, policy) {
            return Verdict::Reject(err);
        }

        let canonical = match canonicalize_name(&header.name) {
            Ok(path) => path,
            Err(detail) => {
                return Verdict::Reject(ExtractError::UnsafePath {
                    path: Utf8PathBuf::from(header.name.clone()),
                    detail,
                })
            }
        };

        let effective_type = match classify(header, policy) {
            Ok(t) => t,
            Err(verdict) => return verdict,
        };

        let link_target = match &header.link_target {
            Some(raw) => match sanitize_link_target(raw) {
                Ok(t) => Some(t),
                Err(detail) => {
                    return Verdict::Reject(ExtractError::LinkEscape {
                        path: canonical,
                        target: Utf8PathBuf::from(raw.clone()),
                        detail,
                    })
                }
            },
            None => None,
        };

        let mut mode = header.mode;
        if policy.strip_special_bits {
            mode &= !SPECIAL_BITS;
        }

        let (uid, gid) = if policy.preserve_ownership {
            (header.uid, header.gid)
        } else {
            current_effective_ids()
        };

        let mtime = if policy.clamp_timestamps {
            clamp_mtime(header.mtime)
        } else {
            header.mtime.max(0) as u32
        };

        Verdict::Accept(ResolvedMember {
            rel_path: canonical,
            member_type: effective_type,
            size: header.size,
            mode,
            uid,
            gid,
            mtime,
            link_target,
        })
    }
}

fn check_size_sanity(header: &MemberHeader, policy: &Policy) -> Result<(), ExtractError> {
    let declared = header.pax_size.unwrap_or(header.size);
    if declared >= (1u64 << 63) {
        return Err(ExtractError::UnsafePath {
            path: Utf8PathBuf::from(header.name.clone()),
            detail: "declared size exceeds 2^63".to_string(),
        });
    }
    if matches!(header.member_type, MemberType::Reg | MemberType::Sparse) && declared > policy.max_file_size {
        return Err(ExtractError::FileTooLarge {
            path: Utf8PathBuf::from(header.name.clone()),
            limit: policy.max_file_size,
            actual: declared,
        });
    }
    Ok(())
}

fn classify(header: &MemberHeader, policy: &Policy) -> Result<MemberType, Verdict> {
    match header.member_type {
        MemberType::CharDev | MemberType::BlockDev | MemberType::Fifo | MemberType::Unknown => {
            Err(Verdict::Reject(ExtractError::ForbiddenType {
                path: Utf8PathBuf::from(header.name.clone()),
                detail: format!("{:?} members are never accepted", header.member_type),
            }))
        }
        MemberType::Sparse => match policy.sparse_policy {
            SparsePolicy::Reject => Err(Verdict::Reject(ExtractError::SparsePolicy {
                path: Utf8PathBuf::from(header.name.clone()),
            })),
            SparsePolicy::Materialise => Ok(MemberType::Reg),
        },
        MemberType::Symlink => match policy.symlink_policy {
            SymlinkPolicy::Reject => Err(Verdict::Reject(ExtractError::SymlinkPolicy {
                path: Utf8PathBuf::from(header.name.clone()),
            })),
            SymlinkPolicy::Ignore => Err(Verdict::Skip("symlink ignored by policy")),
            SymlinkPolicy::ResolveInternal => Ok(MemberType::Symlink),
        },
        MemberType::Hardlink => match policy.hardlink_policy {
            crate::policy::HardlinkPolicy::Reject => {
                Err(Verdict::Reject(ExtractError::HardlinkPolicy {
                    path: Utf8PathBuf::from(header.name.clone()),
                }))
            }
            crate::policy::HardlinkPolicy::Internal => Ok(MemberType::Hardlink),
        },
        other => Ok(other),
    }
}

/// Lexically canonicalize a decoded member name relative to the notional
/// extraction root, without touching the filesystem. Rejects NUL bytes,
/// absolute paths, drive-letter prefixes, `..` components, and any name
/// that would lexically escape the root.
fn canonicalize_name(name: &str) -> Result<Utf8PathBuf, String> {
    if name.contains('\0') {
        return Err("name contains a NUL byte".to_string());
    }
    if name.is_empty() {
        return Err("name is empty".to_string());
    }

    let normalized: String = name.nfc().collect();
    if normalized.contains('\\') {
        return Err("name contains a backslash path separator".to_string());
    }
    let path = Utf8Path::new(&normalized);

    if path.is_absolute() {
        return Err("absolute paths are rejected".to_string());
    }
    if has_drive_prefix(&normalized) {
        return Err("drive-letter-prefixed paths are rejected".to_string());
    }

    for component in path.components() {
        if matches!(component, Utf8Component::ParentDir) {
            return Err("`..` components are rejected".to_string());
        }
    }

    let cleaned_std = path.as_std_path().to_path_buf().clean();
    let cleaned = Utf8PathBuf::from_path_buf(cleaned_std)
        .map_err(|_| "path is not valid UTF-8 after cleaning".to_string())?;

    if cleaned
        .components()
        .next()
        .map(|c| matches!(c, Utf8Component::ParentDir))
        .unwrap_or(false)
    {
        return Err("path escapes the destination root".to_string());
    }
    if cleaned.is_absolute() {
        return Err("path escapes the destination root".to_string());
    }

    Ok(cleaned)
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Sanitize a raw link target the same way a member name is canonicalized,
/// but allow it to resolve relative to the link's own parent rather than
/// the archive root — actual root-escape enforcement happens again,
/// against the real filesystem, at commit time in the Sandbox.
fn sanitize_link_target(raw: &str) -> Result<Utf8PathBuf, String> {
    if raw.contains('\0') {
        return Err("link target contains a NUL byte".to_string());
    }
    if raw.is_empty() {
        return Err("link target is empty".to_string());
    }
    Ok(Utf8PathBuf::from(raw.replace('\\', "/")))
}

fn clamp_mtime(mtime: i64) -> u32 {
    if mtime < 0 {
        0
    } else if mtime > u32::MAX as i64 {
        u32::MAX
    } else {
        mtime as u32
    }
}

#[cfg(unix)]
fn current_effective_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid take no arguments and cannot fail.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

#[cfg(not(unix))]
fn current_effective_ids() -> (u32, u32) {
    (0, 0)
}

/// Build a `SecurityEvent` detail map summarizing a permission clamp, for
/// informational events emitted alongside an `Accept` verdict.
#[must_use]
pub fn clamp_detail(original_mode: u32, resolved: &ResolvedMember) -> Option<BTreeMap<String, String>> {
    if original_mode & SPECIAL_BITS == resolved.mode & SPECIAL_BITS {
        return None;
    }
    let mut detail = BTreeMap::new();
    detail.insert("original_mode".to_string(), format!("{original_mode:o}"));
    detail.insert("resolved_mode".to_string(), format!("{:o}", resolved.mode));
    Some(detail)
}
