//! Structured error kinds for the extraction core.
//!
//! Every variant here is one of the error kinds produced by the extraction
//! pipeline: a tag, not a type hierarchy, each carrying enough detail
//! (member path, limit, observed value) for a caller to act on it without
//! re-deriving context from a string.

use std::collections::BTreeMap;
use std::io;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Represents a user input error (invalid flags, missing paths, etc.), used
/// only by the CLI glue layer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UserInputError(pub String);

impl UserInputError {
    /// Convenience constructor.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Structured detail attached to an [`ExtractError`], mirroring the
/// `detail: map<string,string>` carried by `SecurityEvent`.
pub type DetailMap = BTreeMap<String, String>;

/// All fatal error kinds the extraction core can surface.
///
/// Every variant is fatal to the extraction in progress: the caller sees it
/// exactly once, and the [`crate::sandbox::Sandbox`] has already rolled
/// back anything it staged before propagating it.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsafe path {path}: {detail}")]
    UnsafePath { path: Utf8PathBuf, detail: String },

    #[error("forbidden member type for {path}: {detail}")]
    ForbiddenType { path: Utf8PathBuf, detail: String },

    #[error("file too large: {path} ({actual} bytes > limit {limit})")]
    FileTooLarge {
        path: Utf8PathBuf,
        limit: u64,
        actual: u64,
    },

    #[error("total extracted size exceeded (limit {limit}, actual {actual})")]
    TotalSizeExceeded { limit: u64, actual: u64 },

    #[error("file count exceeded (limit {limit}, actual {actual})")]
    MaxFilesExceeded { limit: u32, actual: u32 },

    #[error("decompression ratio exceeded (limit {limit}, observed {observed:.2})")]
    RatioExceeded { limit: f64, observed: f64 },

    #[error("symlink rejected by policy: {path}")]
    SymlinkPolicy { path: Utf8PathBuf },

    #[error("hardlink rejected by policy: {path}")]
    HardlinkPolicy { path: Utf8PathBuf },

    #[error("sparse member rejected by policy: {path}")]
    SparsePolicy { path: Utf8PathBuf },

    #[error("link escape: {path} -> {target} ({detail})")]
    LinkEscape {
        path: Utf8PathBuf,
        target: Utf8PathBuf,
        detail: String,
    },

    #[error("atomic write failed for {path}: {source}")]
    AtomicWrite {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sandbox failure: {detail}")]
    Sandbox { detail: String },

    #[error("unsupported archive transport")]
    UnsupportedFormat,

    #[error("failed to open archive: {detail}")]
    ArchiveOpen { detail: String },

    #[error("malformed archive: {detail}")]
    MalformedArchive { detail: String },

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error("extraction cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExtractError {
    /// A short tag identifying the error kind, used as the `event_type` of
    /// the `SecurityEvent` this error produces.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::UnsafePath { .. } => "UnsafePathError",
            Self::ForbiddenType { .. } => "ForbiddenTypeError",
            Self::FileTooLarge { .. } => "FileTooLargeError",
            Self::TotalSizeExceeded { .. } => "TotalSizeExceededError",
            Self::MaxFilesExceeded { .. } => "MaxFilesExceededError",
            Self::RatioExceeded { .. } => "RatioExceededError",
            Self::SymlinkPolicy { .. } => "SymlinkPolicyError",
            Self::HardlinkPolicy { .. } => "HardlinkPolicyError",
            Self::SparsePolicy { .. } => "SparsePolicyError",
            Self::LinkEscape { .. } => "LinkEscapeError",
            Self::AtomicWrite { .. } => "AtomicWriteError",
            Self::Sandbox { .. } => "SandboxError",
            Self::UnsupportedFormat => "UnsupportedFormatError",
            Self::ArchiveOpen { .. } => "ArchiveOpenError",
            Self::MalformedArchive { .. } => "MalformedArchiveError",
            Self::Policy(_) => "PolicyError",
            Self::Cancelled => "CancelledError",
            Self::Io(_) => "IoError",
        }
    }

    /// The member path this error concerns, if any.
    #[must_use]
    pub fn member_path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Self::UnsafePath { path, .. }
            | Self::ForbiddenType { path, .. }
            | Self::FileTooLarge { path, .. }
            | Self::SymlinkPolicy { path }
            | Self::HardlinkPolicy { path }
            | Self::SparsePolicy { path }
            | Self::LinkEscape { path, .. }
            | Self::AtomicWrite { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Render a detail map suitable for attaching to a `SecurityEvent`.
    #[must_use]
    pub fn detail_map(&self) -> DetailMap {
        let mut map = DetailMap::new();
        match self {
            Self::FileTooLarge { limit, actual, .. } => {
                map.insert("limit".into(), limit.to_string());
                map.insert("actual".into(), actual.to_string());
            }
            Self::TotalSizeExceeded { limit, actual } => {
                map.insert("limit".into(), limit.to_string());
                map.insert("actual".into(), actual.to_string());
            }
            Self::MaxFilesExceeded { limit, actual } => {
                map.insert("limit".into(), limit.to_string());
                map.insert("actual".into(), actual.to_string());
            }
            Self::RatioExceeded { limit, observed } => {
                map.insert("limit".into(), limit.to_string());
                map.insert("observed".into(), format!("{observed:.4}"));
            }
            Self::LinkEscape { target, detail, .. } => {
                map.insert("target".into(), target.to_string());
                map.insert("detail".into(), detail.clone());
            }
            Self::UnsafePath { detail, .. } | Self::ForbiddenType { detail, .. } => {
                map.insert("detail".into(), detail.clone());
            }
            _ => {}
        }
        map
    }
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, ExtractError>;
