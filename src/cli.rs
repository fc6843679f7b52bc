//! Command-line argument definitions for the safetar binary. This module
//! is glue only: it maps `clap` output onto [`crate::policy::Policy`] and
//! the core `extract`/`list` entry points.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::policy::{HardlinkPolicy, Policy, SparsePolicy, SymlinkPolicy};

#[derive(Debug, Parser)]
#[command(name = "safetar", version, about = "Extract untrusted TAR archives safely", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Extract an archive into a destination directory.
    Extract(ExtractArgs),
    /// List the members an extraction would accept, without writing anything.
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Path to the archive to extract.
    pub file: Utf8PathBuf,

    /// Destination directory. Created if it does not already exist.
    #[arg(short = 'C', long = "directory")]
    pub directory: Option<Utf8PathBuf>,

    #[command(flatten)]
    pub limits: LimitArgs,

    /// How to handle SYMLINK members.
    #[arg(long, value_enum, default_value_t = SymlinkPolicyArg::Reject)]
    pub symlinks: SymlinkPolicyArg,

    /// How to handle HARDLINK members.
    #[arg(long, value_enum, default_value_t = HardlinkPolicyArg::Reject)]
    pub hardlinks: HardlinkPolicyArg,

    /// How to handle GNU sparse members.
    #[arg(long, value_enum, default_value_t = SparsePolicyArg::Reject)]
    pub sparse: SparsePolicyArg,

    /// Preserve the setuid/setgid/sticky bits instead of stripping them.
    #[arg(long)]
    pub keep_special_bits: bool,

    /// Restore the archive's recorded uid/gid instead of the current user's.
    #[arg(long)]
    pub preserve_ownership: bool,

    /// Don't clamp out-of-range modification times to a safe `u32` range.
    #[arg(long)]
    pub no_clamp_timestamps: bool,

    /// Print every accepted member as it is written.
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress non-error output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Emit every `SecurityEvent` as a line of JSON on stderr.
    #[arg(long)]
    pub json_events: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Path to the archive to inspect.
    pub file: Utf8PathBuf,

    #[command(flatten)]
    pub limits: LimitArgs,

    /// Print member names as a JSON array instead of one per line.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct LimitArgs {
    /// Reject any single member larger than this many bytes.
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Reject the whole archive once this many bytes have been written.
    #[arg(long)]
    pub max_total_size: Option<u64>,

    /// Reject the whole archive once this many members have been accepted.
    #[arg(long)]
    pub max_files: Option<u32>,

    /// Reject if decoded-to-compressed ratio exceeds this value.
    #[arg(long)]
    pub max_ratio: Option<f64>,

    /// Maximum levels of nested sub-archives to descend into.
    #[arg(long)]
    pub max_nesting_depth: Option<u8>,
}

impl LimitArgs {
    /// Apply every `Some` override onto a default [`Policy`].
    #[must_use]
    pub fn apply(&self, mut policy: Policy) -> Policy {
        if let Some(v) = self.max_file_size {
            policy = policy.with_max_file_size(v);
        }
        if let Some(v) = self.max_total_size {
            policy = policy.with_max_total_size(v);
        }
        if let Some(v) = self.max_files {
            policy = policy.with_max_files(v);
        }
        if let Some(v) = self.max_ratio {
            policy = policy.with_max_ratio(v);
        }
        if let Some(v) = self.max_nesting_depth {
            policy = policy.with_max_nesting_depth(v);
        }
        policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SymlinkPolicyArg {
    Reject,
    Ignore,
    ResolveInternal,
}

impl From<SymlinkPolicyArg> for SymlinkPolicy {
    fn from(value: SymlinkPolicyArg) -> Self {
        match value {
            SymlinkPolicyArg::Reject => Self::Reject,
            SymlinkPolicyArg::Ignore => Self::Ignore,
            SymlinkPolicyArg::ResolveInternal => Self::ResolveInternal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HardlinkPolicyArg {
    Reject,
    Internal,
}

impl From<HardlinkPolicyArg> for HardlinkPolicy {
    fn from(value: HardlinkPolicyArg) -> Self {
        match value {
            HardlinkPolicyArg::Reject => Self::Reject,
            HardlinkPolicyArg::Internal => Self::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SparsePolicyArg {
    Reject,
    Materialise,
}

impl From<SparsePolicyArg> for SparsePolicy {
    fn from(value: SparsePolicyArg) -> Self {
        match value {
            SparsePolicyArg::Reject => Self::Reject,
            SparsePolicyArg::Materialise => Self::Materialise,
        }
    }
}

impl ExtractArgs {
    /// Build the [`Policy`] this invocation describes.
    #[must_use]
    pub fn policy(&self) -> Policy {
        self.limits
            .apply(Policy::new())
            .with_symlink_policy(self.symlinks.into())
            .with_hardlink_policy(self.hardlinks.into())
            .with_sparse_policy(self.sparse.into())
            .with_strip_special_bits(!self.keep_special_bits)
            .with_preserve_ownership(self.preserve_ownership)
            .with_clamp_timestamps(!self.no_clamp_timestamps)
    }
}

impl ListArgs {
    /// Build the [`Policy`] this invocation describes. Listing uses the
    /// same acceptance rules as extraction so the printed names match
    /// what a real extraction would produce.
    #[must_use]
    pub fn policy(&self) -> Policy {
        self.limits.apply(Policy::new())
    }
}
