//! safetar: a hardened TAR extraction core.
//!
//! Four components compose the pipeline: the [`guard`] validates each
//! member header lexically, the [`streamer`] enforces live size/ratio
//! budgets against the decoded byte stream, the [`sandbox`] materializes
//! accepted members atomically and commits deferred links, and
//! [`nesting`] recurses into sub-archives the outer extraction produced.

pub mod archive;
pub mod cli;
pub mod error;
pub mod event;
pub mod guard;
pub mod nesting;
pub mod policy;
pub mod sandbox;
pub mod streamer;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::{Cli, Commands, ExtractArgs, ListArgs};
use crate::error::ExtractError;
use crate::event::SecurityEvent;
use crate::policy::Policy;
use crate::streamer::{CanonicalName, ExtractionState, ExtractSession, NeverCancel};

/// Extract `archive_path` into `destination` under `policy`, following
/// nested sub-archives up to `policy.max_nesting_depth`. A convenience
/// wrapper over [`ExtractSession::open`] and
/// [`nesting::extract_with_nesting`] for the common, non-cancellable case.
pub fn extract(
    archive_path: &Utf8Path,
    destination: &Utf8Path,
    policy: Policy,
    on_event: Option<&mut dyn FnMut(&SecurityEvent)>,
) -> Result<ExtractionState, ExtractError> {
    let session = ExtractSession::open(archive_path, policy.clone())?;
    nesting::extract_with_nesting(&session, destination, &policy, on_event, &NeverCancel)
}

/// List the member names an extraction of `archive_path` under `policy`
/// would accept, without touching the destination filesystem.
pub fn list(archive_path: &Utf8Path, policy: Policy) -> Result<Vec<CanonicalName>, ExtractError> {
    ExtractSession::open(archive_path, policy)?.names()
}

/// Execute the command represented by the parsed CLI input.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Extract(args) => handle_extract(args),
        Commands::List(args) => handle_list(args),
    }
}

fn handle_extract(args: ExtractArgs) -> Result<()> {
    let policy = args.policy();
    let destination = args.directory.clone().unwrap_or_else(|| Utf8PathBuf::from("."));
    std::fs::create_dir_all(destination.as_std_path())
        .with_context(|| format!("creating destination directory {destination}"))?;

    let verbose = args.verbose;
    let quiet = args.quiet;
    let json_events = args.json_events;

    let progress = (!quiet && !json_events).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar
    });

    let progress_for_events = progress.clone();
    let mut print_event = move |event: &SecurityEvent| {
        if json_events {
            if let Ok(line) = serde_json::to_string(event) {
                eprintln!("{line}");
            }
        } else if let Some(bar) = &progress_for_events {
            bar.set_message(format!("{}: {:?}", event.event_type, event.member_path));
        } else if verbose && !quiet {
            eprintln!("{}: {:?}", event.event_type, event.member_path);
        }
    };

    let result = extract(&args.file, &destination, policy, Some(&mut print_event));
    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }
    let state = result.with_context(|| format!("extracting {}", args.file))?;

    if !quiet {
        println!(
            "extracted {} files, {} bytes",
            state.files_seen, state.bytes_written
        );
    }
    Ok(())
}

fn handle_list(args: ListArgs) -> Result<()> {
    let policy = args.policy();
    let names = list(&args.file, policy).with_context(|| format!("listing {}", args.file))?;

    if args.json {
        let rendered: Vec<&str> = names.iter().map(|n| n.path.as_str()).collect();
        println!("{}", serde_json::to_string(&rendered)?);
    } else {
        for name in &names {
            println!("{}", name.path);
        }
    }
    Ok(())
}
