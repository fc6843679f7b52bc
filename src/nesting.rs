//! The Nesting Controller: after an extraction commits, re-invokes the full
//! pipeline on any accepted regular file that looks like a nested archive,
//! sharing the same [`Policy`] and budget counters across levels.

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::info;

use crate::error::ExtractError;
use crate::event::{dispatch, EventCallback, SecurityEvent};
use crate::policy::Policy;
use crate::streamer::{BudgetBaseline, Cancellation, ExtractionState, ExtractSession};

fn archive_extension_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\.(tar\.gz|tgz|tar\.bz2|tbz2|tar\.xz|txz|tar)$").expect("static pattern is valid")
    })
}

fn is_candidate_archive(path: &Utf8Path) -> bool {
    archive_extension_pattern().is_match(path.as_str())
}

/// Reborrow the caller's event closure as a fresh boxed callback for one
/// call into the Streamer. Only one reborrow is ever live at a time, so
/// this can be done repeatedly across a recursion without conflict.
fn reborrow<'a>(
    on_event: &'a mut Option<&mut dyn FnMut(&SecurityEvent)>,
) -> Option<EventCallback<'a>> {
    on_event.as_deref_mut().map(|f| Box::new(f) as EventCallback<'a>)
}

/// Run `extract_all`, then recurse into any nested archive the outer
/// extraction produced, until `policy.max_nesting_depth` is reached.
/// Budgets are **not** reset between levels: every nested `extract_all`
/// call is seeded with the outer extraction's live running totals (see
/// [`BudgetBaseline`]), so a bomb that fits under budget only when split
/// across nesting levels still trips the same check a flat archive would.
pub fn extract_with_nesting(
    session: &ExtractSession,
    destination: &Utf8Path,
    policy: &Policy,
    mut on_event: Option<&mut dyn FnMut(&SecurityEvent)>,
    cancel: &dyn Cancellation,
) -> Result<ExtractionState, ExtractError> {
    let mut state = session.extract_all(destination, BudgetBaseline::default(), reborrow(&mut on_event), cancel)?;
    recurse(destination, policy, 0, &mut state, &mut on_event, cancel)?;
    Ok(state)
}

fn recurse(
    destination: &Utf8Path,
    policy: &Policy,
    current_depth: u8,
    state: &mut ExtractionState,
    on_event: &mut Option<&mut dyn FnMut(&SecurityEvent)>,
    cancel: &dyn Cancellation,
) -> Result<(), ExtractError> {
    let candidates: Vec<Utf8PathBuf> = state
        .extracted_regular_files
        .iter()
        .filter(|p| is_candidate_archive(p))
        .cloned()
        .collect();

    for rel in candidates {
        if current_depth >= policy.max_nesting_depth {
            let mut cb = reborrow(on_event);
            dispatch(
                &mut cb,
                &SecurityEvent::note(
                    &state.archive_hash,
                    "NestingDepthReached",
                    Some(&rel),
                    BTreeMap::from([("depth".to_string(), current_depth.to_string())]),
                ),
            );
            continue;
        }

        let nested_path = destination.join(&rel);
        let sub_dest = sibling_extract_dir(&nested_path);
        info!(target: "safetar::nesting", nested = %rel, depth = current_depth + 1, "descending into nested archive");

        // Seed the nested extraction with the outer totals so its own live
        // budget checks run against the true cumulative count/size/ratio,
        // not a fresh zeroed state that a split bomb could hide inside.
        let baseline = BudgetBaseline {
            files_seen: state.files_seen,
            bytes_written: state.bytes_written,
            compressed_bytes_read: state.compressed_bytes_read,
        };

        let inner_session = ExtractSession::open(&nested_path, policy.clone())?;
        let mut inner_state = inner_session.extract_all(&sub_dest, baseline, reborrow(on_event), cancel)?;

        recurse(&sub_dest, policy, current_depth + 1, &mut inner_state, on_event, cancel)?;

        // `inner_state`'s counters already include the baseline plus
        // everything consumed by it and its own descendants; adopt them as
        // the new outer totals so the next sibling candidate at this depth
        // is checked against the full cumulative picture too.
        state.files_seen = inner_state.files_seen;
        state.bytes_written = inner_state.bytes_written;
        state.compressed_bytes_read = inner_state.compressed_bytes_read;
    }
    Ok(())
}

fn sibling_extract_dir(archive_path: &Utf8Path) -> Utf8PathBuf {
    let stem = archive_path
        .file_name()
        .map(strip_archive_suffix)
        .unwrap_or_else(|| "nested".to_string());
    let parent = archive_path.parent().unwrap_or(archive_path);
    parent.join(format!("{stem}.d"))
}

fn strip_archive_suffix(name: &str) -> String {
    archive_extension_pattern().replace(name, "").into_owned()
}
