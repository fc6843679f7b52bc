//! Security events: the structured record emitted on every rejection or
//! notable clamp, and the callback contract that delivers them.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use camino::Utf8PathBuf;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::ExtractError;

/// A single security-relevant decision made during extraction.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityEvent {
    pub event_type: String,
    pub archive_hash: String,
    pub member_path: Option<String>,
    pub detail: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SecurityEvent {
    /// Build an event from an [`ExtractError`] plus the archive's
    /// correlation hash.
    #[must_use]
    pub fn from_error(archive_hash: &str, err: &ExtractError) -> Self {
        Self {
            event_type: err.tag().to_string(),
            archive_hash: archive_hash.to_string(),
            member_path: err.member_path().map(ToString::to_string),
            detail: err.detail_map(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Build an informational event not tied to a specific error, e.g. a
    /// symlink skip or a clamp notice.
    #[must_use]
    pub fn note(
        archive_hash: &str,
        event_type: &str,
        member_path: Option<&Utf8PathBuf>,
        detail: BTreeMap<String, String>,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            archive_hash: archive_hash.to_string(),
            member_path: member_path.map(ToString::to_string),
            detail,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Caller-supplied callback invoked synchronously for every `SecurityEvent`.
///
/// The callback must not panic; if it does, the panic is caught and
/// swallowed (a single `internal-warning` event is logged instead) so a
/// misbehaving monitor can never abort extraction or mask the primary
/// error the caller is waiting on.
pub type EventCallback<'a> = Box<dyn FnMut(&SecurityEvent) + 'a>;

/// Invoke `callback` with `event`, defensively catching panics.
pub(crate) fn dispatch(callback: &mut Option<EventCallback<'_>>, event: &SecurityEvent) {
    let Some(callback) = callback.as_mut() else {
        return;
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
    if result.is_err() {
        warn!(
            target: "safetar::event",
            event_type = %event.event_type,
            "event callback panicked; swallowing to protect extraction"
        );
    }
}
