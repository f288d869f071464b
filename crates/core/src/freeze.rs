//! Pinning ONLINE history.
//!
//! The latest ONLINE sample extrapolates forward, so inserting or removing
//! an ONLINE sample after the cutoff could change what was reported for
//! instants already handed to downstream processing. Before such a write,
//! the value currently reported just past the cutoff is stored as a real
//! sample, which makes the history up to that point independent of the
//! write.

use chrono::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::datasource::Datasource;
use crate::record::{format_time, CorrectionRecord, TemporalKey};
use crate::resolver::resolve_sample;
use crate::Result;

/// Comment attached to every pinned sample.
pub const PINNED_COMMENT: &str = "pinned at cutoff";

/// Store the value `group` reports at `clock.cutoff(buffer)` as a sample
/// at that instant.
///
/// Returns the pinned record, or `None` when a sample already exists at
/// that instant or the group reports nothing there. Calling this twice
/// with the same clock therefore writes at most once.
///
/// `group` must be the sorted records of one sample-based group.
pub fn pin_cutoff_sample<D: Datasource + ?Sized>(
    datasource: &D,
    group: &[CorrectionRecord],
    clock: &Clock,
    buffer: Duration,
) -> Result<Option<CorrectionRecord>> {
    let at = clock.cutoff(buffer);
    if group.iter().any(|r| r.time.sort_value() == at) {
        return Ok(None);
    }
    let Some(mut pinned) = resolve_sample(group, at) else {
        return Ok(None);
    };

    pinned.time = TemporalKey::Instant(at);
    pinned.created_at = clock.now();
    pinned.comments = PINNED_COMMENT.to_string();
    datasource.insert(&pinned)?;

    info!(
        correction = %pinned.correction_name,
        version = %pinned.version,
        time = %format_time(at),
        value = %pinned.value,
        "pinned cutoff value"
    );
    Ok(Some(pinned))
}
