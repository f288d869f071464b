//! Mutation policy.
//!
//! Decides whether a write is legal against a snapshot of the record's
//! group and, if so, which single datasource operation carries it out.
//! Two strategies exist, one per [`TemporalKind`]; nothing here touches
//! storage.
//!
//! Cutoff comparisons use a zero buffer: an instant is mutable only if it
//! is strictly after `now + cutoff_offset`. ONLINE samples are the
//! exception; they are mutable only strictly after the freeze instant
//! `now + cutoff_offset + freeze_buffer`, so the pinned sample always
//! precedes them and can itself never be rewritten or removed.

use chrono::Duration;

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::record::{format_time, CorrectionRecord, RecordKey, TemporalKind};
use crate::resolver::resolve_sample;
use crate::{CorrectionError, Result};

/// The datasource operation a legal mutation maps to.
#[derive(Debug, Clone)]
pub enum Write {
    /// The store already holds an equivalent record.
    NoOp,
    Insert(CorrectionRecord),
    Replace {
        expected: CorrectionRecord,
        record: CorrectionRecord,
    },
    Remove(CorrectionRecord),
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub write: Write,
    /// Pin the cutoff value of the group before writing.
    pub freeze: bool,
}

impl Plan {
    fn write(write: Write) -> Self {
        Self {
            write,
            freeze: false,
        }
    }

    fn noop() -> Self {
        Self::write(Write::NoOp)
    }

    fn freezing_if(self, freeze: bool) -> Self {
        Self { freeze, ..self }
    }
}

/// Plan storing `record` into `group`, the sorted records sharing its
/// group key.
pub fn plan_insert(
    kind: TemporalKind,
    group: &[CorrectionRecord],
    record: CorrectionRecord,
    clock: &Clock,
    config: &StoreConfig,
) -> Result<Plan> {
    match kind {
        TemporalKind::Interval => interval_insert(group, record, clock),
        TemporalKind::Instant => sample_insert(group, record, clock, config),
    }
}

/// Plan deleting the record at `key` from `group`.
pub fn plan_delete(
    kind: TemporalKind,
    group: &[CorrectionRecord],
    key: &RecordKey,
    clock: &Clock,
    config: &StoreConfig,
) -> Result<Plan> {
    let existing = group
        .iter()
        .find(|r| r.time.sort_value() == key.at)
        .ok_or_else(|| CorrectionError::NotFound(key.to_string()))?;

    let freeze = kind == TemporalKind::Instant && existing.is_online();
    let buffer = if freeze {
        config.freeze_buffer()
    } else {
        Duration::zero()
    };
    if !clock.after_cutoff(key.at, buffer) {
        return Err(CorrectionError::AppendOnly(format!(
            "{key} is at or before the cutoff {}",
            format_time(clock.cutoff(buffer))
        )));
    }

    Ok(Plan::write(Write::Remove(existing.clone())).freezing_if(freeze))
}

// ---------------------------------------------------------------------------
// Interval corrections
// ---------------------------------------------------------------------------

fn interval_insert(
    group: &[CorrectionRecord],
    record: CorrectionRecord,
    clock: &Clock,
) -> Result<Plan> {
    let left = record.time.sort_value();
    let right = record.time.right();
    let existing = group.iter().find(|r| r.time.sort_value() == left);

    if let Some(existing) = existing {
        if existing.time == record.time && existing.same_value(&record) {
            return Ok(Plan::noop());
        }
        check_interval_update(existing, &record, clock)?;
    }

    if let Some(other) = group
        .iter()
        .filter(|r| r.time.sort_value() != left)
        .find(|r| r.time.overlaps(left, right))
    {
        return Err(CorrectionError::Overlap(format!(
            "[{}, {}) overlaps stored interval [{}, {}) of {}",
            format_time(left),
            format_time(right),
            format_time(other.time.sort_value()),
            format_time(other.time.right()),
            other.group_key().storage_prefix()
        )));
    }

    Ok(Plan::write(match existing {
        Some(existing) => Write::Replace {
            expected: existing.clone(),
            record,
        },
        None => Write::Insert(record),
    }))
}

/// An interval may be rewritten freely while it lies entirely after the
/// cutoff; otherwise only its right edge may shrink, keeping its value,
/// from one uncommitted instant to another.
fn check_interval_update(
    existing: &CorrectionRecord,
    record: &CorrectionRecord,
    clock: &Clock,
) -> Result<()> {
    let zero = Duration::zero();
    if clock.after_cutoff(existing.time.sort_value(), zero) {
        return Ok(());
    }

    let old_right = existing.time.right();
    let new_right = record.time.right();
    let shrinks = new_right < old_right;
    if existing.same_value(record)
        && shrinks
        && clock.after_cutoff(old_right, zero)
        && clock.after_cutoff(new_right, zero)
    {
        return Ok(());
    }

    let reason = if !existing.same_value(record) {
        "its value cannot change"
    } else if !shrinks {
        "its right edge can only shrink"
    } else {
        "its right edge cannot move to or before the cutoff"
    };
    Err(CorrectionError::Update(format!(
        "{} starts at or before the cutoff {}: {reason}",
        existing.key(),
        format_time(clock.cutoff(zero))
    )))
}

// ---------------------------------------------------------------------------
// Sample corrections
// ---------------------------------------------------------------------------

fn sample_insert(
    group: &[CorrectionRecord],
    record: CorrectionRecord,
    clock: &Clock,
    config: &StoreConfig,
) -> Result<Plan> {
    let zero = Duration::zero();
    let at = record.time.sort_value();
    let existing = group.iter().find(|r| r.time.sort_value() == at);

    // ONLINE values cannot be backdated past the freeze instant; only
    // re-asserting what is already reported there is accepted.
    let freeze_buffer = config.freeze_buffer();
    if record.is_online() && !clock.after_cutoff(at, freeze_buffer) {
        let current = existing.cloned().or_else(|| resolve_sample(group, at));
        return match current {
            None => Err(CorrectionError::Insertion(format!(
                "ONLINE sample {} is at or before the freeze instant {}",
                record.key(),
                format_time(clock.cutoff(freeze_buffer))
            ))),
            Some(current) if !current.same_value(&record) => {
                Err(CorrectionError::Update(format!(
                    "ONLINE sample {} would change the value reported before the cutoff",
                    record.key()
                )))
            }
            Some(_) => Ok(Plan::noop()),
        };
    }

    if let Some(existing) = existing {
        if existing.same_value(&record) {
            return Ok(Plan::noop());
        }
        if !clock.after_cutoff(at, zero) {
            return Err(CorrectionError::Update(format!(
                "{} is at or before the cutoff {}: its value cannot change",
                existing.key(),
                format_time(clock.cutoff(zero))
            )));
        }
        let freeze = record.is_online();
        return Ok(Plan::write(Write::Replace {
            expected: existing.clone(),
            record,
        })
        .freezing_if(freeze));
    }

    let spacing = config.min_sample_spacing();
    if spacing > zero {
        if let Some(near) = group.iter().find(|r| {
            let gap = r.time.sort_value() - at;
            gap.abs() <= spacing
        }) {
            return Err(CorrectionError::Overlap(format!(
                "sample at {} is within {} ms of the sample at {}",
                format_time(at),
                spacing.num_milliseconds(),
                format_time(near.time.sort_value())
            )));
        }
    }

    let freeze = record.is_online();
    Ok(Plan::write(Write::Insert(record)).freezing_if(freeze))
}
