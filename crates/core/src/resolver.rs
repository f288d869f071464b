//! Point-in-time and range resolution.
//!
//! Every function here is a pure function of a snapshot of records: the
//! same snapshot and query always produce the same result, and nothing is
//! written. Callers fetch the snapshot from a datasource and pass it in.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::shift;
use crate::record::{CorrectionRecord, GroupKey, Label, Span, TemporalKey, TemporalKind};

/// A time query after run ids have been translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedTime {
    At(DateTime<Utc>),
    Range(Span),
}

/// Split records into their groups, each sorted by sort value (oldest
/// creation first on ties).
pub fn partition_groups(
    records: impl IntoIterator<Item = CorrectionRecord>,
) -> BTreeMap<GroupKey, Vec<CorrectionRecord>> {
    let mut groups: BTreeMap<GroupKey, Vec<CorrectionRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.group_key()).or_default().push(record);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|r| (r.time.sort_value(), r.created_at));
    }
    groups
}

/// Resolve a sample-based group at `t`.
///
/// An exact sample wins. Otherwise the neighbours on either side are
/// found; with only one neighbour it is returned as-is (this is how the
/// latest ONLINE sample extrapolates forward), with two numeric neighbours
/// the value is linearly interpolated into a synthesized record at `t`,
/// and with two non-numeric neighbours the earlier one is returned.
///
/// `group` must be sorted by time.
pub fn resolve_sample(group: &[CorrectionRecord], t: DateTime<Utc>) -> Option<CorrectionRecord> {
    let idx = group.partition_point(|r| r.time.sort_value() < t);
    if let Some(exact) = group.get(idx).filter(|r| r.time.sort_value() == t) {
        return Some(exact.clone());
    }

    let prev = idx.checked_sub(1).and_then(|i| group.get(i));
    let next = group.get(idx);

    match (prev, next) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (Some(prev), Some(next)) => {
            let t_prev = prev.time.sort_value();
            let t_next = next.time.sort_value();
            let span = (t_next - t_prev).num_milliseconds() as f64;
            let elapsed = (t - t_prev).num_milliseconds() as f64;
            match prev.value.interpolate(&next.value, elapsed / span) {
                Some(value) => {
                    let mut synthesized = prev.clone();
                    synthesized.time = TemporalKey::Instant(t);
                    synthesized.value = value;
                    Some(synthesized)
                }
                None => Some(prev.clone()),
            }
        }
    }
}

/// Resolve an interval group at `t`.
///
/// The interval with `left <= t < right` wins; if several contain `t`, the
/// one with the latest left edge, then the most recently created.
///
/// If no interval contains `t`, the lookup is deliberately relaxed to
/// tolerate boundary rounding: intervals overlapping
/// `[t - tolerance, t + tolerance]` (closed on both ends, so an interval
/// ending exactly at `t` qualifies even with zero tolerance) are
/// candidates, and the one closest to `t` wins, then the latest left edge,
/// then the most recently created. This never fabricates a value outside
/// that window.
pub fn resolve_interval(
    group: &[CorrectionRecord],
    t: DateTime<Utc>,
    tolerance: Duration,
) -> Option<CorrectionRecord> {
    let containing = group
        .iter()
        .filter(|r| r.time.contains(t))
        .max_by_key(|r| (r.time.sort_value(), r.created_at));
    if let Some(found) = containing {
        return Some(found.clone());
    }

    let lo = shift(t, -tolerance);
    let hi = shift(t, tolerance);
    let nearest = group
        .iter()
        .filter(|r| r.time.sort_value() <= hi && r.time.right() >= lo)
        .min_by_key(|r| {
            (
                distance(&r.time, t),
                Reverse(r.time.sort_value()),
                Reverse(r.created_at),
            )
        });
    if let Some(found) = nearest {
        debug!(
            correction = %found.correction_name,
            version = %found.version,
            at = %t,
            "no interval contains the query instant, using the nearest boundary"
        );
    }
    nearest.cloned()
}

/// Distance from `t` to the closest point of `key`'s span.
fn distance(key: &TemporalKey, t: DateTime<Utc>) -> Duration {
    let (left, right) = (key.sort_value(), key.right());
    if t < left {
        left - t
    } else if t >= right {
        t - right
    } else {
        Duration::zero()
    }
}

/// Stored samples with `left <= time < right`.
pub fn samples_in_range(group: &[CorrectionRecord], span: Span) -> Vec<CorrectionRecord> {
    group
        .iter()
        .filter(|r| span.left <= r.time.sort_value() && r.time.sort_value() < span.right)
        .cloned()
        .collect()
}

/// Stored intervals intersecting `[left, right)`, by left edge.
pub fn intervals_overlapping(group: &[CorrectionRecord], span: Span) -> Vec<CorrectionRecord> {
    group
        .iter()
        .filter(|r| r.time.overlaps(span.left, span.right))
        .cloned()
        .collect()
}

/// Resolve every group in `records` independently; results come out in
/// group-key order.
pub fn resolve(
    records: impl IntoIterator<Item = CorrectionRecord>,
    kind: TemporalKind,
    time: ResolvedTime,
    tolerance: Duration,
) -> Vec<CorrectionRecord> {
    let mut results = Vec::new();
    for group in partition_groups(records).into_values() {
        match (kind, time) {
            (TemporalKind::Instant, ResolvedTime::At(t)) => {
                results.extend(resolve_sample(&group, t));
            }
            (TemporalKind::Interval, ResolvedTime::At(t)) => {
                results.extend(resolve_interval(&group, t, tolerance));
            }
            (TemporalKind::Instant, ResolvedTime::Range(span)) => {
                results.extend(samples_in_range(&group, span));
            }
            (TemporalKind::Interval, ResolvedTime::Range(span)) => {
                results.extend(intervals_overlapping(&group, span));
            }
        }
    }
    results
}

/// One result per value of `label`, all evaluated at the same instant.
///
/// Each group is resolved on its own samples, so channels sampled at
/// different times are never assumed to share timestamps. Groups without
/// the label are skipped. Output is ordered by label value.
pub fn resolve_per_label(
    records: impl IntoIterator<Item = CorrectionRecord>,
    kind: TemporalKind,
    label: &str,
    t: DateTime<Utc>,
    tolerance: Duration,
) -> Vec<(Label, CorrectionRecord)> {
    let mut results: Vec<(Label, CorrectionRecord)> = partition_groups(records)
        .into_iter()
        .filter_map(|(key, group)| {
            let value = key.labels.get(label)?.clone();
            let resolved = match kind {
                TemporalKind::Instant => resolve_sample(&group, t),
                TemporalKind::Interval => resolve_interval(&group, t, tolerance),
            }?;
            Some((value, resolved))
        })
        .collect();
    // Stable: groups sharing a label value stay in group-key order.
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

/// The time ranges over which `records` define a value.
///
/// Intervals are sorted by left edge and merged where one ends exactly
/// where the next begins. Samples cover `[first, last)`; with
/// `extend_to` set (ONLINE data), the right edge is pushed out to
/// `max(last, extend_to)` because the latest sample extrapolates.
pub fn validity_intervals(
    records: &[CorrectionRecord],
    kind: TemporalKind,
    extend_to: Option<DateTime<Utc>>,
) -> Vec<Span> {
    match kind {
        TemporalKind::Interval => {
            let mut spans: Vec<Span> = records
                .iter()
                .map(|r| Span::new(r.time.sort_value(), r.time.right()))
                .collect();
            spans.sort();
            let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
            for span in spans {
                match merged.last_mut() {
                    Some(last) if last.right == span.left => last.right = span.right,
                    _ => merged.push(span),
                }
            }
            merged
        }
        TemporalKind::Instant => {
            let times = records.iter().map(|r| r.time.sort_value());
            let (Some(first), Some(last)) = (times.clone().min(), times.max()) else {
                return Vec::new();
            };
            let right = match extend_to {
                Some(until) => last.max(until),
                None => last,
            };
            vec![Span::new(first, right)]
        }
    }
}
