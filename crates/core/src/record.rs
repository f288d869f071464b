//! The correction record and its keys.
//!
//! A record is identified by `(correction_name, version, labels, sort
//! value)`, where the sort value is the sample instant or the left edge of
//! the validity interval. Records persist as a flat JSON document:
//!
//! ```text
//! { "correction_name": "pmt_gains", "version": "ONLINE",
//!   "detector": "tpc", "pmt": 12,
//!   "time": "2024-05-01T12:00:00.000Z",
//!   "value": 2.1e6, "created_at": "...", "comments": "" }
//! ```
//!
//! Interval records carry `time_left` / `time_right` instead of `time`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::clock::normalize;
use crate::value::{values_equal, CorrectionValue};
use crate::{CorrectionError, Result};

/// Version name whose latest sample extrapolates forward until superseded.
pub const ONLINE: &str = "ONLINE";

/// Document fields that can never be used as label names.
pub const RESERVED_FIELDS: &[&str] = &[
    "correction_name",
    "version",
    "time",
    "time_left",
    "time_right",
    "value",
    "created_at",
    "comments",
];

/// The value of one index label (e.g. `detector = "tpc"`, `pmt = 12`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Integer(i64),
    Text(String),
}

impl From<i64> for Label {
    fn from(n: i64) -> Self {
        Label::Integer(n)
    }
}
impl From<i32> for Label {
    fn from(n: i32) -> Self {
        Label::Integer(n.into())
    }
}
impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Text(s.to_string())
    }
}
impl From<String> for Label {
    fn from(s: String) -> Self {
        Label::Text(s)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Integer(n) => write!(f, "{n}"),
            Label::Text(s) => write!(f, "{s}"),
        }
    }
}

pub type Labels = BTreeMap<String, Label>;

/// Which temporal shape a correction uses. Fixed per correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKind {
    /// Continuously sampled; values between samples are interpolated.
    Instant,
    /// Constant over explicit `[left, right)` validity windows.
    Interval,
}

impl std::fmt::Display for TemporalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemporalKind::Instant => write!(f, "instant"),
            TemporalKind::Interval => write!(f, "interval"),
        }
    }
}

/// A half-open time range `[left, right)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub left: DateTime<Utc>,
    pub right: DateTime<Utc>,
}

impl Span {
    pub fn new(left: DateTime<Utc>, right: DateTime<Utc>) -> Self {
        Self { left, right }
    }

    pub fn center(&self) -> DateTime<Utc> {
        self.left + (self.right - self.left) / 2
    }
}

/// Where a record sits on the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalKey {
    Instant(DateTime<Utc>),
    Interval {
        left: DateTime<Utc>,
        right: DateTime<Utc>,
    },
}

impl TemporalKey {
    /// An interval key; fails unless `left < right`.
    pub fn interval(left: DateTime<Utc>, right: DateTime<Utc>) -> Result<Self> {
        if left >= right {
            return Err(CorrectionError::InvalidRecord(format!(
                "interval left edge {} must precede right edge {}",
                format_time(left),
                format_time(right)
            )));
        }
        Ok(TemporalKey::Interval { left, right })
    }

    pub fn kind(&self) -> TemporalKind {
        match self {
            TemporalKey::Instant(_) => TemporalKind::Instant,
            TemporalKey::Interval { .. } => TemporalKind::Interval,
        }
    }

    /// The instant used for ordering and uniqueness: the sample time, or
    /// the left edge of an interval.
    pub fn sort_value(&self) -> DateTime<Utc> {
        match *self {
            TemporalKey::Instant(t) => t,
            TemporalKey::Interval { left, .. } => left,
        }
    }

    /// Right edge of an interval; a sample's own instant.
    pub fn right(&self) -> DateTime<Utc> {
        match *self {
            TemporalKey::Instant(t) => t,
            TemporalKey::Interval { right, .. } => right,
        }
    }

    /// `left <= t < right` for intervals, `time == t` for samples.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        match *self {
            TemporalKey::Instant(at) => at == t,
            TemporalKey::Interval { left, right } => left <= t && t < right,
        }
    }

    /// Does `[left, right)` of this key intersect `[from, to)`?
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.sort_value() < to && from < self.right()
    }

    pub(crate) fn normalized(self) -> Self {
        match self {
            TemporalKey::Instant(t) => TemporalKey::Instant(normalize(t)),
            TemporalKey::Interval { left, right } => TemporalKey::Interval {
                left: normalize(left),
                right: normalize(right),
            },
        }
    }
}

/// Characters that delimit the components of a storage key. They may not
/// appear in correction names, versions, label names or text labels.
pub const KEY_SEPARATORS: &[char] = &[':', ',', '='];

/// Identifies one ordered series of records: everything that shares a
/// correction, a version and a full set of label values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub correction_name: String,
    pub version: String,
    pub labels: Labels,
}

impl GroupKey {
    /// Storage-key prefix shared by every record of the group.
    pub fn storage_prefix(&self) -> String {
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(
            "{}:{}:{}:",
            self.correction_name,
            self.version,
            labels.join(",")
        )
    }
}

/// The unique key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub group: GroupKey,
    pub at: DateTime<Utc>,
}

impl RecordKey {
    /// `"{name}:{version}:{k=v,..}:{sort value}"`.
    ///
    /// Timestamps are rendered fixed-width so keys of one group sort by time.
    pub fn storage_key(&self) -> String {
        format!("{}{}", self.group.storage_prefix(), format_time(self.at))
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// One dated value of one version of a correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Json>", into = "Map<String, Json>")]
pub struct CorrectionRecord {
    pub correction_name: String,
    pub version: String,
    pub labels: Labels,
    pub time: TemporalKey,
    pub value: CorrectionValue,
    pub created_at: DateTime<Utc>,
    pub comments: String,
}

impl CorrectionRecord {
    /// A record created now, with no labels and no comment.
    pub fn new(
        correction_name: impl Into<String>,
        version: impl Into<String>,
        time: TemporalKey,
        value: impl Into<CorrectionValue>,
    ) -> Self {
        Self {
            correction_name: correction_name.into(),
            version: version.into(),
            labels: Labels::new(),
            time,
            value: value.into(),
            created_at: normalize(Utc::now()),
            comments: String::new(),
        }
    }

    /// Shorthand for a sample at `at`.
    pub fn sample(
        correction_name: impl Into<String>,
        version: impl Into<String>,
        at: DateTime<Utc>,
        value: impl Into<CorrectionValue>,
    ) -> Self {
        Self::new(correction_name, version, TemporalKey::Instant(at), value)
    }

    /// Shorthand for an interval `[left, right)`.
    pub fn interval(
        correction_name: impl Into<String>,
        version: impl Into<String>,
        left: DateTime<Utc>,
        right: DateTime<Utc>,
        value: impl Into<CorrectionValue>,
    ) -> Result<Self> {
        Ok(Self::new(
            correction_name,
            version,
            TemporalKey::interval(left, right)?,
            value,
        ))
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<Label>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = comments.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = normalize(created_at);
        self
    }

    pub fn is_online(&self) -> bool {
        self.version == ONLINE
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            correction_name: self.correction_name.clone(),
            version: self.version.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            group: self.group_key(),
            at: self.time.sort_value(),
        }
    }

    pub fn storage_key(&self) -> String {
        self.key().storage_key()
    }

    /// Value equality under the [`values_equal`] contract.
    pub fn same_value(&self, other: &CorrectionRecord) -> bool {
        values_equal(&self.value, &other.value)
    }

    /// Is `other` exactly the revision that is stored as `self`?
    ///
    /// Backends compare against this before replacing or removing a row.
    pub fn same_revision(&self, other: &CorrectionRecord) -> bool {
        self.key() == other.key()
            && self.time == other.time
            && self.same_value(other)
            && self.created_at == other.created_at
            && self.comments == other.comments
    }

    /// The flat persisted document.
    pub fn to_document(&self) -> Map<String, Json> {
        let mut doc = Map::new();
        doc.insert("correction_name".into(), Json::from(self.correction_name.clone()));
        doc.insert("version".into(), Json::from(self.version.clone()));
        for (name, label) in &self.labels {
            let value = match label {
                Label::Integer(n) => Json::from(*n),
                Label::Text(s) => Json::from(s.clone()),
            };
            doc.insert(name.clone(), value);
        }
        match self.time {
            TemporalKey::Instant(t) => {
                doc.insert("time".into(), Json::from(format_time(t)));
            }
            TemporalKey::Interval { left, right } => {
                doc.insert("time_left".into(), Json::from(format_time(left)));
                doc.insert("time_right".into(), Json::from(format_time(right)));
            }
        }
        doc.insert("value".into(), self.value.to_json());
        doc.insert("created_at".into(), Json::from(format_time(self.created_at)));
        doc.insert("comments".into(), Json::from(self.comments.clone()));
        doc
    }

    /// Parse a flat document; every non-reserved field becomes a label.
    pub fn from_document(mut doc: Map<String, Json>) -> Result<Self> {
        let correction_name = take_string(&mut doc, "correction_name")?;
        let version = take_string(&mut doc, "version")?;

        let time = match doc.remove("time") {
            Some(t) => TemporalKey::Instant(parse_time_field("time", &t)?),
            None => {
                let left = doc
                    .remove("time_left")
                    .ok_or_else(|| missing("time or time_left"))?;
                let right = doc
                    .remove("time_right")
                    .ok_or_else(|| missing("time_right"))?;
                TemporalKey::interval(
                    parse_time_field("time_left", &left)?,
                    parse_time_field("time_right", &right)?,
                )?
            }
        }
        .normalized();

        let value = doc.remove("value").ok_or_else(|| missing("value"))?;
        let value = CorrectionValue::from(value);

        let created_at = match doc.remove("created_at") {
            Some(v) => normalize(parse_time_field("created_at", &v)?),
            None => normalize(Utc::now()),
        };
        let comments = match doc.remove("comments") {
            Some(Json::String(s)) => s,
            Some(Json::Null) | None => String::new(),
            Some(other) => {
                return Err(CorrectionError::InvalidRecord(format!(
                    "comments must be a string, got {other}"
                )))
            }
        };

        let mut labels = Labels::new();
        for (name, raw) in doc {
            let label = match raw {
                Json::String(s) => Label::Text(s),
                Json::Number(n) => match n.as_i64() {
                    Some(i) => Label::Integer(i),
                    None => {
                        return Err(CorrectionError::InvalidRecord(format!(
                            "label `{name}` must be an integer, got {n}"
                        )))
                    }
                },
                other => {
                    return Err(CorrectionError::InvalidRecord(format!(
                        "label `{name}` must be a string or an integer, got {other}"
                    )))
                }
            };
            labels.insert(name, label);
        }

        Ok(Self {
            correction_name,
            version,
            labels,
            time,
            value,
            created_at,
            comments,
        })
    }
}

impl TryFrom<Map<String, Json>> for CorrectionRecord {
    type Error = CorrectionError;

    fn try_from(doc: Map<String, Json>) -> Result<Self> {
        Self::from_document(doc)
    }
}

impl From<CorrectionRecord> for Map<String, Json> {
    fn from(record: CorrectionRecord) -> Self {
        record.to_document()
    }
}

/// Fixed-width RFC 3339 with millisecond precision, e.g.
/// `2024-05-01T12:00:00.000Z`.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CorrectionError::InvalidRecord(format!("invalid timestamp `{s}`: {e}")))
}

fn parse_time_field(field: &str, raw: &Json) -> Result<DateTime<Utc>> {
    match raw {
        Json::String(s) => parse_time(s),
        other => Err(CorrectionError::InvalidRecord(format!(
            "`{field}` must be an RFC 3339 string, got {other}"
        ))),
    }
}

fn take_string(doc: &mut Map<String, Json>, field: &str) -> Result<String> {
    match doc.remove(field) {
        Some(Json::String(s)) => Ok(s),
        Some(other) => Err(CorrectionError::InvalidRecord(format!(
            "`{field}` must be a string, got {other}"
        ))),
        None => Err(missing(field)),
    }
}

fn missing(field: &str) -> CorrectionError {
    CorrectionError::InvalidRecord(format!("document is missing `{field}`"))
}
