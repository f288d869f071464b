//! xedocs: append-only store for time-varying detector corrections.
//!
//! The core primitive is a [`CorrectionRecord`]: one dated value of one
//! version of a named correction (a gain, a threshold, a map), indexed by
//! a fixed set of labels such as `detector` and `pmt`.
//!
//! Corrections come in two shapes. **Sample** corrections hold values at
//! instants and are interpolated in between; the reserved `ONLINE` version
//! extrapolates its latest sample forward. **Interval** corrections hold
//! one value per `[left, right)` window.
//!
//! Everything at or before the **cutoff** (`now + cutoff_offset`) has
//! already been used by downstream processing and is immutable: it cannot
//! be deleted, and its value cannot change. Writes to ONLINE data first
//! pin the value currently reported at the cutoff so that extrapolated
//! history stays put.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use xedocs::{CorrectionRecord, CorrectionStore, Query, SchemaRegistry, StoreConfig};
//!
//! let store = CorrectionStore::open(
//!     "corrections.redb",
//!     SchemaRegistry::builtin(),
//!     StoreConfig::default(),
//! )
//! .unwrap();
//!
//! let at = "2022-01-01T00:00:00Z".parse().unwrap();
//! let gain = CorrectionRecord::sample("pmt_gains", "v1", at, 2.1e6)
//!     .with_label("detector", "tpc")
//!     .with_label("pmt", 12);
//! store.insert(gain).unwrap();
//!
//! let query = Query::new("pmt_gains")
//!     .version("v1")
//!     .label("detector", "tpc")
//!     .label("pmt", 12)
//!     .at("2022-06-01T00:00:00Z".parse().unwrap());
//! let found = store.find_one(&query).unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod datasource;
pub mod freeze;
pub mod policy;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod value;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use clock::Clock;
pub use config::StoreConfig;
pub use datasource::{Datasource, KeyFilter, MemoryDatasource, RedbDatasource};
pub use record::{
    CorrectionRecord, GroupKey, Label, Labels, RecordKey, Span, TemporalKey, TemporalKind, ONLINE,
};
pub use registry::{RunRegistry, StaticRunRegistry};
pub use schema::{CorrectionSchema, LabelSpec, SchemaRegistry};
pub use value::{values_equal, CorrectionValue};

use clock::normalize;
use policy::{Plan, Write};
use record::format_time;
use resolver::ResolvedTime;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CorrectionError {
    /// A new interval or sample collides with a stored one in its group.
    #[error("overlap: {0}")]
    Overlap(String),
    /// A disallowed change to an existing record.
    #[error("update rejected: {0}")]
    Update(String),
    /// A disallowed new record, e.g. a backdated ONLINE sample.
    #[error("insertion rejected: {0}")]
    Insertion(String),
    /// A delete of a record at or before the cutoff.
    #[error("append-only: {0}")]
    AppendOnly(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The backend saw a different state than the one the write was
    /// validated against.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for CorrectionError {
    fn from(e: redb::DatabaseError) -> Self {
        CorrectionError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for CorrectionError {
    fn from(e: redb::TransactionError) -> Self {
        CorrectionError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for CorrectionError {
    fn from(e: redb::TableError) -> Self {
        CorrectionError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for CorrectionError {
    fn from(e: redb::StorageError) -> Self {
        CorrectionError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for CorrectionError {
    fn from(e: redb::CommitError) -> Self {
        CorrectionError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CorrectionError>;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// When to evaluate a correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeQuery {
    At(DateTime<Utc>),
    Range {
        left: DateTime<Utc>,
        right: DateTime<Utc>,
    },
    /// A run id, translated through the store's [`RunRegistry`]. Sample
    /// corrections are evaluated at the centre of the run, interval
    /// corrections over the whole run.
    Run(String),
}

/// Which records to fetch and how to evaluate them.
///
/// Labels are a subset filter: labels left out match every value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub correction_name: String,
    pub version: Option<String>,
    pub labels: Labels,
    pub time: Option<TimeQuery>,
}

impl Query {
    pub fn new(correction_name: impl Into<String>) -> Self {
        Self {
            correction_name: correction_name.into(),
            version: None,
            labels: Labels::new(),
            time: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<Label>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn at(mut self, t: DateTime<Utc>) -> Self {
        self.time = Some(TimeQuery::At(t));
        self
    }

    pub fn range(mut self, left: DateTime<Utc>, right: DateTime<Utc>) -> Self {
        self.time = Some(TimeQuery::Range { left, right });
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.time = Some(TimeQuery::Run(run_id.into()));
        self
    }

    fn filter(&self) -> KeyFilter {
        KeyFilter {
            correction_name: self.correction_name.clone(),
            version: self.version.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// What a successful write did to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Replaced,
    /// An equivalent record was already stored.
    Unchanged,
    Removed,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The correction store.
///
/// Every write is validated by the mutation policy of the correction's
/// [`TemporalKind`] against a fresh snapshot of its group, then carried out
/// as a single expectation-checked datasource operation. A write that
/// races another one is re-validated once before the conflict is reported.
///
/// # Example
///
/// ```rust,no_run
/// use xedocs::{CorrectionRecord, CorrectionStore, SchemaRegistry, StoreConfig};
///
/// let store = CorrectionStore::open_in_memory(SchemaRegistry::builtin(), StoreConfig::default())
///     .unwrap();
/// let window = CorrectionRecord::interval(
///     "z_bias_map",
///     "v1",
///     "2020-01-01T00:00:00Z".parse().unwrap(),
///     "2020-06-01T00:00:00Z".parse().unwrap(),
///     "z_bias_v1.json",
/// )
/// .unwrap();
/// store.insert(window).unwrap();
/// ```
pub struct CorrectionStore<D: Datasource = RedbDatasource> {
    datasource: D,
    schemas: SchemaRegistry,
    clock: Clock,
    config: StoreConfig,
    runs: Box<dyn RunRegistry>,
}

impl CorrectionStore<RedbDatasource> {
    /// Open or create a store backed by a redb file at `path`.
    pub fn open(path: &str, schemas: SchemaRegistry, config: StoreConfig) -> Result<Self> {
        Self::with_datasource(RedbDatasource::open(path)?, schemas, config)
    }

    /// A store that keeps nothing once dropped.
    pub fn open_in_memory(schemas: SchemaRegistry, config: StoreConfig) -> Result<Self> {
        Self::with_datasource(RedbDatasource::open_in_memory()?, schemas, config)
    }
}

impl<D: Datasource> CorrectionStore<D> {
    /// A store over any datasource, with a system clock and no known runs.
    pub fn with_datasource(datasource: D, schemas: SchemaRegistry, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            datasource,
            schemas,
            clock: Clock::from_config(&config),
            config,
            runs: Box::new(StaticRunRegistry::new()),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Fix "now" at `now`, keeping the configured cutoff offset.
    pub fn frozen_at(self, now: DateTime<Utc>) -> Self {
        let clock = Clock::frozen(now, self.config.cutoff_offset());
        self.with_clock(clock)
    }

    pub fn with_run_registry(mut self, runs: impl RunRegistry + 'static) -> Self {
        self.runs = Box::new(runs);
        self
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn datasource(&self) -> &D {
        &self.datasource
    }

    // -- writes -------------------------------------------------------------

    /// Insert a record, or update the stored record at the same key.
    ///
    /// Label defaults of the correction are filled in and all instants are
    /// truncated to milliseconds before validation.
    pub fn insert(&self, mut record: CorrectionRecord) -> Result<WriteOutcome> {
        let schema = self.schemas.get(&record.correction_name)?;
        schema.apply_defaults(&mut record.labels);
        record.time = record.time.normalized();
        record.created_at = normalize(record.created_at);
        schema.validate(&record)?;
        let kind = schema.kind;

        let result = self.retry_on_conflict(|| {
            self.write_planned(&record.group_key(), |group| {
                policy::plan_insert(kind, group, record.clone(), &self.clock, &self.config)
            })
        });
        if let Err(e) = &result {
            warn!(
                correction = %record.correction_name,
                version = %record.version,
                time = %format_time(record.time.sort_value()),
                error = %e,
                "insert rejected"
            );
        }
        result
    }

    /// Delete the record stored at `key`.
    pub fn delete(&self, key: &RecordKey) -> Result<WriteOutcome> {
        let schema = self.schemas.get(&key.group.correction_name)?;
        let kind = schema.kind;
        let key = RecordKey {
            group: key.group.clone(),
            at: normalize(key.at),
        };

        let result = self.retry_on_conflict(|| {
            self.write_planned(&key.group, |group| {
                policy::plan_delete(kind, group, &key, &self.clock, &self.config)
            })
        });
        if let Err(e) = &result {
            warn!(
                correction = %key.group.correction_name,
                version = %key.group.version,
                time = %format_time(key.at),
                error = %e,
                "delete rejected"
            );
        }
        result
    }

    /// Pin the value the ONLINE group of `correction_name` and `labels`
    /// reports just past the cutoff.
    ///
    /// Returns the pinned sample, or `None` if one already exists at that
    /// instant or the group is empty.
    pub fn freeze(&self, correction_name: &str, labels: &Labels) -> Result<Option<CorrectionRecord>> {
        let schema = self.schemas.get(correction_name)?;
        if schema.kind != TemporalKind::Instant {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{correction_name}` is an interval correction and has no ONLINE extrapolation"
            )));
        }
        let mut labels = labels.clone();
        schema.apply_defaults(&mut labels);
        schema.validate_filter(&labels)?;
        if let Some(missing) = schema.label_names().find(|n| !labels.contains_key(*n)) {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{correction_name}` group is missing label `{missing}`"
            )));
        }
        let key = GroupKey {
            correction_name: correction_name.to_string(),
            version: ONLINE.to_string(),
            labels,
        };

        self.retry_on_conflict(|| {
            let group = self.group(&key)?;
            freeze::pin_cutoff_sample(
                &self.datasource,
                &group,
                &self.clock,
                self.config.freeze_buffer(),
            )
        })
    }

    /// Snapshot the group, plan, pin ONLINE history if the plan asks for
    /// it, and apply the planned write.
    ///
    /// Pinning changes the group, so the plan is rebuilt once after a pin.
    fn write_planned(
        &self,
        key: &GroupKey,
        plan: impl Fn(&[CorrectionRecord]) -> Result<Plan>,
    ) -> Result<WriteOutcome> {
        let mut pinned = false;
        loop {
            let group = self.group(key)?;
            let planned = plan(&group)?;
            if planned.freeze && !pinned {
                pinned = true;
                let pin = freeze::pin_cutoff_sample(
                    &self.datasource,
                    &group,
                    &self.clock,
                    self.config.freeze_buffer(),
                )?;
                if pin.is_some() {
                    continue;
                }
            }
            return self.apply(planned.write);
        }
    }

    fn apply(&self, write: Write) -> Result<WriteOutcome> {
        let (outcome, record) = match write {
            Write::NoOp => {
                debug!("equivalent record already stored");
                return Ok(WriteOutcome::Unchanged);
            }
            Write::Insert(record) => {
                self.datasource.insert(&record)?;
                (WriteOutcome::Inserted, record)
            }
            Write::Replace { expected, record } => {
                self.datasource.replace(&expected, &record)?;
                (WriteOutcome::Replaced, record)
            }
            Write::Remove(record) => {
                self.datasource.remove(&record)?;
                (WriteOutcome::Removed, record)
            }
        };
        info!(
            correction = %record.correction_name,
            version = %record.version,
            time = %format_time(record.time.sort_value()),
            outcome = ?outcome,
            "correction written"
        );
        Ok(outcome)
    }

    fn retry_on_conflict<T>(&self, attempt: impl Fn() -> Result<T>) -> Result<T> {
        match attempt() {
            Err(CorrectionError::Conflict(reason)) => {
                debug!(%reason, "write raced another writer, re-validating");
                attempt()
            }
            other => other,
        }
    }

    fn group(&self, key: &GroupKey) -> Result<Vec<CorrectionRecord>> {
        let mut records = self.datasource.find(&KeyFilter::group(key))?;
        records.sort_by_key(|r| r.time.sort_value());
        Ok(records)
    }

    // -- reads --------------------------------------------------------------

    /// Evaluate `query`. Each matching group is resolved independently.
    ///
    /// Without a time, every matching stored record is returned ordered by
    /// group key, then time. At an instant, each group yields at most one record; over a
    /// range, the stored records intersecting it. Finding nothing is not an
    /// error here, see [`find_one`](Self::find_one).
    pub fn find(&self, query: &Query) -> Result<Vec<CorrectionRecord>> {
        let kind = self.checked_kind(query)?;
        let mut records = self.datasource.find(&query.filter())?;
        let Some(time) = &query.time else {
            records.sort_by_cached_key(|r| (r.group_key(), r.time.sort_value()));
            return Ok(records);
        };
        let time = self.resolve_time(kind, time)?;
        Ok(resolver::resolve(
            records,
            kind,
            time,
            self.config.boundary_tolerance(),
        ))
    }

    /// The first result of [`find`](Self::find), or
    /// [`CorrectionError::NotFound`].
    pub fn find_one(&self, query: &Query) -> Result<CorrectionRecord> {
        self.find(query)?.into_iter().next().ok_or_else(|| {
            CorrectionError::NotFound(format!(
                "no `{}` value matches {:?}",
                query.correction_name, query
            ))
        })
    }

    /// One result per value of `label`, every group resolved at the same
    /// instant on its own samples.
    pub fn find_per_label(&self, query: &Query, label: &str) -> Result<Vec<(Label, CorrectionRecord)>> {
        let kind = self.checked_kind(query)?;
        let schema = self.schemas.get(&query.correction_name)?;
        if !schema.label_names().any(|n| n == label) {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{}` has no label `{label}`",
                query.correction_name
            )));
        }
        let at = match &query.time {
            Some(TimeQuery::At(t)) => normalize(*t),
            Some(TimeQuery::Run(run_id)) => self.runs.run_span(run_id)?.center(),
            _ => {
                return Err(CorrectionError::InvalidRecord(
                    "per-label resolution needs a single instant or run".into(),
                ))
            }
        };
        let records = self.datasource.find(&query.filter())?;
        Ok(resolver::resolve_per_label(
            records,
            kind,
            label,
            at,
            self.config.boundary_tolerance(),
        ))
    }

    /// The time ranges over which matching records define a value.
    ///
    /// Sample corrections queried without a version, or for ONLINE, are
    /// defined up to at least the cutoff since the latest ONLINE sample
    /// extrapolates.
    pub fn validity_intervals(
        &self,
        correction_name: &str,
        version: Option<&str>,
        labels: &Labels,
    ) -> Result<Vec<Span>> {
        let schema = self.schemas.get(correction_name)?;
        schema.validate_filter(labels)?;
        let filter = KeyFilter {
            correction_name: correction_name.to_string(),
            version: version.map(str::to_string),
            labels: labels.clone(),
        };
        let records = self.datasource.find(&filter)?;
        let extend_to = match schema.kind {
            TemporalKind::Instant if version.is_none_or(|v| v == ONLINE) => {
                Some(self.clock.cutoff(Duration::zero()))
            }
            _ => None,
        };
        Ok(resolver::validity_intervals(&records, schema.kind, extend_to))
    }

    fn checked_kind(&self, query: &Query) -> Result<TemporalKind> {
        let schema = self.schemas.get(&query.correction_name)?;
        schema.validate_filter(&query.labels)?;
        Ok(schema.kind)
    }

    fn resolve_time(&self, kind: TemporalKind, time: &TimeQuery) -> Result<ResolvedTime> {
        match time {
            TimeQuery::At(t) => Ok(ResolvedTime::At(normalize(*t))),
            TimeQuery::Range { left, right } => {
                let (left, right) = (normalize(*left), normalize(*right));
                if left >= right {
                    return Err(CorrectionError::InvalidRecord(format!(
                        "query range [{}, {}) is empty",
                        format_time(left),
                        format_time(right)
                    )));
                }
                Ok(ResolvedTime::Range(Span::new(left, right)))
            }
            TimeQuery::Run(run_id) => {
                let span = self.runs.run_span(run_id)?;
                Ok(match kind {
                    TemporalKind::Instant => ResolvedTime::At(span.center()),
                    TemporalKind::Interval => ResolvedTime::Range(span),
                })
            }
        }
    }
}
