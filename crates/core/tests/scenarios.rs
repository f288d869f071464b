//! End-to-end scenarios against a frozen clock.

use std::cell::RefCell;

use chrono::{DateTime, Duration, Utc};
use tempfile::NamedTempFile;

use xedocs::{
    CorrectionError, CorrectionRecord, CorrectionStore, CorrectionValue, Datasource, KeyFilter,
    Label, Labels, MemoryDatasource, Query, RedbDatasource, SchemaRegistry, StoreConfig,
    TemporalKey, WriteOutcome, ONLINE,
};

fn dt(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

const NOW: &str = "2024-05-01T12:00:00Z";

fn store_with(config: StoreConfig) -> CorrectionStore<MemoryDatasource> {
    CorrectionStore::with_datasource(MemoryDatasource::new(), SchemaRegistry::builtin(), config)
        .unwrap()
        .frozen_at(dt(NOW))
}

fn cutoff<D: Datasource>(store: &CorrectionStore<D>) -> DateTime<Utc> {
    store.clock().cutoff(Duration::zero())
}

fn se_gain(version: &str, at: DateTime<Utc>, value: f64) -> CorrectionRecord {
    CorrectionRecord::sample("se_gain", version, at, value)
}

#[test]
fn flat_samples_interpolate_to_the_same_value() {
    let store = store_with(StoreConfig {
        min_sample_spacing_ms: 10_000,
        ..StoreConfig::default()
    });
    let t = dt("2023-02-01T00:00:00Z");
    for offset in [0, 50, 120] {
        store
            .insert(se_gain("v1", t + Duration::seconds(offset), 2.0))
            .unwrap();
    }

    let found = store
        .find_one(&Query::new("se_gain").version("v1").at(t + Duration::seconds(25)))
        .unwrap();
    assert_eq!(found.value.as_f64(), Some(2.0));
    assert_eq!(found.labels["partition"], Label::from("all_tpc"));

    let crowded = store.insert(se_gain("v1", t + Duration::seconds(55), 2.0));
    assert!(matches!(crowded, Err(CorrectionError::Overlap(_))));
}

#[test]
fn online_sample_extrapolates_backwards_to_the_query() {
    let store = store_with(StoreConfig::default());
    let at = cutoff(&store) + Duration::seconds(2);
    assert_eq!(
        store.insert(se_gain(ONLINE, at, 5.0)).unwrap(),
        WriteOutcome::Inserted
    );

    let found = store
        .find_one(
            &Query::new("se_gain")
                .version(ONLINE)
                .at(cutoff(&store) + Duration::seconds(1)),
        )
        .unwrap();
    assert_eq!(found.value.as_f64(), Some(5.0));
    assert_eq!(found.time, TemporalKey::Instant(at));
}

#[test]
fn backdated_online_sample_is_rejected() {
    let store = store_with(StoreConfig::default());
    let err = store
        .insert(se_gain(ONLINE, cutoff(&store) - Duration::seconds(10), 5.0))
        .unwrap_err();
    assert!(matches!(err, CorrectionError::Insertion(_)));
}

#[test]
fn past_interval_is_readable_and_append_only() {
    let store = store_with(StoreConfig::default());
    let window = CorrectionRecord::interval(
        "s1_aft_xyz_maps",
        "v2",
        dt("2020-01-01T00:00:00Z"),
        dt("2020-06-01T00:00:00Z"),
        "s1_aft_map_v2.json",
    )
    .unwrap();
    store.insert(window.clone()).unwrap();

    let found = store
        .find_one(&Query::new("s1_aft_xyz_maps").version("v2").at(dt("2020-03-01T00:00:00Z")))
        .unwrap();
    assert!(matches!(found.value, CorrectionValue::Text(ref s) if s == "s1_aft_map_v2.json"));

    assert!(matches!(
        store.delete(&window.key()),
        Err(CorrectionError::AppendOnly(_))
    ));
}

#[test]
fn range_queries_return_stored_records() {
    let store = store_with(StoreConfig::default());
    for (left, right) in [
        ("2021-01-01T00:00:00Z", "2021-02-01T00:00:00Z"),
        ("2021-02-01T00:00:00Z", "2021-03-01T00:00:00Z"),
        ("2021-05-01T00:00:00Z", "2021-06-01T00:00:00Z"),
    ] {
        store
            .insert(
                CorrectionRecord::interval("z_bias_map", "v1", dt(left), dt(right), left).unwrap(),
            )
            .unwrap();
    }
    let hits = store
        .find(&Query::new("z_bias_map").range(
            dt("2021-01-15T00:00:00Z"),
            dt("2021-05-01T00:00:00Z"),
        ))
        .unwrap();
    let lefts: Vec<_> = hits.iter().map(|r| r.time.sort_value()).collect();
    assert_eq!(
        lefts,
        vec![dt("2021-01-01T00:00:00Z"), dt("2021-02-01T00:00:00Z")]
    );

    let spans = store
        .validity_intervals("z_bias_map", Some("v1"), &Labels::new())
        .unwrap();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0].right, dt("2021-03-01T00:00:00Z"));
}

#[test]
fn per_pmt_gains_resolve_on_their_own_samples() {
    let store = store_with(StoreConfig::default());
    let gain = |pmt: i64, at: &str, v: f64| {
        CorrectionRecord::sample("pmt_gains", "v1", dt(at), v)
            .with_label("detector", "tpc")
            .with_label("pmt", pmt)
    };
    for record in [
        gain(0, "2023-01-01T00:00:00Z", 1.0),
        gain(0, "2023-01-03T00:00:00Z", 3.0),
        gain(1, "2023-01-02T00:00:00Z", 7.0),
        gain(2, "2022-12-01T00:00:00Z", 9.0),
        gain(2, "2023-01-02T12:00:00Z", 11.0),
    ] {
        store.insert(record).unwrap();
    }

    let query = Query::new("pmt_gains")
        .version("v1")
        .label("detector", "tpc")
        .at(dt("2023-01-02T00:00:00Z"));
    let gains = store.find_per_label(&query, "pmt").unwrap();
    let values: Vec<(Label, f64)> = gains
        .into_iter()
        .map(|(pmt, r)| (pmt, r.value.as_f64().unwrap()))
        .collect();
    assert_eq!(values.len(), 3);
    assert_eq!(values[0], (Label::Integer(0), 2.0));
    assert_eq!(values[1], (Label::Integer(1), 7.0));
    assert_eq!(values[2].0, Label::Integer(2));
    assert!(values[2].1 > 10.0 && values[2].1 < 11.0);

    assert!(matches!(
        store.find_per_label(&query, "channel"),
        Err(CorrectionError::InvalidRecord(_))
    ));
}

#[test]
fn redb_backed_store_enforces_the_same_rules() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap();
    let store = CorrectionStore::open(path, SchemaRegistry::builtin(), StoreConfig::default())
        .unwrap()
        .frozen_at(dt(NOW));

    let t = dt("2023-01-01T00:00:00Z");
    store.insert(se_gain("v1", t, 30.0)).unwrap();
    assert!(matches!(
        store.insert(se_gain("v1", t, 31.0)),
        Err(CorrectionError::Update(_))
    ));
    let stored = store
        .datasource()
        .find(&KeyFilter::new("se_gain"))
        .unwrap();
    assert_eq!(stored.len(), 1);
}

// ---------------------------------------------------------------------------
// Racing writers
// ---------------------------------------------------------------------------

/// Stores `competitor` just before the first insert it is asked to do, as
/// if another writer had won the race.
struct RacingDatasource {
    inner: MemoryDatasource,
    competitor: RefCell<Option<CorrectionRecord>>,
}

impl Datasource for RacingDatasource {
    fn find(&self, filter: &KeyFilter) -> xedocs::Result<Vec<CorrectionRecord>> {
        self.inner.find(filter)
    }

    fn insert(&self, record: &CorrectionRecord) -> xedocs::Result<()> {
        if let Some(competitor) = self.competitor.borrow_mut().take() {
            self.inner.insert(&competitor)?;
        }
        self.inner.insert(record)
    }

    fn replace(&self, expected: &CorrectionRecord, record: &CorrectionRecord) -> xedocs::Result<()> {
        self.inner.replace(expected, record)
    }

    fn remove(&self, expected: &CorrectionRecord) -> xedocs::Result<()> {
        self.inner.remove(expected)
    }
}

fn racing_store(competitor: CorrectionRecord) -> CorrectionStore<RacingDatasource> {
    let datasource = RacingDatasource {
        inner: MemoryDatasource::new(),
        competitor: RefCell::new(Some(competitor)),
    };
    CorrectionStore::with_datasource(datasource, SchemaRegistry::builtin(), StoreConfig::default())
        .unwrap()
        .frozen_at(dt(NOW))
}

#[test]
fn lost_race_is_revalidated_into_a_policy_error() {
    let t = dt("2023-01-01T00:00:00Z");
    let competitor = se_gain("v1", t, 30.0).with_label("partition", "all_tpc");
    let store = racing_store(competitor);
    assert!(matches!(
        store.insert(se_gain("v1", t, 31.0)),
        Err(CorrectionError::Update(_))
    ));
}

#[test]
fn lost_race_with_the_same_value_is_unchanged() {
    let t = dt("2023-01-01T00:00:00Z");
    let competitor = se_gain("v1", t, 30.0).with_label("partition", "all_tpc");
    let store = racing_store(competitor);
    assert_eq!(
        store.insert(se_gain("v1", t, 30.0)).unwrap(),
        WriteOutcome::Unchanged
    );
}

#[test]
fn redb_datasource_reports_duplicate_inserts_as_conflicts() {
    let datasource = RedbDatasource::open_in_memory().unwrap();
    let record = se_gain("v1", dt("2023-01-01T00:00:00Z"), 30.0)
        .with_label("partition", "all_tpc");
    datasource.insert(&record).unwrap();
    assert!(matches!(
        datasource.insert(&record),
        Err(CorrectionError::Conflict(_))
    ));
}
