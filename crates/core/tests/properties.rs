//! Store-level properties: interpolation, append-only deletes, value
//! immutability, the interval shrink rule and idempotent freezing.

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;

use xedocs::{
    CorrectionError, CorrectionRecord, CorrectionStore, Labels, MemoryDatasource, Query,
    SchemaRegistry, StoreConfig, WriteOutcome, ONLINE,
};

fn dt(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

const NOW: &str = "2024-05-01T12:00:00Z";

/// A store whose cutoff sits at 13:00 on 2024-05-01.
fn store() -> CorrectionStore<MemoryDatasource> {
    CorrectionStore::with_datasource(
        MemoryDatasource::new(),
        SchemaRegistry::builtin(),
        StoreConfig::default(),
    )
    .unwrap()
    .frozen_at(dt(NOW))
}

fn cutoff(store: &CorrectionStore<MemoryDatasource>) -> DateTime<Utc> {
    store.clock().cutoff(Duration::zero())
}

fn light_yield(version: &str, at: DateTime<Utc>, value: f64) -> CorrectionRecord {
    CorrectionRecord::sample("relative_light_yield", version, at, value)
}

fn hotspots(left: DateTime<Utc>, right: DateTime<Utc>, value: &str) -> CorrectionRecord {
    CorrectionRecord::interval("hotspot_vetos", "v1", left, right, value).unwrap()
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn interpolation_hits_samples_and_midpoints(
        gap_ab in 2i64..1_000_000_000,
        gap_bc in 2i64..1_000_000_000,
        a in -1.0e6f64..1.0e6,
        b in -1.0e6f64..1.0e6,
        c in -1.0e6f64..1.0e6,
    ) {
        let store = store();
        let ta = dt("2020-01-01T00:00:00Z");
        let tb = ta + Duration::milliseconds(gap_ab);
        let tc = tb + Duration::milliseconds(gap_bc);
        for (t, v) in [(ta, a), (tb, b), (tc, c)] {
            store.insert(light_yield("v1", t, v)).unwrap();
        }

        let at_b = store
            .find_one(&Query::new("relative_light_yield").version("v1").at(tb))
            .unwrap();
        prop_assert_eq!(at_b.value.as_f64(), Some(b));

        let mid = ta + Duration::milliseconds(gap_ab / 2);
        let fraction = (gap_ab / 2) as f64 / gap_ab as f64;
        let expected = a + fraction * (b - a);
        let at_mid = store
            .find_one(&Query::new("relative_light_yield").version("v1").at(mid))
            .unwrap();
        let got = at_mid.value.as_f64().unwrap();
        let scale = a.abs().max(b.abs()).max(1.0);
        prop_assert!((got - expected).abs() <= 1e-9 * scale, "got {got}, expected {expected}");
        prop_assert_eq!(at_mid.time.sort_value(), mid);
    }
}

#[test]
fn repeated_queries_are_identical() {
    let store = store();
    store
        .insert(light_yield("v1", dt("2024-01-01T00:00:00Z"), 1.0))
        .unwrap();
    store
        .insert(light_yield("v1", dt("2024-01-03T00:00:00Z"), 2.0))
        .unwrap();
    let query = Query::new("relative_light_yield").at(dt("2024-01-02T07:00:00Z"));
    let first = store.find(&query).unwrap();
    let second = store.find(&query).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

// ---------------------------------------------------------------------------
// Append-only deletes
// ---------------------------------------------------------------------------

#[test]
fn deletes_at_or_before_cutoff_are_append_only() {
    let store = store();
    let at_cutoff = light_yield("v1", cutoff(&store), 1.0);
    let before = light_yield("v1", cutoff(&store) - Duration::days(1), 1.0);
    store.insert(before.clone()).unwrap();
    store.insert(at_cutoff.clone()).unwrap();

    for record in [&before, &at_cutoff] {
        assert!(matches!(
            store.delete(&record.key()),
            Err(CorrectionError::AppendOnly(_))
        ));
    }
}

#[test]
fn deletes_after_cutoff_succeed() {
    let store = store();
    let after = light_yield("v1", cutoff(&store) + Duration::milliseconds(1), 1.0);
    store.insert(after.clone()).unwrap();
    assert_eq!(store.delete(&after.key()).unwrap(), WriteOutcome::Removed);
    assert!(store
        .find(&Query::new("relative_light_yield"))
        .unwrap()
        .is_empty());

    let window = hotspots(
        cutoff(&store) + Duration::hours(1),
        cutoff(&store) + Duration::hours(2),
        "vetos_v1.json",
    );
    store.insert(window.clone()).unwrap();
    assert_eq!(store.delete(&window.key()).unwrap(), WriteOutcome::Removed);
}

#[test]
fn deleting_a_missing_record_is_not_found() {
    let store = store();
    let ghost = light_yield("v1", cutoff(&store) + Duration::days(1), 1.0);
    assert!(matches!(
        store.delete(&ghost.key()),
        Err(CorrectionError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Value immutability
// ---------------------------------------------------------------------------

#[test]
fn committed_value_cannot_change() {
    let store = store();
    let t = dt("2024-01-01T00:00:00Z");
    store.insert(light_yield("v1", t, 1.0)).unwrap();

    assert!(matches!(
        store.insert(light_yield("v1", t, 1.5)),
        Err(CorrectionError::Update(_))
    ));
    assert_eq!(
        store.insert(light_yield("v1", t, 1.0)).unwrap(),
        WriteOutcome::Unchanged
    );
}

#[test]
fn future_value_can_change() {
    let store = store();
    let t = cutoff(&store) + Duration::days(2);
    store.insert(light_yield("v1", t, 1.0)).unwrap();
    assert_eq!(
        store.insert(light_yield("v1", t, 1.5)).unwrap(),
        WriteOutcome::Replaced
    );
    let found = store
        .find_one(&Query::new("relative_light_yield").version("v1").at(t))
        .unwrap();
    assert_eq!(found.value.as_f64(), Some(1.5));
}

// ---------------------------------------------------------------------------
// Interval shrink rule
// ---------------------------------------------------------------------------

#[test]
fn interval_can_shrink_only_to_an_uncommitted_edge() {
    let store = store();
    let left = dt("2024-01-01T00:00:00Z");
    let right = cutoff(&store) + Duration::days(30);
    store.insert(hotspots(left, right, "vetos.json")).unwrap();

    let shrunk = cutoff(&store) + Duration::days(10);
    assert_eq!(
        store.insert(hotspots(left, shrunk, "vetos.json")).unwrap(),
        WriteOutcome::Replaced
    );

    let committed = cutoff(&store) - Duration::days(1);
    assert!(matches!(
        store.insert(hotspots(left, committed, "vetos.json")),
        Err(CorrectionError::Update(_))
    ));

    let found = store
        .find_one(&Query::new("hotspot_vetos").at(cutoff(&store) + Duration::days(5)))
        .unwrap();
    assert_eq!(found.time.right(), shrunk);
}

#[test]
fn interval_overlap_is_rejected_across_the_group_only() {
    let store = store();
    store
        .insert(hotspots(
            dt("2023-01-01T00:00:00Z"),
            dt("2023-06-01T00:00:00Z"),
            "a.json",
        ))
        .unwrap();
    assert!(matches!(
        store.insert(hotspots(
            dt("2023-03-01T00:00:00Z"),
            dt("2023-09-01T00:00:00Z"),
            "b.json",
        )),
        Err(CorrectionError::Overlap(_))
    ));

    let other_version = CorrectionRecord::interval(
        "hotspot_vetos",
        "v2",
        dt("2023-03-01T00:00:00Z"),
        dt("2023-09-01T00:00:00Z"),
        "b.json",
    )
    .unwrap();
    assert_eq!(
        store.insert(other_version).unwrap(),
        WriteOutcome::Inserted
    );
}

// ---------------------------------------------------------------------------
// Freeze
// ---------------------------------------------------------------------------

#[test]
fn freezing_twice_writes_at_most_once() {
    let store = store();
    store
        .datasource()
        .seed(light_yield(ONLINE, dt("2024-04-01T00:00:00Z"), 0.8))
        .unwrap();

    let first = store.freeze("relative_light_yield", &Labels::new()).unwrap();
    let second = store.freeze("relative_light_yield", &Labels::new()).unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(
        store
            .find(&Query::new("relative_light_yield").version(ONLINE))
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn deleting_the_latest_online_sample_keeps_reported_history() {
    let store = store();
    store
        .datasource()
        .seed(light_yield(ONLINE, dt("2024-04-01T00:00:00Z"), 0.8))
        .unwrap();
    let future = light_yield(ONLINE, cutoff(&store) + Duration::hours(5), 0.9);
    store.insert(future.clone()).unwrap();

    // Between the pinned sample and the future one the value interpolates,
    // but at the cutoff it still reads 0.8.
    let at_cutoff = Query::new("relative_light_yield")
        .version(ONLINE)
        .at(cutoff(&store));
    assert_eq!(store.find_one(&at_cutoff).unwrap().value.as_f64(), Some(0.8));

    store.delete(&future.key()).unwrap();
    assert_eq!(store.find_one(&at_cutoff).unwrap().value.as_f64(), Some(0.8));
    let later = Query::new("relative_light_yield")
        .version(ONLINE)
        .at(cutoff(&store) + Duration::days(3));
    assert_eq!(store.find_one(&later).unwrap().value.as_f64(), Some(0.8));
}
