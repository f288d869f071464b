//! Storage backends.
//!
//! A [`Datasource`] only stores and fetches records; every legality
//! decision is made before it is called. Writes carry the state the caller
//! validated against and the backend refuses them with
//! [`CorrectionError::Conflict`] when that state no longer holds, so a
//! check-then-act race surfaces as an error instead of a silent overwrite.

use std::collections::BTreeMap;
use std::sync::RwLock;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::record::{CorrectionRecord, GroupKey, Labels};
use crate::{CorrectionError, Result};

/// Selects records by correction, optional version and a subset of labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    pub correction_name: String,
    pub version: Option<String>,
    pub labels: Labels,
}

impl KeyFilter {
    pub fn new(correction_name: impl Into<String>) -> Self {
        Self {
            correction_name: correction_name.into(),
            version: None,
            labels: Labels::new(),
        }
    }

    /// Exactly the records of one group.
    pub fn group(key: &GroupKey) -> Self {
        Self {
            correction_name: key.correction_name.clone(),
            version: Some(key.version.clone()),
            labels: key.labels.clone(),
        }
    }

    pub fn matches(&self, record: &CorrectionRecord) -> bool {
        record.correction_name == self.correction_name
            && self.version.as_ref().is_none_or(|v| *v == record.version)
            && self
                .labels
                .iter()
                .all(|(name, value)| record.labels.get(name) == Some(value))
    }

    /// Longest storage-key prefix every matching record is guaranteed to share.
    fn storage_prefix(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}:", self.correction_name, version),
            None => format!("{}:", self.correction_name),
        }
    }
}

pub trait Datasource {
    /// Every stored record matching `filter`, in storage-key order.
    fn find(&self, filter: &KeyFilter) -> Result<Vec<CorrectionRecord>>;

    /// Store a record whose key must not exist yet.
    fn insert(&self, record: &CorrectionRecord) -> Result<()>;

    /// Overwrite `expected` with `record`. Both share a key, and the stored
    /// row must still be exactly `expected`.
    fn replace(&self, expected: &CorrectionRecord, record: &CorrectionRecord) -> Result<()>;

    /// Delete `expected`, which must still be stored unchanged.
    fn remove(&self, expected: &CorrectionRecord) -> Result<()>;
}

fn conflict(what: &str, key: &str) -> CorrectionError {
    CorrectionError::Conflict(format!("{what} {key}"))
}

fn check_same_key(expected: &CorrectionRecord, record: &CorrectionRecord) -> Result<()> {
    if expected.storage_key() != record.storage_key() {
        return Err(CorrectionError::Internal(format!(
            "replace must keep the key: {} -> {}",
            expected.storage_key(),
            record.storage_key()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// A datasource held in a `BTreeMap`, keyed by storage key.
#[derive(Debug, Default)]
pub struct MemoryDatasource {
    rows: RwLock<BTreeMap<String, CorrectionRecord>>,
}

impl MemoryDatasource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bypass every check. Only meant for seeding fixtures.
    pub fn seed(&self, record: CorrectionRecord) -> Result<()> {
        let mut rows = self.write_rows()?;
        rows.insert(record.storage_key(), record);
        Ok(())
    }

    fn read_rows(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, CorrectionRecord>>> {
        self.rows
            .read()
            .map_err(|_| CorrectionError::Internal("datasource lock poisoned".into()))
    }

    fn write_rows(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, CorrectionRecord>>> {
        self.rows
            .write()
            .map_err(|_| CorrectionError::Internal("datasource lock poisoned".into()))
    }
}

impl Datasource for MemoryDatasource {
    fn find(&self, filter: &KeyFilter) -> Result<Vec<CorrectionRecord>> {
        let prefix = filter.storage_prefix();
        let rows = self.read_rows()?;
        Ok(rows
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn insert(&self, record: &CorrectionRecord) -> Result<()> {
        let key = record.storage_key();
        let mut rows = self.write_rows()?;
        if rows.contains_key(&key) {
            return Err(conflict("record already exists at", &key));
        }
        rows.insert(key, record.clone());
        Ok(())
    }

    fn replace(&self, expected: &CorrectionRecord, record: &CorrectionRecord) -> Result<()> {
        check_same_key(expected, record)?;
        let key = record.storage_key();
        let mut rows = self.write_rows()?;
        match rows.get(&key).map(|stored| stored.same_revision(expected)) {
            Some(true) => {
                rows.insert(key, record.clone());
                Ok(())
            }
            Some(false) => Err(conflict("record changed concurrently at", &key)),
            None => Err(conflict("record removed concurrently at", &key)),
        }
    }

    fn remove(&self, expected: &CorrectionRecord) -> Result<()> {
        let key = expected.storage_key();
        let mut rows = self.write_rows()?;
        match rows.get(&key).map(|stored| stored.same_revision(expected)) {
            Some(true) => {
                rows.remove(&key);
                Ok(())
            }
            Some(false) => Err(conflict("record changed concurrently at", &key)),
            None => Err(conflict("record removed concurrently at", &key)),
        }
    }
}

// ---------------------------------------------------------------------------
// redb backend
// ---------------------------------------------------------------------------

/// Storage key -> JSON document (see [`CorrectionRecord::to_document`]).
const CORRECTIONS: TableDefinition<&str, &str> = TableDefinition::new("corrections");

/// A datasource persisted in a redb file.
///
/// redb serialises write transactions, so the expected-state check and the
/// write below happen atomically.
pub struct RedbDatasource {
    db: Database,
}

impl RedbDatasource {
    /// Open or create a database file at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// A database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(CORRECTIONS)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    fn load(raw: &str) -> Result<CorrectionRecord> {
        Ok(serde_json::from_str(raw)?)
    }

    fn dump(record: &CorrectionRecord) -> Result<String> {
        Ok(serde_json::to_string(record)?)
    }

    /// Apply `write` under one write transaction after checking the row at
    /// `key` against `expected` (`None` = must be absent).
    fn write_checked(
        &self,
        key: &str,
        expected: Option<&CorrectionRecord>,
        write: Option<&CorrectionRecord>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CORRECTIONS)?;
            let stored: Option<String> = table.get(key)?.map(|g| g.value().to_string());
            match (stored, expected) {
                (None, None) => {}
                (Some(_), None) => return Err(conflict("record already exists at", key)),
                (None, Some(_)) => return Err(conflict("record removed concurrently at", key)),
                (Some(raw), Some(expected)) => {
                    if !Self::load(&raw)?.same_revision(expected) {
                        return Err(conflict("record changed concurrently at", key));
                    }
                }
            }
            match write {
                Some(record) => {
                    let doc = Self::dump(record)?;
                    table.insert(key, doc.as_str())?;
                }
                None => {
                    table.remove(key)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl Datasource for RedbDatasource {
    fn find(&self, filter: &KeyFilter) -> Result<Vec<CorrectionRecord>> {
        let prefix = filter.storage_prefix();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CORRECTIONS)?;
        let mut results = Vec::new();

        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let record = Self::load(v.value())?;
            if filter.matches(&record) {
                results.push(record);
            }
        }

        Ok(results)
    }

    fn insert(&self, record: &CorrectionRecord) -> Result<()> {
        self.write_checked(&record.storage_key(), None, Some(record))
    }

    fn replace(&self, expected: &CorrectionRecord, record: &CorrectionRecord) -> Result<()> {
        check_same_key(expected, record)?;
        self.write_checked(&record.storage_key(), Some(expected), Some(record))
    }

    fn remove(&self, expected: &CorrectionRecord) -> Result<()> {
        self.write_checked(&expected.storage_key(), Some(expected), None)
    }
}
