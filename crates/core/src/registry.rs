//! Run identifiers.
//!
//! Downstream processing addresses data by run rather than by timestamp.
//! A [`RunRegistry`] maps a run id to its `[start, end)` span; sample
//! corrections are evaluated at the centre of the run, interval
//! corrections against the whole span.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::record::Span;
use crate::{CorrectionError, Result};

pub trait RunRegistry {
    /// The `[start, end)` span of `run_id`, or [`CorrectionError::NotFound`].
    fn run_span(&self, run_id: &str) -> Result<Span>;
}

/// A run registry held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticRunRegistry {
    runs: HashMap<String, Span>,
}

impl StaticRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. Fails unless `start < end`.
    pub fn insert(
        &mut self,
        run_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let run_id = run_id.into();
        if start >= end {
            return Err(CorrectionError::InvalidRecord(format!(
                "run {run_id} must start before it ends"
            )));
        }
        self.runs.insert(run_id, Span::new(start, end));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunRegistry for StaticRunRegistry {
    fn run_span(&self, run_id: &str) -> Result<Span> {
        self.runs
            .get(run_id)
            .copied()
            .ok_or_else(|| CorrectionError::NotFound(format!("run {run_id}")))
    }
}
