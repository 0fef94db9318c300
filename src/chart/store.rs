//! CH-01: Entity store — best-known record per tooth for one chart scope.
//!
//! Key properties:
//! - Exactly one record per key; a successful fetch replaces the map wholesale
//! - Records are never mutated in place; unchanged records keep their `Arc`
//! - Keys frozen by an active override are not touched by a fetch
//! - Lifecycle is explicit: `create(scope)` … `dispose()`, one store per scope

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{ChartScope, ToothKey, ToothRecord};

/// What a wholesale replacement changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDiff {
    /// Keys whose record was added or replaced.
    pub changed: Vec<ToothKey>,
    /// Keys no longer present in storage.
    pub removed: Vec<ToothKey>,
    /// Keys whose incoming record was held back by an override.
    pub suppressed: Vec<ToothKey>,
}

impl StoreDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
pub struct EntityStore {
    scope: ChartScope,
    records: BTreeMap<ToothKey, Arc<ToothRecord>>,
    /// Set by the first successful replacement.
    last_synced_at: Option<DateTime<Utc>>,
}

impl EntityStore {
    /// Empty store bound to `scope`.
    pub fn create(scope: ChartScope) -> Self {
        tracing::debug!(patient_id = %scope.patient_id, consultation_id = ?scope.consultation_id, "Entity store created");
        Self {
            scope,
            records: BTreeMap::new(),
            last_synced_at: None,
        }
    }

    pub fn scope(&self) -> &ChartScope {
        &self.scope
    }

    pub fn get(&self, key: &ToothKey) -> Option<&Arc<ToothRecord>> {
        self.records.get(key)
    }

    pub fn records(&self) -> &BTreeMap<ToothKey, Arc<ToothRecord>> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether at least one fetch has been applied.
    pub fn is_loaded(&self) -> bool {
        self.last_synced_at.is_some()
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Replace every record with `fresh`, except keys in `frozen`, which keep
    /// whatever they held before (including nothing).
    pub fn replace_all(
        &mut self,
        fresh: BTreeMap<ToothKey, ToothRecord>,
        frozen: &BTreeSet<ToothKey>,
        synced_at: DateTime<Utc>,
    ) -> StoreDiff {
        let mut diff = StoreDiff::default();
        let mut next: BTreeMap<ToothKey, Arc<ToothRecord>> = BTreeMap::new();

        for (key, record) in fresh {
            if frozen.contains(&key) {
                if self.records.get(&key).map(|r| r.as_ref()) != Some(&record) {
                    diff.suppressed.push(key);
                }
                continue;
            }
            match self.records.get(&key) {
                Some(existing) if existing.as_ref() == &record => {
                    next.insert(key, Arc::clone(existing));
                }
                _ => {
                    diff.changed.push(key.clone());
                    next.insert(key, Arc::new(record));
                }
            }
        }

        for (key, existing) in &self.records {
            if frozen.contains(key) {
                next.insert(key.clone(), Arc::clone(existing));
            } else if !next.contains_key(key) {
                diff.removed.push(key.clone());
            }
        }

        self.records = next;
        self.last_synced_at = Some(synced_at);
        diff
    }

    /// End of life for this scope's data.
    pub fn dispose(self) {
        tracing::debug!(
            patient_id = %self.scope.patient_id,
            records = self.records.len(),
            "Entity store disposed"
        );
    }
}
