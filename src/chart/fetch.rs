//! CH-02: Fetch adapter — authoritative snapshot of a chart scope.
//!
//! Stateless and idempotent. Rows arrive as JSON objects (the shape a managed
//! backend returns) and are validated here; one malformed row fails the whole
//! fetch so the core keeps its last-known-good store.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use super::error::SyncError;
use crate::models::{ChartScope, ChartTable, ToothKey, ToothRecord, ToothRow};

/// Row filter for `ChartStorage::select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowFilter {
    pub patient_id: Uuid,
    pub consultation_id: Option<Uuid>,
}

impl From<&ChartScope> for RowFilter {
    fn from(scope: &ChartScope) -> Self {
        Self {
            patient_id: scope.patient_id,
            consultation_id: scope.consultation_id,
        }
    }
}

/// Storage query/write interface consumed by the core.
pub trait ChartStorage: Send + Sync {
    /// Rows of `table` matching `filter`, newest `updated_at` first.
    fn select(&self, table: ChartTable, filter: &RowFilter) -> Result<Vec<Value>, SyncError>;

    /// Persist one record and return it as stored.
    fn upsert_tooth(&self, record: &ToothRecord) -> Result<ToothRecord, SyncError>;
}

/// Load every tooth record for `scope`.
///
/// Without a consultation, several rows may exist per tooth; the one with the
/// latest `updated_at` is kept (on a tie, the first one seen).
pub fn fetch_entities(
    storage: &dyn ChartStorage,
    scope: &ChartScope,
) -> Result<BTreeMap<ToothKey, ToothRecord>, SyncError> {
    let rows = storage.select(ChartTable::ToothDiagnoses, &RowFilter::from(scope))?;

    let mut latest: BTreeMap<ToothKey, ToothRow> = BTreeMap::new();
    let mut foreign = 0usize;

    for value in rows {
        let row = parse_row(value)?;
        if row.patient_id != scope.patient_id {
            foreign += 1;
            continue;
        }
        match latest.entry(ToothKey::new(&row.tooth_number)) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                if row.updated_at > slot.get().updated_at {
                    slot.insert(row);
                }
            }
        }
    }

    if foreign > 0 {
        tracing::warn!(foreign, patient_id = %scope.patient_id, "Dropped rows owned by another patient");
    }

    Ok(latest
        .into_iter()
        .map(|(key, row)| (key, ToothRecord::from_row(row, *scope)))
        .collect())
}

fn parse_row(value: Value) -> Result<ToothRow, SyncError> {
    let row: ToothRow = serde_json::from_value(value).map_err(|e| SyncError::MalformedRow {
        table: ChartTable::ToothDiagnoses,
        reason: e.to_string(),
    })?;
    if row.tooth_number.trim().is_empty() {
        return Err(SyncError::MalformedRow {
            table: ChartTable::ToothDiagnoses,
            reason: format!("row {} has an empty tooth_number", row.id),
        });
    }
    Ok(row)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    /// Canned storage: returns whatever rows it holds, or a scripted error.
    pub(crate) struct StaticStorage {
        pub rows: Mutex<Vec<Value>>,
        pub fail_with: Mutex<Option<String>>,
    }

    impl StaticStorage {
        pub(crate) fn new(rows: Vec<Value>) -> Self {
            Self {
                rows: Mutex::new(rows),
                fail_with: Mutex::new(None),
            }
        }
    }

    impl ChartStorage for StaticStorage {
        fn select(&self, _table: ChartTable, filter: &RowFilter) -> Result<Vec<Value>, SyncError> {
            if let Some(reason) = self.fail_with.lock().unwrap().clone() {
                return Err(SyncError::Unavailable(reason));
            }
            let rows = self.rows.lock().unwrap().clone();
            Ok(rows
                .into_iter()
                .filter(|r| match filter.consultation_id {
                    Some(cid) => r["consultation_id"] == json!(cid.to_string()),
                    None => true,
                })
                .collect())
        }

        fn upsert_tooth(&self, record: &ToothRecord) -> Result<ToothRecord, SyncError> {
            Ok(record.clone())
        }
    }

    pub(crate) fn row_json(
        patient: Uuid,
        consultation: Option<Uuid>,
        tooth: &str,
        status: &str,
        updated_secs: i64,
    ) -> Value {
        let updated: DateTime<Utc> = DateTime::from_timestamp(1_700_000_000 + updated_secs, 0).unwrap();
        json!({
            "id": Uuid::new_v4(),
            "patient_id": patient,
            "consultation_id": consultation,
            "tooth_number": tooth,
            "status": status,
            "primary_diagnosis": null,
            "recommended_treatment": null,
            "notes": null,
            "examination_date": null,
            "color": null,
            "updated_at": updated,
        })
    }

    #[test]
    fn latest_row_per_tooth_wins_without_scope() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, Some(Uuid::new_v4()), "16", "filled", 50),
            row_json(patient, Some(Uuid::new_v4()), "16", "caries", 10),
            row_json(patient, Some(Uuid::new_v4()), "21", "crown", 20),
        ]);

        let map = fetch_entities(&storage, &ChartScope::patient(patient)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&ToothKey::from("16")].status.as_deref(), Some("filled"));
    }

    #[test]
    fn latest_wins_regardless_of_arrival_order() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, None, "16", "caries", 10),
            row_json(patient, None, "16", "filled", 50),
        ]);
        let map = fetch_entities(&storage, &ChartScope::patient(patient)).unwrap();
        assert_eq!(map[&ToothKey::from("16")].status.as_deref(), Some("filled"));
    }

    #[test]
    fn equal_timestamps_keep_first_seen() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, None, "16", "first", 30),
            row_json(patient, None, "16", "second", 30),
        ]);
        let map = fetch_entities(&storage, &ChartScope::patient(patient)).unwrap();
        assert_eq!(map[&ToothKey::from("16")].status.as_deref(), Some("first"));
    }

    #[test]
    fn records_carry_requested_scope() {
        let patient = Uuid::new_v4();
        let visit = Uuid::new_v4();
        let storage = StaticStorage::new(vec![row_json(patient, Some(visit), "11", "veneer", 0)]);
        let scope = ChartScope::consultation(patient, visit);
        let map = fetch_entities(&storage, &scope).unwrap();
        assert_eq!(map[&ToothKey::from("11")].scope, scope);
    }

    #[test]
    fn malformed_row_fails_whole_fetch() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, None, "16", "caries", 0),
            json!({"id": "nope", "tooth_number": 16}),
        ]);
        let err = fetch_entities(&storage, &ChartScope::patient(patient)).unwrap_err();
        assert!(matches!(err, SyncError::MalformedRow { table: ChartTable::ToothDiagnoses, .. }));
    }

    #[test]
    fn empty_tooth_number_is_malformed() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![row_json(patient, None, "  ", "caries", 0)]);
        assert!(matches!(
            fetch_entities(&storage, &ChartScope::patient(patient)),
            Err(SyncError::MalformedRow { .. })
        ));
    }

    #[test]
    fn foreign_rows_are_dropped() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, None, "16", "caries", 0),
            row_json(Uuid::new_v4(), None, "21", "crown", 0),
        ]);
        let map = fetch_entities(&storage, &ChartScope::patient(patient)).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn storage_error_is_surfaced() {
        let storage = StaticStorage::new(vec![]);
        *storage.fail_with.lock().unwrap() = Some("offline".into());
        let err = fetch_entities(&storage, &ChartScope::patient(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, SyncError::Unavailable(_)));
    }

    #[test]
    fn fetch_is_idempotent() {
        let patient = Uuid::new_v4();
        let storage = StaticStorage::new(vec![
            row_json(patient, None, "16", "caries", 0),
            row_json(patient, None, "21", "crown", 5),
        ]);
        let scope = ChartScope::patient(patient);
        assert_eq!(
            fetch_entities(&storage, &scope).unwrap(),
            fetch_entities(&storage, &scope).unwrap()
        );
    }
}
