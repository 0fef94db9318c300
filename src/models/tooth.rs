use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one tooth within a chart (FDI number as text, e.g. "16").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToothKey(String);

impl ToothKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ToothKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ToothKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl std::fmt::Display for ToothKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which chart is shown: one patient, optionally narrowed to one consultation.
///
/// `consultation_id == None` means "latest record per tooth across all consultations".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChartScope {
    pub patient_id: Uuid,
    pub consultation_id: Option<Uuid>,
}

impl ChartScope {
    pub fn patient(patient_id: Uuid) -> Self {
        Self {
            patient_id,
            consultation_id: None,
        }
    }

    pub fn consultation(patient_id: Uuid, consultation_id: Uuid) -> Self {
        Self {
            patient_id,
            consultation_id: Some(consultation_id),
        }
    }
}

/// Canonical per-tooth record held in the entity store.
///
/// `status` is the explicit status text as stored; it may be absent or not a
/// canonical value. The canonical status is only known after derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToothRecord {
    pub id: Option<Uuid>,
    pub key: ToothKey,
    pub scope: ChartScope,
    pub status: Option<String>,
    pub primary_diagnosis: Option<String>,
    pub recommended_treatment: Option<String>,
    pub notes: Option<String>,
    pub examination_date: Option<NaiveDate>,
    pub color_override: Option<String>,
    /// Display only. Never used to order writes.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ToothRecord {
    /// An empty record for a tooth with no stored diagnosis.
    pub fn blank(key: ToothKey, scope: ChartScope) -> Self {
        Self {
            id: None,
            key,
            scope,
            status: None,
            primary_diagnosis: None,
            recommended_treatment: None,
            notes: None,
            examination_date: None,
            color_override: None,
            updated_at: None,
        }
    }

    pub fn from_row(row: ToothRow, scope: ChartScope) -> Self {
        Self {
            id: Some(row.id),
            key: ToothKey::new(&row.tooth_number),
            scope,
            status: row.status,
            primary_diagnosis: row.primary_diagnosis,
            recommended_treatment: row.recommended_treatment,
            notes: row.notes,
            examination_date: row.examination_date,
            color_override: row.color,
            updated_at: Some(row.updated_at),
        }
    }
}

/// Caller-supplied replacement for one tooth.
///
/// Whole-record semantics: when present for a key, these fields are the
/// entire record for that key. Fields left `None` are absent, they are
/// never filled in from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToothOverride {
    pub id: Option<Uuid>,
    pub status: Option<String>,
    pub primary_diagnosis: Option<String>,
    pub recommended_treatment: Option<String>,
    pub notes: Option<String>,
    pub examination_date: Option<NaiveDate>,
    pub color_override: Option<String>,
}

impl ToothOverride {
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn into_record(self, key: ToothKey, scope: ChartScope) -> ToothRecord {
        ToothRecord {
            id: self.id,
            key,
            scope,
            status: self.status,
            primary_diagnosis: self.primary_diagnosis,
            recommended_treatment: self.recommended_treatment,
            notes: self.notes,
            examination_date: self.examination_date,
            color_override: self.color_override,
            updated_at: None,
        }
    }
}

/// Row shape of the `tooth_diagnoses` table as returned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToothRow {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub consultation_id: Option<Uuid>,
    pub tooth_number: String,
    pub status: Option<String>,
    pub primary_diagnosis: Option<String>,
    pub recommended_treatment: Option<String>,
    pub notes: Option<String>,
    pub examination_date: Option<NaiveDate>,
    pub color: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tooth_key_trims_input() {
        let key = ToothKey::new(" 16 ");
        assert_eq!(key.as_str(), "16");
        assert_eq!(key, ToothKey::from("16"));
    }

    #[test]
    fn tooth_key_serializes_as_plain_string() {
        let json = serde_json::to_string(&ToothKey::from("21")).unwrap();
        assert_eq!(json, "\"21\"");
    }

    #[test]
    fn override_into_record_keeps_only_its_fields() {
        let scope = ChartScope::patient(Uuid::new_v4());
        let record = ToothOverride::with_status("filled").into_record("16".into(), scope);
        assert_eq!(record.status.as_deref(), Some("filled"));
        assert!(record.primary_diagnosis.is_none());
        assert!(record.id.is_none());
        assert_eq!(record.scope, scope);
    }

    #[test]
    fn row_maps_color_to_override() {
        let patient = Uuid::new_v4();
        let row = ToothRow {
            id: Uuid::new_v4(),
            patient_id: patient,
            consultation_id: None,
            tooth_number: "36".into(),
            status: Some("crown".into()),
            primary_diagnosis: None,
            recommended_treatment: None,
            notes: None,
            examination_date: None,
            color: Some("#123456".into()),
            updated_at: Utc::now(),
        };
        let record = ToothRecord::from_row(row.clone(), ChartScope::patient(patient));
        assert_eq!(record.id, Some(row.id));
        assert_eq!(record.key.as_str(), "36");
        assert_eq!(record.color_override.as_deref(), Some("#123456"));
    }
}
