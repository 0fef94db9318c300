//! Input boundary for externally supplied tooth data.
//!
//! Hosts hand over loosely shaped JSON (`currentStatus` in one screen,
//! `status` in another, camelCase or snake_case). `normalize_override` is the
//! only place those shapes are mapped onto `ToothOverride`; nothing past this
//! point sees an alias.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{ToothKey, ToothOverride};

const ID_FIELDS: &[&str] = &["id", "diagnosisId", "diagnosis_id"];
const STATUS_FIELDS: &[&str] = &["status", "currentStatus", "current_status", "condition"];
const DIAGNOSIS_FIELDS: &[&str] = &["primaryDiagnosis", "primary_diagnosis", "diagnosis"];
const TREATMENT_FIELDS: &[&str] = &["recommendedTreatment", "recommended_treatment", "treatment"];
const NOTES_FIELDS: &[&str] = &["notes", "observations", "comment"];
const DATE_FIELDS: &[&str] = &["examinationDate", "examination_date", "date"];
const COLOR_FIELDS: &[&str] = &["colorOverride", "color_override", "color"];
const KEY_FIELDS: &[&str] = &["toothNumber", "tooth_number", "tooth", "key"];

/// Map one external tooth object onto the canonical override shape.
///
/// Returns `None` for non-objects. The first alias present with a non-empty
/// string value wins; unparseable ids and dates are dropped.
pub fn normalize_override(value: &Value) -> Option<ToothOverride> {
    let obj = value.as_object()?;
    Some(ToothOverride {
        id: text(obj, ID_FIELDS).and_then(|s| Uuid::parse_str(&s).ok()),
        status: text(obj, STATUS_FIELDS),
        primary_diagnosis: text(obj, DIAGNOSIS_FIELDS),
        recommended_treatment: text(obj, TREATMENT_FIELDS),
        notes: text(obj, NOTES_FIELDS),
        examination_date: text(obj, DATE_FIELDS).and_then(|s| parse_date(&s)),
        color_override: text(obj, COLOR_FIELDS),
    })
}

/// Normalize a whole overlay: either an object keyed by tooth number, or an
/// array of objects that carry their own tooth number.
pub fn normalize_overlay(value: &Value) -> BTreeMap<ToothKey, ToothOverride> {
    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (key, entry) in map {
                if let Some(ov) = normalize_override(entry) {
                    out.insert(ToothKey::new(key), ov);
                }
            }
        }
        Value::Array(items) => {
            for entry in items {
                let key = entry.as_object().and_then(|obj| text(obj, KEY_FIELDS));
                if let (Some(key), Some(ov)) = (key, normalize_override(entry)) {
                    out.insert(ToothKey::new(key), ov);
                }
            }
        }
        _ => {}
    }
    out
}

fn text(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|field| match obj.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}
