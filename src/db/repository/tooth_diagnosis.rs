use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::*;

/// Timestamp format for `updated_at`: RFC 3339, fixed width so text order is time order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn insert_tooth_row(conn: &Connection, row: &ToothRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO tooth_diagnoses (id, patient_id, consultation_id, tooth_number, status,
                primary_diagnosis, recommended_treatment, notes, examination_date, color, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            row.id.to_string(),
            row.patient_id.to_string(),
            row.consultation_id.map(|id| id.to_string()),
            row.tooth_number,
            row.status,
            row.primary_diagnosis,
            row.recommended_treatment,
            row.notes,
            row.examination_date.map(|d| d.to_string()),
            row.color,
            format_timestamp(&row.updated_at),
        ],
    )?;
    Ok(())
}

/// All diagnosis rows for a patient, optionally narrowed to one consultation,
/// newest first.
pub fn select_tooth_rows(
    conn: &Connection,
    patient_id: &Uuid,
    consultation_id: Option<&Uuid>,
) -> Result<Vec<ToothRow>, DatabaseError> {
    let mut sql = String::from(
        "SELECT id, patient_id, consultation_id, tooth_number, status, primary_diagnosis,
                recommended_treatment, notes, examination_date, color, updated_at
         FROM tooth_diagnoses WHERE patient_id = ?1",
    );
    let mut bound: Vec<String> = vec![patient_id.to_string()];
    if let Some(cid) = consultation_id {
        sql.push_str(" AND consultation_id = ?2");
        bound.push(cid.to_string());
    }
    sql.push_str(" ORDER BY updated_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(bound.iter()), |row| {
        Ok(RawToothRow {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            consultation_id: row.get(2)?,
            tooth_number: row.get(3)?,
            status: row.get(4)?,
            primary_diagnosis: row.get(5)?,
            recommended_treatment: row.get(6)?,
            notes: row.get(7)?,
            examination_date: row.get(8)?,
            color: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_row()?);
    }
    Ok(out)
}

/// Write a record back to storage.
///
/// Matches an existing row by id, then by (patient, consultation, tooth);
/// inserts a new row when neither exists. Returns the stored row.
pub fn upsert_tooth_diagnosis(
    conn: &Connection,
    record: &ToothRecord,
) -> Result<ToothRow, DatabaseError> {
    upsert_tooth_diagnosis_at(conn, record, Utc::now())
}

pub fn upsert_tooth_diagnosis_at(
    conn: &Connection,
    record: &ToothRecord,
    at: DateTime<Utc>,
) -> Result<ToothRow, DatabaseError> {
    let existing = match record.id {
        Some(id) => find_id(conn, "SELECT id FROM tooth_diagnoses WHERE id = ?1", &[id.to_string()])?,
        None => None,
    };
    let existing = match existing {
        Some(id) => Some(id),
        None => find_by_tooth(conn, &record.scope, &record.key)?,
    };

    let row = ToothRow {
        id: existing.or(record.id).unwrap_or_else(Uuid::new_v4),
        patient_id: record.scope.patient_id,
        consultation_id: record.scope.consultation_id,
        tooth_number: record.key.as_str().to_string(),
        status: record.status.clone(),
        primary_diagnosis: record.primary_diagnosis.clone(),
        recommended_treatment: record.recommended_treatment.clone(),
        notes: record.notes.clone(),
        examination_date: record.examination_date,
        color: record.color_override.clone(),
        updated_at: at,
    };

    if existing.is_some() {
        conn.execute(
            "UPDATE tooth_diagnoses SET status = ?2, primary_diagnosis = ?3,
                    recommended_treatment = ?4, notes = ?5, examination_date = ?6,
                    color = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                row.id.to_string(),
                row.status,
                row.primary_diagnosis,
                row.recommended_treatment,
                row.notes,
                row.examination_date.map(|d| d.to_string()),
                row.color,
                format_timestamp(&row.updated_at),
            ],
        )?;
    } else {
        insert_tooth_row(conn, &row)?;
    }
    Ok(row)
}

pub fn delete_tooth_diagnosis(conn: &Connection, id: &Uuid) -> Result<ToothRow, DatabaseError> {
    let row = get_tooth_row(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "tooth_diagnosis".into(),
        id: id.to_string(),
    })?;
    conn.execute("DELETE FROM tooth_diagnoses WHERE id = ?1", params![id.to_string()])?;
    Ok(row)
}

pub fn get_tooth_row(conn: &Connection, id: &Uuid) -> Result<Option<ToothRow>, DatabaseError> {
    let raw = conn
        .query_row(
            "SELECT id, patient_id, consultation_id, tooth_number, status, primary_diagnosis,
                    recommended_treatment, notes, examination_date, color, updated_at
             FROM tooth_diagnoses WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok(RawToothRow {
                    id: row.get(0)?,
                    patient_id: row.get(1)?,
                    consultation_id: row.get(2)?,
                    tooth_number: row.get(3)?,
                    status: row.get(4)?,
                    primary_diagnosis: row.get(5)?,
                    recommended_treatment: row.get(6)?,
                    notes: row.get(7)?,
                    examination_date: row.get(8)?,
                    color: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            },
        )
        .optional()?;
    raw.map(RawToothRow::into_row).transpose()
}

fn find_by_tooth(
    conn: &Connection,
    scope: &ChartScope,
    key: &ToothKey,
) -> Result<Option<Uuid>, DatabaseError> {
    match scope.consultation_id {
        Some(cid) => find_id(
            conn,
            "SELECT id FROM tooth_diagnoses
             WHERE patient_id = ?1 AND consultation_id = ?2 AND tooth_number = ?3",
            &[scope.patient_id.to_string(), cid.to_string(), key.to_string()],
        ),
        None => find_id(
            conn,
            "SELECT id FROM tooth_diagnoses
             WHERE patient_id = ?1 AND consultation_id IS NULL AND tooth_number = ?2",
            &[scope.patient_id.to_string(), key.to_string()],
        ),
    }
}

fn find_id(conn: &Connection, sql: &str, bound: &[String]) -> Result<Option<Uuid>, DatabaseError> {
    let id: Option<String> = conn
        .query_row(sql, rusqlite::params_from_iter(bound.iter()), |row| row.get(0))
        .optional()?;
    id.map(|s| parse_uuid("id", &s)).transpose()
}

pub(super) fn parse_uuid(column: &'static str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::InvalidColumn {
        column,
        reason: e.to_string(),
    })
}

struct RawToothRow {
    id: String,
    patient_id: String,
    consultation_id: Option<String>,
    tooth_number: String,
    status: Option<String>,
    primary_diagnosis: Option<String>,
    recommended_treatment: Option<String>,
    notes: Option<String>,
    examination_date: Option<String>,
    color: Option<String>,
    updated_at: String,
}

impl RawToothRow {
    fn into_row(self) -> Result<ToothRow, DatabaseError> {
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DatabaseError::InvalidColumn {
                column: "updated_at",
                reason: e.to_string(),
            })?;
        Ok(ToothRow {
            id: parse_uuid("id", &self.id)?,
            patient_id: parse_uuid("patient_id", &self.patient_id)?,
            consultation_id: self
                .consultation_id
                .as_deref()
                .map(|s| parse_uuid("consultation_id", s))
                .transpose()?,
            tooth_number: self.tooth_number,
            status: self.status,
            primary_diagnosis: self.primary_diagnosis,
            recommended_treatment: self.recommended_treatment,
            notes: self.notes,
            examination_date: self
                .examination_date
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            color: self.color,
            updated_at,
        })
    }
}
