use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::tooth_diagnosis::{format_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointments (id, patient_id, tooth_number, status, scheduled_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            appt.id.to_string(),
            appt.patient_id.to_string(),
            appt.tooth_number,
            appt.status.as_str(),
            format_timestamp(&appt.scheduled_at),
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Move an appointment to a new status. Returns the owning patient id.
pub fn update_appointment_status(
    conn: &Connection,
    id: &Uuid,
    status: AppointmentStatus,
) -> Result<Uuid, DatabaseError> {
    let patient_id = owner_of(conn, "appointments", id)?;
    conn.execute(
        "UPDATE appointments SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), status.as_str(), format_timestamp(&Utc::now())],
    )?;
    Ok(patient_id)
}

/// A patient's appointments, most recently updated first.
pub fn select_appointments(conn: &Connection, patient_id: &Uuid) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, tooth_number, status, scheduled_at
         FROM appointments WHERE patient_id = ?1 ORDER BY updated_at DESC",
    )?;
    let rows = stmt.query_map(params![patient_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, patient_id, tooth_number, status, scheduled_at) = row?;
        out.push(Appointment {
            id: parse_uuid("id", &id)?,
            patient_id: parse_uuid("patient_id", &patient_id)?,
            tooth_number,
            status: status.parse()?,
            scheduled_at: DateTime::parse_from_rfc3339(&scheduled_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DatabaseError::InvalidColumn {
                    column: "scheduled_at",
                    reason: e.to_string(),
                })?,
        });
    }
    Ok(out)
}

pub(super) fn owner_of(conn: &Connection, table: &str, id: &Uuid) -> Result<Uuid, DatabaseError> {
    let sql = format!("SELECT patient_id FROM {table} WHERE id = ?1");
    let owner: Option<String> = conn
        .query_row(&sql, params![id.to_string()], |row| row.get(0))
        .optional()?;
    let owner = owner.ok_or_else(|| DatabaseError::NotFound {
        entity_type: table.to_string(),
        id: id.to_string(),
    })?;
    parse_uuid("patient_id", &owner)
}
