use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::appointment::owner_of;
use super::tooth_diagnosis::{format_timestamp, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_treatment_plan(conn: &Connection, plan: &TreatmentPlan) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO treatment_plans (id, patient_id, tooth_number, title, status,
                sessions_planned, sessions_done, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            plan.id.to_string(),
            plan.patient_id.to_string(),
            plan.tooth_number,
            plan.title,
            plan.status.as_str(),
            plan.sessions_planned,
            plan.sessions_done,
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Returns the owning patient id.
pub fn update_treatment_plan_status(
    conn: &Connection,
    id: &Uuid,
    status: TreatmentPlanStatus,
) -> Result<Uuid, DatabaseError> {
    let patient_id = owner_of(conn, "treatment_plans", id)?;
    conn.execute(
        "UPDATE treatment_plans SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), status.as_str(), format_timestamp(&Utc::now())],
    )?;
    Ok(patient_id)
}

/// Record one more completed session without touching the plan status.
pub fn record_treatment_session(conn: &Connection, id: &Uuid) -> Result<Uuid, DatabaseError> {
    let patient_id = owner_of(conn, "treatment_plans", id)?;
    conn.execute(
        "UPDATE treatment_plans SET sessions_done = sessions_done + 1, updated_at = ?2
         WHERE id = ?1",
        params![id.to_string(), format_timestamp(&Utc::now())],
    )?;
    Ok(patient_id)
}

/// A patient's treatment plans, most recently updated first.
pub fn select_treatment_plans(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Vec<TreatmentPlan>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, tooth_number, title, status, sessions_planned, sessions_done
         FROM treatment_plans WHERE patient_id = ?1 ORDER BY updated_at DESC",
    )?;
    let rows = stmt.query_map(params![patient_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, u32>(5)?,
            row.get::<_, u32>(6)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, patient_id, tooth_number, title, status, sessions_planned, sessions_done) = row?;
        out.push(TreatmentPlan {
            id: parse_uuid("id", &id)?,
            patient_id: parse_uuid("patient_id", &patient_id)?,
            tooth_number,
            title,
            status: status.parse()?,
            sessions_planned,
            sessions_done,
        });
    }
    Ok(out)
}
