//! Repository layer — table-scoped database operations for the chart.

mod appointment;
mod tooth_diagnosis;
mod treatment_plan;

pub use appointment::*;
pub use tooth_diagnosis::*;
pub use treatment_plan::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::db::DatabaseError;
    use crate::models::*;
    use chrono::{DateTime, Duration, NaiveDate, Utc};
    use rusqlite::Connection;
    use uuid::Uuid;

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(patient: Uuid, consultation: Option<Uuid>, tooth: &str, status: &str, updated: DateTime<Utc>) -> ToothRow {
        ToothRow {
            id: Uuid::new_v4(),
            patient_id: patient,
            consultation_id: consultation,
            tooth_number: tooth.into(),
            status: Some(status.into()),
            primary_diagnosis: None,
            recommended_treatment: None,
            notes: None,
            examination_date: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            color: None,
            updated_at: updated,
        }
    }

    #[test]
    fn select_returns_newest_first() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        insert_tooth_row(&conn, &row(patient, None, "16", "caries", at(0))).unwrap();
        insert_tooth_row(&conn, &row(patient, None, "21", "crown", at(10))).unwrap();

        let rows = select_tooth_rows(&conn, &patient, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tooth_number, "21");
        assert_eq!(rows[1].tooth_number, "16");
        assert_eq!(rows[1].updated_at, at(0));
        assert_eq!(rows[1].examination_date, NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[test]
    fn select_filters_by_patient_and_consultation() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        let other = Uuid::new_v4();
        let visit_a = Uuid::new_v4();
        let visit_b = Uuid::new_v4();
        insert_tooth_row(&conn, &row(patient, Some(visit_a), "16", "caries", at(0))).unwrap();
        insert_tooth_row(&conn, &row(patient, Some(visit_b), "16", "filled", at(5))).unwrap();
        insert_tooth_row(&conn, &row(other, Some(visit_a), "11", "missing", at(5))).unwrap();

        let all = select_tooth_rows(&conn, &patient, None).unwrap();
        assert_eq!(all.len(), 2);

        let scoped = select_tooth_rows(&conn, &patient, Some(&visit_a)).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].status.as_deref(), Some("caries"));
    }

    #[test]
    fn upsert_inserts_then_updates_same_tooth() {
        let conn = test_db();
        let scope = ChartScope::consultation(Uuid::new_v4(), Uuid::new_v4());
        let mut record = ToothRecord::blank("16".into(), scope);
        record.status = Some("caries".into());

        let first = upsert_tooth_diagnosis_at(&conn, &record, at(0)).unwrap();
        record.status = Some("filled".into());
        let second = upsert_tooth_diagnosis_at(&conn, &record, at(30)).unwrap();

        assert_eq!(first.id, second.id, "Same tooth in same scope reuses the row");
        let rows = select_tooth_rows(&conn, &scope.patient_id, scope.consultation_id.as_ref()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status.as_deref(), Some("filled"));
        assert_eq!(rows[0].updated_at, at(30));
    }

    #[test]
    fn upsert_by_id_keeps_identity() {
        let conn = test_db();
        let scope = ChartScope::patient(Uuid::new_v4());
        let stored = upsert_tooth_diagnosis(&conn, &ToothRecord::blank("48".into(), scope)).unwrap();

        let mut record = ToothRecord::blank("48".into(), scope);
        record.id = Some(stored.id);
        record.notes = Some("impacted".into());
        let updated = upsert_tooth_diagnosis(&conn, &record).unwrap();

        assert_eq!(updated.id, stored.id);
        let reloaded = get_tooth_row(&conn, &stored.id).unwrap().unwrap();
        assert_eq!(reloaded.notes.as_deref(), Some("impacted"));
    }

    #[test]
    fn delete_missing_row_is_not_found() {
        let conn = test_db();
        match delete_tooth_diagnosis(&conn, &Uuid::new_v4()) {
            Err(DatabaseError::NotFound { entity_type, .. }) => {
                assert_eq!(entity_type, "tooth_diagnosis")
            }
            other => panic!("Expected NotFound, got: {other:?}"),
        }
    }

    #[test]
    fn delete_returns_removed_row() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        let r = row(patient, None, "26", "implant", at(0));
        insert_tooth_row(&conn, &r).unwrap();

        let removed = delete_tooth_diagnosis(&conn, &r.id).unwrap();
        assert_eq!(removed.tooth_number, "26");
        assert!(select_tooth_rows(&conn, &patient, None).unwrap().is_empty());
    }

    #[test]
    fn appointment_status_update_reports_owner() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        let appt = Appointment {
            id: Uuid::new_v4(),
            patient_id: patient,
            tooth_number: Some("36".into()),
            status: AppointmentStatus::Scheduled,
            scheduled_at: Utc::now() + Duration::days(2),
        };
        insert_appointment(&conn, &appt).unwrap();

        let owner = update_appointment_status(&conn, &appt.id, AppointmentStatus::Completed).unwrap();
        assert_eq!(owner, patient);

        let status: String = conn
            .query_row("SELECT status FROM appointments WHERE id = ?1", [appt.id.to_string()], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "completed");
    }

    #[test]
    fn unknown_appointment_is_not_found() {
        let conn = test_db();
        let result = update_appointment_status(&conn, &Uuid::new_v4(), AppointmentStatus::Cancelled);
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn treatment_plan_session_and_status() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        let plan = TreatmentPlan {
            id: Uuid::new_v4(),
            patient_id: patient,
            tooth_number: Some("46".into()),
            title: "Endodontic treatment".into(),
            status: TreatmentPlanStatus::Planned,
            sessions_planned: 3,
            sessions_done: 0,
        };
        insert_treatment_plan(&conn, &plan).unwrap();

        assert_eq!(record_treatment_session(&conn, &plan.id).unwrap(), patient);
        assert_eq!(
            update_treatment_plan_status(&conn, &plan.id, TreatmentPlanStatus::InProgress).unwrap(),
            patient
        );

        let (status, done): (String, i64) = conn
            .query_row(
                "SELECT status, sessions_done FROM treatment_plans WHERE id = ?1",
                [plan.id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "in_progress");
        assert_eq!(done, 1);
    }

    #[test]
    fn related_rows_listed_per_patient() {
        let conn = test_db();
        let patient = Uuid::new_v4();
        let other = Uuid::new_v4();
        for owner in [patient, other] {
            insert_appointment(
                &conn,
                &Appointment {
                    id: Uuid::new_v4(),
                    patient_id: owner,
                    tooth_number: None,
                    status: AppointmentStatus::Scheduled,
                    scheduled_at: at(3_600),
                },
            )
            .unwrap();
        }
        insert_treatment_plan(
            &conn,
            &TreatmentPlan {
                id: Uuid::new_v4(),
                patient_id: patient,
                tooth_number: Some("21".into()),
                title: "Crown".into(),
                status: TreatmentPlanStatus::Planned,
                sessions_planned: 2,
                sessions_done: 0,
            },
        )
        .unwrap();

        let appts = select_appointments(&conn, &patient).unwrap();
        assert_eq!(appts.len(), 1);
        assert_eq!(appts[0].scheduled_at, at(3_600));
        let plans = select_treatment_plans(&conn, &patient).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].sessions_planned, 2);
        assert!(select_treatment_plans(&conn, &other).unwrap().is_empty());
    }
}
