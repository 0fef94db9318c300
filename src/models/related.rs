use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AppointmentStatus, TreatmentPlanStatus};

/// Scheduling record optionally linked to a tooth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub tooth_number: Option<String>,
    pub status: AppointmentStatus,
    pub scheduled_at: DateTime<Utc>,
}

/// Multi-visit procedure (e.g. a root canal over three sessions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub tooth_number: Option<String>,
    pub title: String,
    pub status: TreatmentPlanStatus,
    pub sessions_planned: u32,
    pub sessions_done: u32,
}
