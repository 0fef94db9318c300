//! Local chart backend: SQLite storage plus an in-process change hub.
//!
//! Stands in for a managed database with realtime notifications. Every
//! write made through `ChartBackend` publishes the matching `ChangeEvent`
//! to whoever subscribed, the same way a hosted backend would.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chart::{ChartStorage, PushSource, RowFilter, SyncError};
use crate::db::{self, DatabaseError};
use crate::models::{
    Appointment, AppointmentStatus, ChangeEvent, ChangeKind, ChartScope, ChartTable, PushSignal,
    SubscriptionId, ToothRecord, ToothRow, TreatmentPlan, TreatmentPlanStatus,
};

// ═══════════════════════════════════════════════════════════
// SqliteChartStorage
// ═══════════════════════════════════════════════════════════

/// `ChartStorage` over a local SQLite database.
pub struct SqliteChartStorage {
    conn: Mutex<Connection>,
}

impl SqliteChartStorage {
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(db::open_database(path)?))
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::from_connection(db::open_memory_database()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Unavailable("storage lock poisoned".into()))
    }

    pub fn delete_tooth(&self, id: &Uuid) -> Result<ToothRow, SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::delete_tooth_diagnosis(&conn, id)?)
    }

    pub fn add_appointment(&self, appt: &Appointment) -> Result<(), SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::insert_appointment(&conn, appt)?)
    }

    /// Returns the owning patient.
    pub fn set_appointment_status(&self, id: &Uuid, status: AppointmentStatus) -> Result<Uuid, SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::update_appointment_status(&conn, id, status)?)
    }

    pub fn add_treatment_plan(&self, plan: &TreatmentPlan) -> Result<(), SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::insert_treatment_plan(&conn, plan)?)
    }

    /// Returns the owning patient.
    pub fn set_treatment_plan_status(
        &self,
        id: &Uuid,
        status: TreatmentPlanStatus,
    ) -> Result<Uuid, SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::update_treatment_plan_status(&conn, id, status)?)
    }

    /// Returns the owning patient.
    pub fn record_treatment_session(&self, id: &Uuid) -> Result<Uuid, SyncError> {
        let conn = self.conn()?;
        Ok(db::repository::record_treatment_session(&conn, id)?)
    }
}

impl ChartStorage for SqliteChartStorage {
    fn select(&self, table: ChartTable, filter: &RowFilter) -> Result<Vec<Value>, SyncError> {
        let conn = self.conn()?;
        match table {
            ChartTable::ToothDiagnoses => {
                let rows = db::repository::select_tooth_rows(
                    &conn,
                    &filter.patient_id,
                    filter.consultation_id.as_ref(),
                )?;
                to_values(table, &rows)
            }
            ChartTable::Appointments => {
                to_values(table, &db::repository::select_appointments(&conn, &filter.patient_id)?)
            }
            ChartTable::TreatmentPlans => {
                to_values(table, &db::repository::select_treatment_plans(&conn, &filter.patient_id)?)
            }
        }
    }

    fn upsert_tooth(&self, record: &ToothRecord) -> Result<ToothRecord, SyncError> {
        let conn = self.conn()?;
        let row = db::repository::upsert_tooth_diagnosis(&conn, record)?;
        Ok(ToothRecord::from_row(row, record.scope))
    }
}

fn to_values<T: serde::Serialize>(table: ChartTable, rows: &[T]) -> Result<Vec<Value>, SyncError> {
    rows.iter()
        .map(|row| {
            serde_json::to_value(row).map_err(|e| SyncError::MalformedRow {
                table,
                reason: e.to_string(),
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════
// ChangeHub
// ═══════════════════════════════════════════════════════════

struct Subscriber {
    table: ChartTable,
    owner: Uuid,
    sink: mpsc::UnboundedSender<PushSignal>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    accepting: bool,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
}

/// In-process `PushSource`: fans published events out to subscribers
/// filtered by table and owner.
pub struct ChangeHub {
    state: Mutex<HubState>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                accepting: true,
                ..HubState::default()
            }),
        }
    }

    /// Deliver `event` to matching subscribers. Returns how many received it.
    ///
    /// Events without an owner go to every subscriber of the table.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sub) in &state.subscribers {
            if sub.table != event.table || event.owner_id.is_some_and(|o| o != sub.owner) {
                continue;
            }
            if sub.sink.send(PushSignal::Change(event.clone())).is_ok() {
                delivered += 1;
            } else {
                gone.push(*id);
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
            tracing::debug!(subscription = %id, "Dropped subscriber with closed channel");
        }
        tracing::trace!(table = %event.table, kind = %event.kind, delivered, "Change published");
        delivered
    }

    /// End every stream for `table`, notifying each subscriber.
    pub fn disconnect(&self, table: ChartTable) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let ids: Vec<SubscriptionId> = state
            .subscribers
            .iter()
            .filter(|(_, sub)| sub.table == table)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(sub) = state.subscribers.remove(id) {
                let _ = sub.sink.send(PushSignal::Closed {
                    table,
                    subscription: *id,
                });
            }
        }
        tracing::info!(table = %table, closed = ids.len(), "Change streams disconnected");
        ids.len()
    }

    /// While `false`, new subscriptions are refused.
    pub fn set_accepting(&self, accepting: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.accepting = accepting;
        }
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub fn subscribers_for(&self, owner: Uuid) -> usize {
        self.state
            .lock()
            .map(|s| s.subscribers.values().filter(|sub| sub.owner == owner).count())
            .unwrap_or(0)
    }
}

impl PushSource for ChangeHub {
    fn subscribe(
        &self,
        table: ChartTable,
        owner: Uuid,
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> Result<SubscriptionId, SyncError> {
        let mut state = self.state.lock().map_err(|_| SyncError::Subscribe {
            table,
            reason: "hub lock poisoned".into(),
        })?;
        if !state.accepting {
            return Err(SyncError::Subscribe {
                table,
                reason: "realtime endpoint unavailable".into(),
            });
        }
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.insert(id, Subscriber { table, owner, sink });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.remove(&id);
        }
    }
}

// ═══════════════════════════════════════════════════════════
// ChartBackend
// ═══════════════════════════════════════════════════════════

/// Storage and change hub wired together: writes publish change events.
pub struct ChartBackend {
    storage: SqliteChartStorage,
    hub: Arc<ChangeHub>,
}

impl ChartBackend {
    pub fn new(storage: SqliteChartStorage) -> Self {
        Self {
            storage,
            hub: Arc::new(ChangeHub::new()),
        }
    }

    pub fn in_memory() -> Result<Self, SyncError> {
        Ok(Self::new(SqliteChartStorage::in_memory()?))
    }

    pub fn open(path: &Path) -> Result<Self, SyncError> {
        Ok(Self::new(SqliteChartStorage::open(path)?))
    }

    /// Direct storage access. Writes made here are not published.
    pub fn storage(&self) -> &SqliteChartStorage {
        &self.storage
    }

    pub fn hub(&self) -> Arc<ChangeHub> {
        Arc::clone(&self.hub)
    }

    pub fn delete_tooth(&self, id: &Uuid) -> Result<(), SyncError> {
        let row = self.storage.delete_tooth(id)?;
        self.hub.publish(&ChangeEvent::new(
            ChartTable::ToothDiagnoses,
            ChangeKind::Delete,
            row.patient_id,
        ));
        Ok(())
    }

    pub fn add_appointment(&self, appt: &Appointment) -> Result<(), SyncError> {
        self.storage.add_appointment(appt)?;
        self.hub.publish(&ChangeEvent::new(
            ChartTable::Appointments,
            ChangeKind::Insert,
            appt.patient_id,
        ));
        Ok(())
    }

    pub fn set_appointment_status(&self, id: &Uuid, status: AppointmentStatus) -> Result<(), SyncError> {
        let owner = self.storage.set_appointment_status(id, status)?;
        self.hub.publish(
            &ChangeEvent::new(ChartTable::Appointments, ChangeKind::Update, owner)
                .with_columns(&["status", "updated_at"]),
        );
        Ok(())
    }

    pub fn add_treatment_plan(&self, plan: &TreatmentPlan) -> Result<(), SyncError> {
        self.storage.add_treatment_plan(plan)?;
        self.hub.publish(&ChangeEvent::new(
            ChartTable::TreatmentPlans,
            ChangeKind::Insert,
            plan.patient_id,
        ));
        Ok(())
    }

    pub fn set_treatment_plan_status(
        &self,
        id: &Uuid,
        status: TreatmentPlanStatus,
    ) -> Result<(), SyncError> {
        let owner = self.storage.set_treatment_plan_status(id, status)?;
        self.hub.publish(
            &ChangeEvent::new(ChartTable::TreatmentPlans, ChangeKind::Update, owner)
                .with_columns(&["status", "updated_at"]),
        );
        Ok(())
    }

    pub fn record_treatment_session(&self, id: &Uuid) -> Result<(), SyncError> {
        let owner = self.storage.record_treatment_session(id)?;
        self.hub.publish(
            &ChangeEvent::new(ChartTable::TreatmentPlans, ChangeKind::Update, owner)
                .with_columns(&["sessions_done", "updated_at"]),
        );
        Ok(())
    }

    /// Current chart rows of a scope, straight from storage.
    pub fn tooth_rows(&self, scope: &ChartScope) -> Result<Vec<ToothRow>, SyncError> {
        let conn = self.storage.conn()?;
        Ok(db::repository::select_tooth_rows(
            &conn,
            &scope.patient_id,
            scope.consultation_id.as_ref(),
        )?)
    }
}

impl ChartStorage for ChartBackend {
    fn select(&self, table: ChartTable, filter: &RowFilter) -> Result<Vec<Value>, SyncError> {
        self.storage.select(table, filter)
    }

    /// Insert when the record has no id yet, update otherwise.
    fn upsert_tooth(&self, record: &ToothRecord) -> Result<ToothRecord, SyncError> {
        let stored = self.storage.upsert_tooth(record)?;
        let kind = if record.id.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.hub.publish(&ChangeEvent::new(
            ChartTable::ToothDiagnoses,
            kind,
            record.scope.patient_id,
        ));
        Ok(stored)
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
