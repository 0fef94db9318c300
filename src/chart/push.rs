//! CH-03: Push adapter — change-notification subscriptions for one owner.
//!
//! A `SubscriptionSet` owns the three table subscriptions of the active
//! patient. Opening is all-or-nothing; closing happens exactly once, either
//! through `close()` or on drop.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::SyncError;
use crate::config::RelevancePolicy;
use crate::models::{ChangeEvent, ChartTable, PushSignal, SubscriptionId};

/// Realtime change stream provider.
///
/// Implementations relay events as received; filtering is the core's job.
pub trait PushSource: Send + Sync {
    /// Start delivering `table` changes for `owner` into `sink`.
    fn subscribe(
        &self,
        table: ChartTable,
        owner: Uuid,
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> Result<SubscriptionId, SyncError>;

    /// Stop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

pub struct SubscriptionSet {
    source: Arc<dyn PushSource>,
    owner: Uuid,
    handles: Vec<(ChartTable, SubscriptionId)>,
    closed: bool,
}

impl std::fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("owner", &self.owner)
            .field("handles", &self.handles)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SubscriptionSet {
    /// Subscribe to every chart table for `owner`.
    ///
    /// If any table fails, the ones already opened are released before the
    /// error is returned.
    pub fn open(
        source: Arc<dyn PushSource>,
        owner: Uuid,
        sink: &mpsc::UnboundedSender<PushSignal>,
    ) -> Result<Self, SyncError> {
        let mut handles = Vec::with_capacity(ChartTable::ALL.len());
        for &table in ChartTable::ALL {
            match source.subscribe(table, owner, sink.clone()) {
                Ok(id) => handles.push((table, id)),
                Err(e) => {
                    for (_, id) in handles {
                        source.unsubscribe(id);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(owner = %owner, subscriptions = handles.len(), "Subscription set opened");
        Ok(Self {
            source,
            owner,
            handles,
            closed: false,
        })
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.handles.iter().any(|(_, h)| *h == id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Unsubscribe every stream.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, id) in self.handles.drain(..) {
            self.source.unsubscribe(id);
        }
        tracing::debug!(owner = %self.owner, "Subscription set closed");
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether `event` should trigger a refetch for `owner`.
///
/// - Rows of another patient never qualify.
/// - Chart rows always qualify.
/// - Related rows qualify when their kind is allow-listed and, if the
///   backend reported changed columns, the watched column is among them.
pub fn is_relevant(event: &ChangeEvent, owner: Uuid, policy: &RelevancePolicy) -> bool {
    if event.owner_id.is_some_and(|id| id != owner) {
        return false;
    }
    let Some(allowed) = policy.allowed_kinds(event.table) else {
        return true;
    };
    if !allowed.contains(&event.kind) {
        return false;
    }
    match &event.changed_columns {
        Some(columns) => columns.iter().any(|c| c == &policy.watched_column),
        None => true,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::ChangeKind;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Push source that records subscriptions and can refuse a given table.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub live: Mutex<BTreeMap<SubscriptionId, (ChartTable, Uuid, mpsc::UnboundedSender<PushSignal>)>>,
        pub refuse: Mutex<Option<ChartTable>>,
        pub next: Mutex<u64>,
        pub unsubscribed: Mutex<Vec<SubscriptionId>>,
    }

    impl ScriptedSource {
        pub(crate) fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        pub(crate) fn live_owners(&self) -> Vec<Uuid> {
            self.live.lock().unwrap().values().map(|(_, o, _)| *o).collect()
        }

        /// Deliver an event the way a backend would: only to matching subscriptions.
        pub(crate) fn emit(&self, event: ChangeEvent) -> usize {
            let live = self.live.lock().unwrap();
            let mut delivered = 0;
            for (table, owner, sink) in live.values() {
                if *table == event.table && event.owner_id.map_or(true, |o| o == *owner) {
                    if sink.send(PushSignal::Change(event.clone())).is_ok() {
                        delivered += 1;
                    }
                }
            }
            delivered
        }

        /// Simulate the server closing one stream.
        pub(crate) fn sever(&self, table: ChartTable) {
            let mut live = self.live.lock().unwrap();
            let ids: Vec<SubscriptionId> = live
                .iter()
                .filter(|(_, (t, _, _))| *t == table)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some((table, _, sink)) = live.remove(&id) {
                    let _ = sink.send(PushSignal::Closed { table, subscription: id });
                }
            }
        }
    }

    impl PushSource for ScriptedSource {
        fn subscribe(
            &self,
            table: ChartTable,
            owner: Uuid,
            sink: mpsc::UnboundedSender<PushSignal>,
        ) -> Result<SubscriptionId, SyncError> {
            if *self.refuse.lock().unwrap() == Some(table) {
                return Err(SyncError::Subscribe {
                    table,
                    reason: "refused".into(),
                });
            }
            let mut next = self.next.lock().unwrap();
            *next += 1;
            let id = SubscriptionId(*next);
            self.live.lock().unwrap().insert(id, (table, owner, sink));
            Ok(id)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.live.lock().unwrap().remove(&id);
            self.unsubscribed.lock().unwrap().push(id);
        }
    }

    fn sink() -> (mpsc::UnboundedSender<PushSignal>, mpsc::UnboundedReceiver<PushSignal>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn open_subscribes_all_tables() {
        let source = Arc::new(ScriptedSource::default());
        let (tx, _rx) = sink();
        let owner = Uuid::new_v4();
        let set = SubscriptionSet::open(source.clone(), owner, &tx).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(source.live_count(), 3);
        assert!(source.live_owners().iter().all(|o| *o == owner));
    }

    #[test]
    fn close_releases_every_handle_once() {
        let source = Arc::new(ScriptedSource::default());
        let (tx, _rx) = sink();
        let set = SubscriptionSet::open(source.clone(), Uuid::new_v4(), &tx).unwrap();
        set.close();
        assert_eq!(source.live_count(), 0);
        assert_eq!(source.unsubscribed.lock().unwrap().len(), 3);
    }

    #[test]
    fn drop_closes_unclosed_set() {
        let source = Arc::new(ScriptedSource::default());
        let (tx, _rx) = sink();
        {
            let _set = SubscriptionSet::open(source.clone(), Uuid::new_v4(), &tx).unwrap();
        }
        assert_eq!(source.live_count(), 0);
        assert_eq!(source.unsubscribed.lock().unwrap().len(), 3);
    }

    #[test]
    fn partial_open_is_rolled_back() {
        let source = Arc::new(ScriptedSource::default());
        *source.refuse.lock().unwrap() = Some(ChartTable::TreatmentPlans);
        let (tx, _rx) = sink();

        let err = SubscriptionSet::open(source.clone(), Uuid::new_v4(), &tx).unwrap_err();
        assert!(matches!(err, SyncError::Subscribe { table: ChartTable::TreatmentPlans, .. }));
        assert_eq!(source.live_count(), 0);
    }

    #[test]
    fn contains_only_own_handles() {
        let source = Arc::new(ScriptedSource::default());
        let (tx, _rx) = sink();
        let a = SubscriptionSet::open(source.clone(), Uuid::new_v4(), &tx).unwrap();
        let b = SubscriptionSet::open(source.clone(), Uuid::new_v4(), &tx).unwrap();
        let (_, first_b) = b.handles[0];
        assert!(b.contains(first_b));
        assert!(!a.contains(first_b));
    }

    #[test]
    fn other_owner_is_irrelevant() {
        let owner = Uuid::new_v4();
        let policy = RelevancePolicy::default();
        let event = ChangeEvent::new(ChartTable::ToothDiagnoses, ChangeKind::Insert, Uuid::new_v4());
        assert!(!is_relevant(&event, owner, &policy));
    }

    #[test]
    fn chart_table_always_relevant() {
        let owner = Uuid::new_v4();
        let policy = RelevancePolicy::default();
        for &kind in ChangeKind::ALL {
            let event = ChangeEvent::new(ChartTable::ToothDiagnoses, kind, owner);
            assert!(is_relevant(&event, owner, &policy));
        }
    }

    #[test]
    fn related_tables_filtered_by_kind() {
        let owner = Uuid::new_v4();
        let policy = RelevancePolicy::default();
        let insert = ChangeEvent::new(ChartTable::Appointments, ChangeKind::Insert, owner);
        let update = ChangeEvent::new(ChartTable::Appointments, ChangeKind::Update, owner);
        assert!(!is_relevant(&insert, owner, &policy));
        assert!(is_relevant(&update, owner, &policy));
    }

    #[test]
    fn related_update_needs_watched_column_when_known() {
        let owner = Uuid::new_v4();
        let policy = RelevancePolicy::default();
        let sessions = ChangeEvent::new(ChartTable::TreatmentPlans, ChangeKind::Update, owner)
            .with_columns(&["sessions_done", "updated_at"]);
        let status = ChangeEvent::new(ChartTable::TreatmentPlans, ChangeKind::Update, owner)
            .with_columns(&["status", "updated_at"]);
        let unknown = ChangeEvent::new(ChartTable::TreatmentPlans, ChangeKind::Update, owner);
        assert!(!is_relevant(&sessions, owner, &policy));
        assert!(is_relevant(&status, owner, &policy));
        assert!(is_relevant(&unknown, owner, &policy), "Unknown columns count as relevant");
    }

    #[test]
    fn event_without_owner_is_not_discarded() {
        let owner = Uuid::new_v4();
        let mut event = ChangeEvent::new(ChartTable::ToothDiagnoses, ChangeKind::Delete, owner);
        event.owner_id = None;
        assert!(is_relevant(&event, owner, &RelevancePolicy::default()));
    }
}
