//! CH-07: Reconciliation core — one chart scope, kept in sync.
//!
//! `ChartSync` is sans-IO: it decides *when* to fetch and *what* to apply,
//! while the caller runs the fetch and hands the result back with the
//! ticket it was issued. All mutation happens through `&mut self`, so a
//! single owner (the service task, or a test) serializes every transition.
//!
//! Ordering on scope change is always: cancel the pending timer, forget the
//! in-flight fetch, close the old subscriptions, then subscribe and fetch
//! for the new scope.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::coalescer::{Clock, Coalescer};
use super::derive::derive_display;
use super::error::SyncError;
use super::merge::{display_map, merge, MergedChart, MergedTooth};
use super::normalize::{normalize_overlay, normalize_override};
use super::push::{is_relevant, PushSource, SubscriptionSet};
use super::store::{EntityStore, StoreDiff};
use crate::config::SyncConfig;
use crate::models::{
    ChartScope, DerivedAttributes, DisplayRecord, PushSignal, ToothKey, ToothOverride, ToothRecord,
};

/// Identifies one fetch. Only the most recently issued ticket is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub scope: ChartScope,
    pub generation: u64,
    pub sequence: u64,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    Applied(StoreDiff),
    /// Superseded by a scope change or a newer fetch; nothing was touched.
    Stale,
    /// The fetch failed; the previous chart stays on screen.
    Failed,
}

/// Live-update health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Connectivity {
    Live,
    Reconnecting { attempt: u32 },
    /// Retries exhausted. Only scope changes and manual refreshes fetch.
    Degraded,
}

/// What the host needs for a "sync interrupted" badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIndicator {
    pub fetch_error: Option<String>,
    pub connectivity: Connectivity,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncIndicator {
    pub fn is_interrupted(&self) -> bool {
        self.fetch_error.is_some() || self.connectivity != Connectivity::Live
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingResubscribe {
    attempt: u32,
    due: Instant,
}

pub struct ChartSync {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    push: Arc<dyn PushSource>,
    sink: mpsc::UnboundedSender<PushSignal>,
    store: EntityStore,
    overrides: BTreeMap<ToothKey, ToothOverride>,
    /// Persisted overrides, released by the first fetch issued after the
    /// recorded sequence number.
    committed: BTreeMap<ToothKey, u64>,
    merged: MergedChart,
    coalescer: Coalescer,
    subscriptions: Option<SubscriptionSet>,
    connectivity: Connectivity,
    resubscribe: Option<PendingResubscribe>,
    generation: u64,
    sequence: u64,
    in_flight: Option<FetchTicket>,
    fetch_error: Option<String>,
}

impl ChartSync {
    /// Bind a core to `scope`: subscribe, and issue the initial fetch.
    ///
    /// Fails before touching the push source if `config` is invalid.
    pub fn create(
        scope: ChartScope,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        push: Arc<dyn PushSource>,
        sink: mpsc::UnboundedSender<PushSignal>,
    ) -> Result<(Self, FetchTicket), SyncError> {
        config.validate()?;
        let coalescer = Coalescer::new(config.quiet_window(), config.max_burst());
        let mut core = Self {
            config,
            clock,
            push,
            sink,
            store: EntityStore::create(scope),
            overrides: BTreeMap::new(),
            committed: BTreeMap::new(),
            merged: MergedChart::new(),
            coalescer,
            subscriptions: None,
            connectivity: Connectivity::Live,
            resubscribe: None,
            generation: 0,
            sequence: 0,
            in_flight: None,
            fetch_error: None,
        };
        tracing::info!(
            patient_id = %scope.patient_id,
            consultation_id = ?scope.consultation_id,
            "Chart sync started"
        );
        core.open_subscriptions(0);
        let ticket = core.start_fetch();
        Ok((core, ticket))
    }

    pub fn scope(&self) -> ChartScope {
        *self.store.scope()
    }

    /// Move to another patient or consultation.
    ///
    /// Store and overrides belong to the old scope and are dropped.
    pub fn switch_scope(&mut self, scope: ChartScope) -> FetchTicket {
        self.coalescer.cancel();
        self.in_flight = None;
        self.generation += 1;
        self.resubscribe = None;
        if let Some(set) = self.subscriptions.take() {
            set.close();
        }

        let previous = std::mem::replace(&mut self.store, EntityStore::create(scope));
        previous.dispose();
        self.overrides.clear();
        self.committed.clear();
        self.merged.clear();
        self.fetch_error = None;

        tracing::info!(
            patient_id = %scope.patient_id,
            consultation_id = ?scope.consultation_id,
            generation = self.generation,
            "Chart scope switched"
        );
        self.open_subscriptions(0);
        self.start_fetch()
    }

    /// Feed one signal from the push channel. Returns whether it had any effect.
    pub fn on_push_signal(&mut self, signal: PushSignal) -> bool {
        match signal {
            PushSignal::Change(event) => {
                if !is_relevant(&event, self.store.scope().patient_id, &self.config.relevance) {
                    tracing::trace!(table = %event.table, kind = %event.kind, "Change event ignored");
                    return false;
                }
                self.coalescer.on_event(self.clock.now());
                true
            }
            PushSignal::Closed { table, subscription } => {
                let ours = self
                    .subscriptions
                    .as_ref()
                    .is_some_and(|set| set.contains(subscription));
                if !ours {
                    return false;
                }
                tracing::warn!(table = %table, subscription = %subscription, "Change stream dropped");
                if let Some(set) = self.subscriptions.take() {
                    set.close();
                }
                self.schedule_resubscribe(0);
                true
            }
        }
    }

    /// Advance timers. Returns a ticket when a debounced fetch is due.
    pub fn poll(&mut self) -> Option<FetchTicket> {
        let now = self.clock.now();

        if let Some(pending) = self.resubscribe {
            if now >= pending.due {
                self.resubscribe = None;
                if self.open_subscriptions(pending.attempt + 1) {
                    // Catch up on whatever happened while disconnected.
                    self.coalescer.on_event(now);
                }
            }
        }

        if self.coalescer.poll(now) {
            Some(self.issue_ticket())
        } else {
            None
        }
    }

    /// Fetch now, unless a fetch is already running (then once more after it).
    pub fn request_refresh(&mut self) -> Option<FetchTicket> {
        if self.coalescer.is_fetching() {
            self.coalescer.on_event(self.clock.now());
            None
        } else {
            Some(self.start_fetch())
        }
    }

    /// Hand back the result of the fetch identified by `ticket`.
    pub fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<BTreeMap<ToothKey, ToothRecord>, SyncError>,
    ) -> ApplyOutcome {
        if self.in_flight != Some(ticket) || ticket.scope != *self.store.scope() {
            tracing::debug!(
                generation = ticket.generation,
                sequence = ticket.sequence,
                current_generation = self.generation,
                "Stale fetch result discarded"
            );
            return ApplyOutcome::Stale;
        }
        self.in_flight = None;
        self.coalescer.fetch_finished(self.clock.now());

        match result {
            Ok(fresh) => {
                let released: Vec<ToothKey> = self
                    .committed
                    .iter()
                    .filter(|&(_, &after)| ticket.sequence > after)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &released {
                    self.committed.remove(key);
                    self.overrides.remove(key);
                }
                let frozen: BTreeSet<ToothKey> = self.overrides.keys().cloned().collect();
                let diff = self.store.replace_all(fresh, &frozen, self.clock.utc_now());
                self.fetch_error = None;
                self.remerge();
                tracing::debug!(
                    sequence = ticket.sequence,
                    records = self.store.len(),
                    changed = diff.changed.len(),
                    removed = diff.removed.len(),
                    suppressed = diff.suppressed.len(),
                    released = released.len(),
                    "Fetch applied"
                );
                ApplyOutcome::Applied(diff)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    transient = e.is_transient(),
                    "Fetch failed, keeping last known chart"
                );
                self.fetch_error = Some(e.to_string());
                ApplyOutcome::Failed
            }
        }
    }

    // ── Overrides ───────────────────────────────────────────

    /// Replace the record for `key` with `ov` until cleared.
    pub fn set_override(&mut self, key: ToothKey, ov: ToothOverride) {
        tracing::debug!(tooth = %key, "Override set");
        self.committed.remove(&key);
        self.overrides.insert(key, ov);
        self.remerge();
    }

    /// Same as `set_override`, for loosely shaped host data.
    /// Returns `false` if `value` is not an object.
    pub fn set_override_json(&mut self, key: ToothKey, value: &Value) -> bool {
        match normalize_override(value) {
            Some(ov) => {
                self.set_override(key, ov);
                true
            }
            None => false,
        }
    }

    /// Apply a whole external overlay (object keyed by tooth, or array).
    pub fn apply_overlay(&mut self, value: &Value) -> usize {
        let overlay = normalize_overlay(value);
        let count = overlay.len();
        if count > 0 {
            for key in overlay.keys() {
                self.committed.remove(key);
            }
            self.overrides.extend(overlay);
            self.remerge();
            tracing::debug!(count, "Overlay applied");
        }
        count
    }

    /// Drop the override for `key` and refetch right away, so the store
    /// catches up on updates held back while the key was overridden.
    /// Returns the ticket to run, or `None` if a fetch is already running
    /// (another one follows it).
    pub fn clear_override(&mut self, key: &ToothKey) -> Result<Option<FetchTicket>, SyncError> {
        if self.overrides.remove(key).is_none() {
            return Err(SyncError::NoOverride(key.to_string()));
        }
        self.committed.remove(key);
        tracing::debug!(tooth = %key, remaining = self.overrides.len(), "Override cleared");
        self.remerge();
        Ok(self.request_refresh())
    }

    pub fn clear_overrides(&mut self) -> Option<FetchTicket> {
        if self.overrides.is_empty() {
            return None;
        }
        self.overrides.clear();
        self.committed.clear();
        self.remerge();
        self.request_refresh()
    }

    /// The override for `key` has been written to storage.
    ///
    /// It stays on screen until a fetch issued after this call lands, so the
    /// chart never flashes the pre-edit row. Returns a ticket when a fetch
    /// can start right away.
    pub fn confirm_override(&mut self, key: &ToothKey) -> Result<Option<FetchTicket>, SyncError> {
        if !self.overrides.contains_key(key) {
            return Err(SyncError::NoOverride(key.to_string()));
        }
        self.committed.insert(key.clone(), self.sequence);
        tracing::debug!(tooth = %key, after = self.sequence, "Override committed");
        Ok(self.request_refresh())
    }

    pub fn override_for(&self, key: &ToothKey) -> Option<&ToothOverride> {
        self.overrides.get(key)
    }

    /// The record an override resolves to, as it would be persisted.
    pub fn override_record(&self, key: &ToothKey) -> Option<ToothRecord> {
        self.overrides
            .get(key)
            .map(|ov| ov.clone().into_record(key.clone(), self.scope()))
    }

    // ── Read side ───────────────────────────────────────────

    pub fn merged_records(&self) -> &MergedChart {
        &self.merged
    }

    pub fn get(&self, key: &ToothKey) -> Option<&Arc<MergedTooth>> {
        self.merged.get(key)
    }

    pub fn display_records(&self) -> BTreeMap<ToothKey, DisplayRecord> {
        display_map(&self.merged)
    }

    /// Preview what a record would look like, without touching any state.
    pub fn derive(record: &ToothRecord) -> DerivedAttributes {
        derive_display(record)
    }

    pub fn indicator(&self) -> SyncIndicator {
        SyncIndicator {
            fetch_error: self.fetch_error.clone(),
            connectivity: self.connectivity,
            last_synced_at: self.store.last_synced_at(),
        }
    }

    pub fn has_live_subscriptions(&self) -> bool {
        self.subscriptions.is_some()
    }

    pub fn in_flight(&self) -> Option<FetchTicket> {
        self.in_flight
    }

    /// Earliest instant at which `poll` may have work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let resubscribe = self.resubscribe.map(|p| p.due);
        match (self.coalescer.next_deadline(), resubscribe) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Tear down: no timer, no subscription and no fetch survives this.
    pub fn dispose(mut self) {
        self.coalescer.cancel();
        self.in_flight = None;
        self.resubscribe = None;
        if let Some(set) = self.subscriptions.take() {
            set.close();
        }
        tracing::info!(patient_id = %self.store.scope().patient_id, "Chart sync disposed");
        self.store.dispose();
    }

    // ── Internals ───────────────────────────────────────────

    fn start_fetch(&mut self) -> FetchTicket {
        self.coalescer.fetch_started();
        self.issue_ticket()
    }

    fn issue_ticket(&mut self) -> FetchTicket {
        self.sequence += 1;
        let ticket = FetchTicket {
            scope: self.scope(),
            generation: self.generation,
            sequence: self.sequence,
        };
        self.in_flight = Some(ticket);
        tracing::debug!(generation = ticket.generation, sequence = ticket.sequence, "Fetch issued");
        ticket
    }

    fn remerge(&mut self) {
        self.merged = merge(self.store.records(), &self.overrides, self.scope(), &self.merged);
    }

    /// `attempt` is the number of retries already made for this outage.
    fn open_subscriptions(&mut self, attempt: u32) -> bool {
        let owner = self.store.scope().patient_id;
        match SubscriptionSet::open(Arc::clone(&self.push), owner, &self.sink) {
            Ok(set) => {
                self.subscriptions = Some(set);
                self.connectivity = Connectivity::Live;
                if attempt > 0 {
                    tracing::info!(attempt, "Change streams restored");
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Subscribing to change streams failed");
                self.schedule_resubscribe(attempt);
                false
            }
        }
    }

    fn schedule_resubscribe(&mut self, attempt: u32) {
        match self.config.reconnect.delay_for(attempt) {
            Some(delay) => {
                self.resubscribe = Some(PendingResubscribe {
                    attempt,
                    due: self.clock.now() + delay,
                });
                self.connectivity = Connectivity::Reconnecting { attempt: attempt + 1 };
                tracing::info!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Resubscription scheduled"
                );
            }
            None => {
                self.resubscribe = None;
                self.connectivity = Connectivity::Degraded;
                tracing::warn!(
                    retries = attempt,
                    "Giving up on change streams until the next scope change"
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
