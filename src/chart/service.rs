//! CH-08: Chart service — the event loop around `ChartSync`.
//!
//! One tokio task owns the core. Host commands, push signals and finished
//! fetches are all funneled into that task, so the core is never touched
//! concurrently. Fetches and writes run on the blocking pool and report
//! back through a channel; snapshots go out over a `watch` channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::coalescer::SystemClock;
use super::core::{ChartSync, FetchTicket, SyncIndicator};
use super::error::SyncError;
use super::fetch::{fetch_entities, ChartStorage};
use super::merge::{display_map, MergedChart};
use super::push::PushSource;
use crate::config::SyncConfig;
use crate::models::{
    ChartScope, DisplayRecord, PushSignal, ToothKey, ToothOverride, ToothRecord, ToothStatus,
};

/// What the presentation surface renders.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSnapshot {
    pub scope: ChartScope,
    pub records: MergedChart,
    pub indicator: SyncIndicator,
}

impl ChartSnapshot {
    pub fn display(&self) -> BTreeMap<ToothKey, DisplayRecord> {
        display_map(&self.records)
    }

    pub fn status_of(&self, key: &str) -> Option<ToothStatus> {
        self.records.get(&ToothKey::from(key)).map(|t| t.display.status)
    }
}

enum Command {
    SwitchScope(ChartScope),
    SetOverride {
        key: ToothKey,
        ov: ToothOverride,
    },
    ApplyOverlay(Value),
    ClearOverride {
        key: ToothKey,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    CommitOverride {
        key: ToothKey,
        reply: oneshot::Sender<Result<ToothRecord, SyncError>>,
    },
    Refresh,
}

type FetchDone = (FetchTicket, Result<BTreeMap<ToothKey, ToothRecord>, SyncError>);

/// Host-side handle to a running chart service.
///
/// Dropping the handle stops the service; `shutdown` also waits for it.
pub struct ChartSyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChartSnapshot>,
    task: JoinHandle<()>,
}

/// Start a chart service for `scope`. Must be called inside a tokio runtime.
///
/// An invalid `config` is rejected before anything is spawned.
pub fn spawn_chart_sync(
    scope: ChartScope,
    config: SyncConfig,
    storage: Arc<dyn ChartStorage>,
    push: Arc<dyn PushSource>,
) -> Result<ChartSyncHandle, SyncError> {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let (core, initial) = ChartSync::create(scope, config, Arc::new(SystemClock), push, signal_tx)?;
    let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&core));

    let service = ServiceLoop {
        core,
        storage,
        fetch_done: done_tx,
        snapshots: snapshot_tx,
    };
    let task = tokio::spawn(service.run(initial, command_rx, signal_rx, done_rx));

    Ok(ChartSyncHandle {
        commands: command_tx,
        snapshots: snapshot_rx,
        task,
    })
}

impl ChartSyncHandle {
    pub fn switch_scope(&self, scope: ChartScope) -> Result<(), SyncError> {
        self.send(Command::SwitchScope(scope))
    }

    pub fn set_override(&self, key: ToothKey, ov: ToothOverride) -> Result<(), SyncError> {
        self.send(Command::SetOverride { key, ov })
    }

    /// Loosely shaped host data; see `chart::normalize`.
    pub fn apply_overlay(&self, overlay: Value) -> Result<(), SyncError> {
        self.send(Command::ApplyOverlay(overlay))
    }

    pub async fn clear_override(&self, key: ToothKey) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ClearOverride { key, reply })?;
        rx.await.map_err(|_| SyncError::ServiceStopped)?
    }

    /// Persist the override for `key`. The override is released once a
    /// fetch containing the stored row has been applied.
    pub async fn commit_override(&self, key: ToothKey) -> Result<ToothRecord, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CommitOverride { key, reply })?;
        rx.await.map_err(|_| SyncError::ServiceStopped)?
    }

    pub fn refresh(&self) -> Result<(), SyncError> {
        self.send(Command::Refresh)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChartSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the service: subscriptions closed, pending timer dropped.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        let Self { commands, task, .. } = self;
        drop(commands);
        task.await.map_err(|e| {
            tracing::error!(error = %e, "Chart service task failed");
            SyncError::ServiceStopped
        })
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::ServiceStopped)
    }
}

fn snapshot_of(core: &ChartSync) -> ChartSnapshot {
    ChartSnapshot {
        scope: core.scope(),
        records: core.merged_records().clone(),
        indicator: core.indicator(),
    }
}

struct ServiceLoop {
    core: ChartSync,
    storage: Arc<dyn ChartStorage>,
    fetch_done: mpsc::UnboundedSender<FetchDone>,
    snapshots: watch::Sender<ChartSnapshot>,
}

impl ServiceLoop {
    async fn run(
        mut self,
        initial: FetchTicket,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<PushSignal>,
        mut fetches: mpsc::UnboundedReceiver<FetchDone>,
    ) {
        self.launch(initial);

        loop {
            let deadline = self.core.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(signal) = signals.recv() => {
                    self.core.on_push_signal(signal);
                }
                Some((ticket, result)) = fetches.recv() => {
                    self.core.apply_fetch(ticket, result);
                }
                () = timer => {}
            }

            if let Some(ticket) = self.core.poll() {
                self.launch(ticket);
            }
            self.publish();
        }

        self.core.dispose();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SwitchScope(scope) => {
                let ticket = self.core.switch_scope(scope);
                self.launch(ticket);
            }
            Command::SetOverride { key, ov } => self.core.set_override(key, ov),
            Command::ApplyOverlay(overlay) => {
                self.core.apply_overlay(&overlay);
            }
            Command::ClearOverride { key, reply } => {
                let result = self.core.clear_override(&key).map(|ticket| {
                    if let Some(ticket) = ticket {
                        self.launch(ticket);
                    }
                });
                let _ = reply.send(result);
            }
            Command::CommitOverride { key, reply } => {
                let result = self.commit(key).await;
                let _ = reply.send(result);
            }
            Command::Refresh => {
                if let Some(ticket) = self.core.request_refresh() {
                    self.launch(ticket);
                }
            }
        }
    }

    async fn commit(&mut self, key: ToothKey) -> Result<ToothRecord, SyncError> {
        let record = self
            .core
            .override_record(&key)
            .ok_or_else(|| SyncError::NoOverride(key.to_string()))?;
        let storage = Arc::clone(&self.storage);
        let stored = tokio::task::spawn_blocking(move || storage.upsert_tooth(&record))
            .await
            .map_err(|e| SyncError::Unavailable(format!("commit task failed: {e}")))??;

        if let Some(ticket) = self.core.confirm_override(&key)? {
            self.launch(ticket);
        }
        tracing::info!(tooth = %key, "Override persisted");
        Ok(stored)
    }

    fn launch(&self, ticket: FetchTicket) {
        let storage = Arc::clone(&self.storage);
        let done = self.fetch_done.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || fetch_entities(storage.as_ref(), &ticket.scope))
                .await
                .unwrap_or_else(|e| Err(SyncError::Unavailable(format!("fetch task failed: {e}"))));
            let _ = done.send((ticket, result));
        });
    }

    fn publish(&self) {
        let next = snapshot_of(&self.core);
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
