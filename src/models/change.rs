use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ChangeKind, ChartTable};

/// Raw row-level change notification, relayed as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: ChartTable,
    pub kind: ChangeKind,
    /// Patient the changed row belongs to, when the backend reports it.
    pub owner_id: Option<Uuid>,
    /// Columns touched by an update. `None` when the backend cannot tell.
    #[serde(default)]
    pub changed_columns: Option<Vec<String>>,
}

impl ChangeEvent {
    pub fn new(table: ChartTable, kind: ChangeKind, owner_id: Uuid) -> Self {
        Self {
            table,
            kind,
            owner_id: Some(owner_id),
            changed_columns: None,
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.changed_columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

/// Handle returned by a push source for one table subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a push subscription delivers to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Change(ChangeEvent),
    /// The stream behind `subscription` ended (network drop, server close).
    Closed {
        table: ChartTable,
        subscription: SubscriptionId,
    },
}
