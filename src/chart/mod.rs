//! Chart reconciliation: keeps an interactive dental chart in step with
//! storage, live change notifications and unsaved edits.
//!
//! Data flow:
//! `fetch` → `store` → `merge` (with overrides from `normalize`) → `derive`
//! → display records. `push` + `coalescer` decide when to fetch again;
//! `core` ties them together and `service` runs `core` on a tokio task.

pub mod coalescer;
pub mod core;
pub mod derive;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod normalize;
pub mod push;
pub mod service;
pub mod store;

pub use self::coalescer::{Clock, Coalescer, CoalescerState, ManualClock, SystemClock};
pub use self::core::{ApplyOutcome, ChartSync, Connectivity, FetchTicket, SyncIndicator};
pub use self::derive::{derive_display, derive_status, to_display, HEALTHY_FILL};
pub use self::error::SyncError;
pub use self::fetch::{fetch_entities, ChartStorage, RowFilter};
pub use self::merge::{display_map, merge, MergedChart, MergedTooth};
pub use self::normalize::{normalize_overlay, normalize_override};
pub use self::push::{is_relevant, PushSource, SubscriptionSet};
pub use self::service::{spawn_chart_sync, ChartSnapshot, ChartSyncHandle};
pub use self::store::{EntityStore, StoreDiff};
