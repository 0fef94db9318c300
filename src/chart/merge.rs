//! CH-06: Precedence merger — store snapshot plus caller overrides.
//!
//! An override replaces the stored record for its key as a whole; fields are
//! never combined across the two. Output entries whose resolved record did
//! not change keep the `Arc` from the previous merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::derive::to_display;
use crate::models::{ChartScope, DisplayRecord, RecordOrigin, ToothKey, ToothOverride, ToothRecord};

/// One resolved tooth, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedTooth {
    pub record: Arc<ToothRecord>,
    pub display: DisplayRecord,
    pub origin: RecordOrigin,
}

pub type MergedChart = BTreeMap<ToothKey, Arc<MergedTooth>>;

pub fn merge(
    store: &BTreeMap<ToothKey, Arc<ToothRecord>>,
    overrides: &BTreeMap<ToothKey, ToothOverride>,
    scope: ChartScope,
    previous: &MergedChart,
) -> MergedChart {
    let mut out = MergedChart::new();

    for (key, record) in store {
        if overrides.contains_key(key) {
            continue;
        }
        out.insert(
            key.clone(),
            resolve(key, Arc::clone(record), RecordOrigin::Store, previous),
        );
    }

    for (key, ov) in overrides {
        let record = Arc::new(ov.clone().into_record(key.clone(), scope));
        out.insert(key.clone(), resolve(key, record, RecordOrigin::Override, previous));
    }

    out
}

fn resolve(
    key: &ToothKey,
    record: Arc<ToothRecord>,
    origin: RecordOrigin,
    previous: &MergedChart,
) -> Arc<MergedTooth> {
    if let Some(prev) = previous.get(key) {
        if prev.origin == origin && (Arc::ptr_eq(&prev.record, &record) || prev.record == record) {
            return Arc::clone(prev);
        }
    }
    let display = to_display(&record, origin);
    Arc::new(MergedTooth {
        record,
        display,
        origin,
    })
}

/// Plain display map for hosts that do not care about identity.
pub fn display_map(merged: &MergedChart) -> BTreeMap<ToothKey, DisplayRecord> {
    merged
        .iter()
        .map(|(key, tooth)| (key.clone(), tooth.display.clone()))
        .collect()
}
