use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::enums::ToothStatus;
use super::tooth::ToothKey;

/// Fill and readable foreground, both `#rrggbb`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToothColor {
    pub fill: String,
    pub foreground: String,
}

/// Output of attribute derivation for one raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAttributes {
    pub status: ToothStatus,
    pub color: ToothColor,
}

/// Where the merged record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Store,
    Override,
}

/// One renderable cell: everything the chart needs without further lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub key: ToothKey,
    pub status: ToothStatus,
    pub color: ToothColor,
    pub diagnosis: Option<String>,
    pub treatment: Option<String>,
    pub notes: Option<String>,
    pub examination_date: Option<NaiveDate>,
    pub origin: RecordOrigin,
}
