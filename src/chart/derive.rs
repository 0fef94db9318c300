//! CH-04: Attribute derivation — raw tooth record to canonical status and color.
//!
//! Pure and total: no store, no I/O, no clock. Unknown explicit statuses fall
//! back to `attention`; records with nothing recognizable are `healthy`.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{DerivedAttributes, DisplayRecord, RecordOrigin, ToothColor, ToothRecord, ToothStatus};

/// Fill used for healthy teeth. An override equal to this is ignored.
pub const HEALTHY_FILL: &str = "#ffffff";

const DARK_FOREGROUND: &str = "#111827";
const LIGHT_FOREGROUND: &str = "#ffffff";

/// ITU-R BT.601 perceived brightness threshold (0–255 scale).
const BRIGHTNESS_THRESHOLD: u32 = 128;

/// A compiled keyword pattern with the status it implies.
struct KeywordRule {
    regex: Regex,
    status: ToothStatus,
}

fn rule(pattern: &str, status: ToothStatus) -> KeywordRule {
    KeywordRule {
        regex: Regex::new(pattern).expect("Invalid keyword regex pattern"),
        status,
    }
}

const EXTRACTION_PATTERN: &str =
    r"(?i)\b(?:extract\w*|exodont\w*|extracci[oó]n|exodoncia|non[- ]restorable)\b";

/// Treatment vocabulary that wins over whatever the diagnosis says.
static TREATMENT_PRIORITY: LazyLock<Vec<KeywordRule>> =
    LazyLock::new(|| vec![rule(EXTRACTION_PATTERN, ToothStatus::ExtractionNeeded)]);

/// Ordered: the first matching rule decides.
static KEYWORD_RULES: LazyLock<Vec<KeywordRule>> = LazyLock::new(|| {
    vec![
        rule(EXTRACTION_PATTERN, ToothStatus::ExtractionNeeded),
        rule(r"(?i)\b(?:missing|absent|edentulous|ausente)\b", ToothStatus::Missing),
        rule(r"(?i)\bimplant\w*\b", ToothStatus::Implant),
        rule(
            r"(?i)\b(?:root[- ]canal|endodon\w*|pulpectomy|pulpotomy|conducto)\b",
            ToothStatus::RootCanal,
        ),
        rule(r"(?i)\b(?:bridge|pontic|puente)\b", ToothStatus::Bridge),
        rule(r"(?i)\b(?:crown|corona)\b", ToothStatus::Crown),
        rule(r"(?i)\b(?:veneers?|carillas?)\b", ToothStatus::Veneer),
        rule(
            r"(?i)\b(?:orthodont\w*|ortodonc\w*|brackets?|braces|aligners?)\b",
            ToothStatus::Orthodontic,
        ),
        rule(r"(?i)\b(?:caries|carious|cavity|cavities|decay\w*)\b", ToothStatus::Caries),
        rule(
            r"(?i)\b(?:fill(?:ing|ed)|restor(?:ation|ed)|amalgam|composite|obturaci[oó]n|resina)\b",
            ToothStatus::Filled,
        ),
        rule(
            r"(?i)\b(?:fractur\w*|abscess\w*|pain\w*|sensitiv\w*|periodont\w*|gingivitis|mobility|inflam\w*|dolor)\b",
            ToothStatus::Attention,
        ),
    ]
});

/// Fixed status → fill table.
pub fn status_fill(status: ToothStatus) -> &'static str {
    match status {
        ToothStatus::Healthy => HEALTHY_FILL,
        ToothStatus::Caries => "#ef4444",
        ToothStatus::Filled => "#3b82f6",
        ToothStatus::Crown => "#eab308",
        ToothStatus::Missing => "#9ca3af",
        ToothStatus::Attention => "#f97316",
        ToothStatus::RootCanal => "#a855f7",
        ToothStatus::ExtractionNeeded => "#7f1d1d",
        ToothStatus::Implant => "#14b8a6",
        ToothStatus::Bridge => "#6366f1",
        ToothStatus::Veneer => "#ec4899",
        ToothStatus::Orthodontic => "#06b6d4",
    }
}

/// Derive status and color for one record.
pub fn derive_display(record: &ToothRecord) -> DerivedAttributes {
    let status = derive_status(
        record.status.as_deref(),
        record.primary_diagnosis.as_deref(),
        record.recommended_treatment.as_deref(),
    );
    let color = derive_color(status, record.color_override.as_deref());
    DerivedAttributes { status, color }
}

/// Explicit status wins; otherwise keywords; otherwise healthy.
pub fn derive_status(
    explicit: Option<&str>,
    diagnosis: Option<&str>,
    treatment: Option<&str>,
) -> ToothStatus {
    if let Some(raw) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return ToothStatus::parse_lenient(raw).unwrap_or(ToothStatus::Attention);
    }

    if let Some(status) = treatment.and_then(|t| first_match(&TREATMENT_PRIORITY, t)) {
        return status;
    }

    diagnosis
        .and_then(|d| first_match(&KEYWORD_RULES, d))
        .or_else(|| treatment.and_then(|t| first_match(&KEYWORD_RULES, t)))
        .unwrap_or(ToothStatus::Healthy)
}

fn first_match(rules: &[KeywordRule], text: &str) -> Option<ToothStatus> {
    rules
        .iter()
        .find(|r| r.regex.is_match(text))
        .map(|r| r.status)
}

/// Table color unless a usable override is present.
pub fn derive_color(status: ToothStatus, color_override: Option<&str>) -> ToothColor {
    let fill = color_override
        .and_then(normalize_hex)
        .filter(|hex| hex != HEALTHY_FILL)
        .unwrap_or_else(|| status_fill(status).to_string());
    let foreground = readable_foreground(&fill).to_string();
    ToothColor { fill, foreground }
}

/// Dark text on bright fills, light text on dark fills.
pub fn readable_foreground(fill: &str) -> &'static str {
    match parse_rgb(fill) {
        Some((r, g, b)) => {
            let brightness = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
            if brightness >= BRIGHTNESS_THRESHOLD {
                DARK_FOREGROUND
            } else {
                LIGHT_FOREGROUND
            }
        }
        None => DARK_FOREGROUND,
    }
}

/// Accepts `#rgb`, `#rrggbb`, with or without `#`; returns lowercase `#rrggbb`.
pub fn normalize_hex(raw: &str) -> Option<String> {
    let digits = raw.trim().trim_start_matches('#');
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let expanded = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect::<String>(),
        6 => digits.to_string(),
        _ => return None,
    };
    Some(format!("#{}", expanded.to_ascii_lowercase()))
}

fn parse_rgb(hex: &str) -> Option<(u8, u8, u8)> {
    let hex = normalize_hex(hex)?;
    let r = u8::from_str_radix(&hex[1..3], 16).ok()?;
    let g = u8::from_str_radix(&hex[3..5], 16).ok()?;
    let b = u8::from_str_radix(&hex[5..7], 16).ok()?;
    Some((r, g, b))
}

/// Presentation record for a resolved tooth.
pub fn to_display(record: &ToothRecord, origin: RecordOrigin) -> DisplayRecord {
    let DerivedAttributes { status, color } = derive_display(record);
    DisplayRecord {
        key: record.key.clone(),
        status,
        color,
        diagnosis: record.primary_diagnosis.clone(),
        treatment: record.recommended_treatment.clone(),
        notes: record.notes.clone(),
        examination_date: record.examination_date,
        origin,
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
