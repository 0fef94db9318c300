use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(ToothStatus {
    Healthy => "healthy",
    Caries => "caries",
    Filled => "filled",
    Crown => "crown",
    Missing => "missing",
    Attention => "attention",
    RootCanal => "root_canal",
    ExtractionNeeded => "extraction_needed",
    Implant => "implant",
    Bridge => "bridge",
    Veneer => "veneer",
    Orthodontic => "orthodontic",
});

impl ToothStatus {
    /// Lenient parse for free-form status input: case, surrounding
    /// whitespace, hyphens and inner spaces are tolerated ("Root Canal").
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let canonical: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        canonical.parse().ok()
    }
}

str_enum!(
    /// Tables the chart listens to. The first holds the chart's own rows;
    /// the other two only influence what the chart displays.
    ChartTable {
        ToothDiagnoses => "tooth_diagnoses",
        Appointments => "appointments",
        TreatmentPlans => "treatment_plans",
    }
);

str_enum!(ChangeKind {
    Insert => "INSERT",
    Update => "UPDATE",
    Delete => "DELETE",
});

str_enum!(AppointmentStatus {
    Scheduled => "scheduled",
    Confirmed => "confirmed",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
    NoShow => "no_show",
});

str_enum!(TreatmentPlanStatus {
    Planned => "planned",
    InProgress => "in_progress",
    Completed => "completed",
    Abandoned => "abandoned",
});
