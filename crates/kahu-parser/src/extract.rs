use serde::{Deserialize, Serialize};

/// Logical category of feed file. Each extract type owns one landing table,
/// one staging table, and one transformation list in the schema registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractType {
    Patients,
    Providers,
    Appointments,
    Immunisations,
    Diagnoses,
    Medications,
}

impl ExtractType {
    pub const ALL: [ExtractType; 6] = [
        ExtractType::Patients,
        ExtractType::Providers,
        ExtractType::Appointments,
        ExtractType::Immunisations,
        ExtractType::Diagnoses,
        ExtractType::Medications,
    ];

    /// Exact-match decode of the file name token. The feed is inconsistent
    /// about pluralization for some extracts, so singular variants are
    /// accepted alongside the canonical names.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "Patients" | "Patient" => Some(ExtractType::Patients),
            "Providers" | "Provider" => Some(ExtractType::Providers),
            "Appointments" | "Appointment" => Some(ExtractType::Appointments),
            "Immunisations" | "Immunisation" => Some(ExtractType::Immunisations),
            "Diagnoses" | "Diagnosis" => Some(ExtractType::Diagnoses),
            "Medications" | "Medication" => Some(ExtractType::Medications),
            _ => None,
        }
    }

    pub fn canonical_name(&self) -> &'static str {
        match self {
            ExtractType::Patients => "Patients",
            ExtractType::Providers => "Providers",
            ExtractType::Appointments => "Appointments",
            ExtractType::Immunisations => "Immunisations",
            ExtractType::Diagnoses => "Diagnoses",
            ExtractType::Medications => "Medications",
        }
    }

    /// Lowercase table suffix shared by `raw.<suffix>` and `stg.<suffix>`.
    pub fn table_suffix(&self) -> &'static str {
        match self {
            ExtractType::Patients => "patients",
            ExtractType::Providers => "providers",
            ExtractType::Appointments => "appointments",
            ExtractType::Immunisations => "immunisations",
            ExtractType::Diagnoses => "diagnoses",
            ExtractType::Medications => "medications",
        }
    }

    pub fn parse_name(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|extract| extract.canonical_name().eq_ignore_ascii_case(value))
    }
}

impl std::fmt::Display for ExtractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// How to derive the full-load vs delta flag from a parsed name. The feed
/// documentation hints at the discriminator without pinning it down, so the
/// rule stays pluggable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullLoadRule {
    /// A delivery whose window collapses to a single instant is a snapshot
    /// of the whole table: `date_from == date_to`.
    #[default]
    SnapshotWindow,
    /// The feed only ever ships deltas.
    Never,
}
