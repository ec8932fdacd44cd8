//! Static schema registry: one declarative handler per extract type, carrying
//! the landing column order, the staging transformations, and the natural
//! key. Adding an extract means adding a handler here plus the matching
//! migration; nothing is resolved at runtime beyond a table lookup.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::coerce::TypedValue;
use crate::errors::SchemaError;
use crate::extract::ExtractType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub enum ValidationRule {
    /// NHI format: three letters then four digits, or the 2023 expanded
    /// range of two digits and two letters. The letters I and O are never
    /// issued.
    Nhi,
    Email,
    MaxLength(usize),
    IntegerRange { min: i64, max: i64 },
    OneOf(&'static [&'static str]),
}

static NHI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-HJ-NP-Z]{3}([0-9]{4}|[0-9]{2}[A-HJ-NP-Z]{2})$").expect("valid NHI regex")
});

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

impl ValidationRule {
    /// Rules only constrain the value shapes they understand; a rule paired
    /// with a differently-typed value passes.
    pub fn check(&self, value: &TypedValue) -> Result<(), String> {
        match (self, value) {
            (ValidationRule::Nhi, TypedValue::Text(text)) => {
                if NHI_RE.is_match(text) {
                    Ok(())
                } else {
                    Err(format!("'{text}' is not a valid NHI"))
                }
            }
            (ValidationRule::Email, TypedValue::Text(text)) => {
                if EMAIL_RE.is_match(text) {
                    Ok(())
                } else {
                    Err(format!("'{text}' is not a valid email address"))
                }
            }
            (ValidationRule::MaxLength(max), TypedValue::Text(text)) => {
                if text.chars().count() <= *max {
                    Ok(())
                } else {
                    Err(format!("value exceeds maximum length {max}"))
                }
            }
            (ValidationRule::IntegerRange { min, max }, TypedValue::Integer(n)) => {
                if (*min..=*max).contains(n) {
                    Ok(())
                } else {
                    Err(format!("{n} is outside the range {min}..={max}"))
                }
            }
            (ValidationRule::OneOf(allowed), TypedValue::Text(text)) => {
                if allowed.contains(&text.as_str()) {
                    Ok(())
                } else {
                    Err(format!("'{text}' is not one of {allowed:?}"))
                }
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnTransform {
    /// Landing column the value is read from.
    pub source: &'static str,
    /// Staging column the value is written to.
    pub target: &'static str,
    pub target_type: TargetType,
    pub required: bool,
    pub rules: &'static [ValidationRule],
}

const fn col(
    source: &'static str,
    target_type: TargetType,
    required: bool,
    rules: &'static [ValidationRule],
) -> ColumnTransform {
    ColumnTransform {
        source,
        target: source,
        target_type,
        required,
        rules,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractHandler {
    pub extract_type: ExtractType,
    pub landing_table: &'static str,
    pub staging_table: &'static str,
    /// Positional mapping from source fields to landing columns.
    pub columns: &'static [&'static str],
    /// Conflict columns for the staging upsert.
    pub natural_keys: &'static [&'static str],
    pub transforms: &'static [ColumnTransform],
}

impl ExtractHandler {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

use TargetType::{Boolean, Date, Decimal, Integer, Text, Timestamp};
use ValidationRule::{Email, IntegerRange, MaxLength, Nhi, OneOf};

const ID_RULES: &[ValidationRule] = &[];
const PRACTICE_RULES: &[ValidationRule] = &[MaxLength(4)];
const PER_ORG_RULES: &[ValidationRule] = &[MaxLength(5)];

static PATIENTS: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Patients,
    landing_table: "raw.patients",
    staging_table: "stg.patients",
    columns: &[
        "patient_id",
        "nhi_number",
        "practice_id",
        "per_org_id",
        "first_name",
        "last_name",
        "date_of_birth",
        "gender_code",
        "email",
        "phone_mobile",
        "address_line_1",
        "suburb",
        "city",
        "postcode",
        "enrolment_date",
        "is_deleted",
        "loaded_date_time",
    ],
    natural_keys: &["patient_id", "practice_id", "per_org_id"],
    transforms: &[
        col("patient_id", Integer, true, ID_RULES),
        col("nhi_number", Text, false, &[Nhi]),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("first_name", Text, false, &[MaxLength(100)]),
        col("last_name", Text, true, &[MaxLength(100)]),
        col("date_of_birth", Date, false, &[]),
        col("gender_code", Text, false, &[OneOf(&["M", "F", "U", "O"])]),
        col("email", Text, false, &[Email, MaxLength(320)]),
        col("phone_mobile", Text, false, &[MaxLength(30)]),
        col("address_line_1", Text, false, &[MaxLength(200)]),
        col("suburb", Text, false, &[MaxLength(100)]),
        col("city", Text, false, &[MaxLength(100)]),
        col("postcode", Text, false, &[MaxLength(10)]),
        col("enrolment_date", Date, false, &[]),
        col("is_deleted", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static PROVIDERS: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Providers,
    landing_table: "raw.providers",
    staging_table: "stg.providers",
    columns: &[
        "provider_id",
        "practice_id",
        "per_org_id",
        "council_number",
        "first_name",
        "last_name",
        "provider_type_code",
        "specialty",
        "start_date",
        "end_date",
        "is_active",
        "loaded_date_time",
    ],
    natural_keys: &["provider_id", "practice_id", "per_org_id"],
    transforms: &[
        col("provider_id", Integer, true, ID_RULES),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("council_number", Text, false, &[MaxLength(20)]),
        col("first_name", Text, false, &[MaxLength(100)]),
        col("last_name", Text, true, &[MaxLength(100)]),
        col(
            "provider_type_code",
            Text,
            false,
            &[OneOf(&["GP", "NP", "RN", "MW", "OT"])],
        ),
        col("specialty", Text, false, &[MaxLength(100)]),
        col("start_date", Date, false, &[]),
        col("end_date", Date, false, &[]),
        col("is_active", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static APPOINTMENTS: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Appointments,
    landing_table: "raw.appointments",
    staging_table: "stg.appointments",
    columns: &[
        "appointment_id",
        "patient_id",
        "provider_id",
        "practice_id",
        "per_org_id",
        "appointment_time",
        "duration_minutes",
        "status_code",
        "arrival_time",
        "billed_amount",
        "notes",
        "is_deleted",
        "loaded_date_time",
    ],
    natural_keys: &["appointment_id", "practice_id", "per_org_id"],
    transforms: &[
        col("appointment_id", Integer, true, ID_RULES),
        col("patient_id", Integer, true, ID_RULES),
        col("provider_id", Integer, false, ID_RULES),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("appointment_time", Timestamp, true, &[]),
        col(
            "duration_minutes",
            Integer,
            false,
            &[IntegerRange { min: 0, max: 480 }],
        ),
        col(
            "status_code",
            Text,
            false,
            &[OneOf(&["BOOKED", "ARRIVED", "COMPLETED", "DNA", "CANCELLED"])],
        ),
        col("arrival_time", Timestamp, false, &[]),
        col("billed_amount", Decimal, false, &[]),
        col("notes", Text, false, &[MaxLength(2000)]),
        col("is_deleted", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static IMMUNISATIONS: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Immunisations,
    landing_table: "raw.immunisations",
    staging_table: "stg.immunisations",
    columns: &[
        "immunisation_id",
        "patient_id",
        "practice_id",
        "per_org_id",
        "vaccine_code",
        "vaccine_name",
        "dose_number",
        "administered_at",
        "batch_number",
        "expiry_date",
        "provider_id",
        "outcome_code",
        "is_deleted",
        "loaded_date_time",
    ],
    natural_keys: &["immunisation_id", "practice_id", "per_org_id"],
    transforms: &[
        col("immunisation_id", Integer, true, ID_RULES),
        col("patient_id", Integer, true, ID_RULES),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("vaccine_code", Text, true, &[MaxLength(20)]),
        col("vaccine_name", Text, false, &[MaxLength(200)]),
        col(
            "dose_number",
            Integer,
            false,
            &[IntegerRange { min: 1, max: 20 }],
        ),
        col("administered_at", Timestamp, true, &[]),
        col("batch_number", Text, false, &[MaxLength(50)]),
        col("expiry_date", Date, false, &[]),
        col("provider_id", Integer, false, ID_RULES),
        col(
            "outcome_code",
            Text,
            false,
            &[OneOf(&["GIVEN", "DECLINED", "CONTRAINDICATED"])],
        ),
        col("is_deleted", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static DIAGNOSES: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Diagnoses,
    landing_table: "raw.diagnoses",
    staging_table: "stg.diagnoses",
    columns: &[
        "diagnosis_id",
        "patient_id",
        "practice_id",
        "per_org_id",
        "disease_code",
        "disease_name",
        "classification_system",
        "diagnosis_date",
        "provider_id",
        "is_long_term",
        "is_deleted",
        "loaded_date_time",
    ],
    natural_keys: &["diagnosis_id", "practice_id", "per_org_id"],
    transforms: &[
        col("diagnosis_id", Integer, true, ID_RULES),
        col("patient_id", Integer, true, ID_RULES),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("disease_code", Text, true, &[MaxLength(20)]),
        col("disease_name", Text, false, &[MaxLength(200)]),
        col(
            "classification_system",
            Text,
            false,
            &[OneOf(&["READ", "SNOMED", "ICD10"])],
        ),
        col("diagnosis_date", Date, false, &[]),
        col("provider_id", Integer, false, ID_RULES),
        col("is_long_term", Boolean, false, &[]),
        col("is_deleted", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static MEDICATIONS: ExtractHandler = ExtractHandler {
    extract_type: ExtractType::Medications,
    landing_table: "raw.medications",
    staging_table: "stg.medications",
    columns: &[
        "medication_id",
        "patient_id",
        "practice_id",
        "per_org_id",
        "drug_code",
        "drug_name",
        "dose_description",
        "frequency_code",
        "start_date",
        "end_date",
        "quantity",
        "repeats",
        "provider_id",
        "is_deleted",
        "loaded_date_time",
    ],
    natural_keys: &["medication_id", "practice_id", "per_org_id"],
    transforms: &[
        col("medication_id", Integer, true, ID_RULES),
        col("patient_id", Integer, true, ID_RULES),
        col("practice_id", Text, true, PRACTICE_RULES),
        col("per_org_id", Text, true, PER_ORG_RULES),
        col("drug_code", Text, true, &[MaxLength(20)]),
        col("drug_name", Text, false, &[MaxLength(200)]),
        col("dose_description", Text, false, &[MaxLength(200)]),
        col("frequency_code", Text, false, &[MaxLength(20)]),
        col("start_date", Date, false, &[]),
        col("end_date", Date, false, &[]),
        col("quantity", Decimal, false, &[]),
        col("repeats", Integer, false, &[IntegerRange { min: 0, max: 12 }]),
        col("provider_id", Integer, false, ID_RULES),
        col("is_deleted", Boolean, false, &[]),
        col("loaded_date_time", Timestamp, true, &[]),
    ],
};

static HANDLERS: [&ExtractHandler; 6] = [
    &PATIENTS,
    &PROVIDERS,
    &APPOINTMENTS,
    &IMMUNISATIONS,
    &DIAGNOSES,
    &MEDICATIONS,
];

pub fn all_handlers() -> &'static [&'static ExtractHandler] {
    &HANDLERS
}

pub fn handler_for(extract: ExtractType) -> &'static ExtractHandler {
    HANDLERS
        .iter()
        .find(|handler| handler.extract_type == extract)
        .expect("every extract type has a registered handler")
}

/// Startup check that every handler is internally consistent: transform
/// sources name real landing columns, targets are unique, and the natural
/// key is a set of required targets.
pub fn validate_registry() -> Result<(), SchemaError> {
    for handler in HANDLERS {
        let extract = handler.extract_type.canonical_name();

        for transform in handler.transforms {
            if !handler.columns.contains(&transform.source) {
                return Err(SchemaError::UnknownSourceColumn {
                    extract,
                    column: transform.source,
                });
            }
        }

        let mut seen = Vec::with_capacity(handler.transforms.len());
        for transform in handler.transforms {
            if seen.contains(&transform.target) {
                return Err(SchemaError::DuplicateTargetColumn {
                    extract,
                    column: transform.target,
                });
            }
            seen.push(transform.target);
        }

        for key in handler.natural_keys {
            match handler.transforms.iter().find(|t| t.target == *key) {
                None => {
                    return Err(SchemaError::UnknownNaturalKey {
                        extract,
                        column: key,
                    })
                }
                Some(transform) if !transform.required => {
                    return Err(SchemaError::OptionalNaturalKey {
                        extract,
                        column: key,
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
