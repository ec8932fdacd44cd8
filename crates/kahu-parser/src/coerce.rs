//! Row-level typed coercion for the staging transformer. Landing preserves
//! every source field as text; this module turns those strings into typed
//! values per the extract's declared transformations, collecting rejection
//! detail instead of failing the row set.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::schema::{ExtractHandler, TargetType};

#[derive(Debug, Clone)]
pub struct CoercionSettings {
    pub time_zone: Tz,
    pub date_format: String,
    pub timestamp_format: String,
    /// Maximum fraction digits accepted for decimal targets.
    pub decimal_precision: u32,
    pub trim_strings: bool,
    pub nullify_empty_strings: bool,
}

impl Default for CoercionSettings {
    fn default() -> Self {
        Self {
            time_zone: chrono_tz::Pacific::Auckland,
            date_format: "%Y-%m-%d".to_string(),
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            decimal_precision: 4,
            trim_strings: true,
            nullify_empty_strings: true,
        }
    }
}

/// A coerced staging value, ready to bind into the upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Text(String),
    Integer(i64),
    /// Validated numeric literal; bound as text and cast by Postgres.
    Decimal(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    MissingRequired,
    TypeCoercion,
    Validation,
    DbConstraint,
}

impl RejectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCategory::MissingRequired => "missing_required",
            RejectCategory::TypeCoercion => "type_coercion",
            RejectCategory::Validation => "validation",
            RejectCategory::DbConstraint => "db_constraint",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub column: String,
    pub category: RejectCategory,
    pub message: String,
}

/// Apply the handler's transformations to one landing row. `values[i]` must
/// hold the landing value for `handler.transforms[i].source`. Returns the
/// typed values in transform order, or every field error found on the row.
pub fn apply_transforms(
    handler: &ExtractHandler,
    values: &[Option<String>],
    settings: &CoercionSettings,
) -> Result<Vec<TypedValue>, Vec<FieldError>> {
    let mut typed = Vec::with_capacity(handler.transforms.len());
    let mut errors = Vec::new();

    for (transform, raw) in handler.transforms.iter().zip(values) {
        let resolved = resolve(raw.as_deref(), settings);

        let Some(text) = resolved else {
            if transform.required {
                errors.push(FieldError {
                    column: transform.target.to_string(),
                    category: RejectCategory::MissingRequired,
                    message: format!("required column '{}' is null", transform.source),
                });
            } else {
                typed.push(TypedValue::Null);
            }
            continue;
        };

        let value = match coerce_value(&text, transform.target_type, settings) {
            Ok(value) => value,
            Err(message) => {
                errors.push(FieldError {
                    column: transform.target.to_string(),
                    category: RejectCategory::TypeCoercion,
                    message,
                });
                continue;
            }
        };

        let mut rejected = false;
        for rule in transform.rules {
            if let Err(message) = rule.check(&value) {
                errors.push(FieldError {
                    column: transform.target.to_string(),
                    category: RejectCategory::Validation,
                    message,
                });
                rejected = true;
            }
        }
        if !rejected {
            typed.push(value);
        }
    }

    if errors.is_empty() {
        Ok(typed)
    } else {
        Err(errors)
    }
}

fn resolve(raw: Option<&str>, settings: &CoercionSettings) -> Option<String> {
    let raw = raw?;
    let value = if settings.trim_strings {
        raw.trim()
    } else {
        raw
    };
    if settings.nullify_empty_strings && value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

pub fn coerce_value(
    text: &str,
    target: TargetType,
    settings: &CoercionSettings,
) -> Result<TypedValue, String> {
    match target {
        TargetType::Text => Ok(TypedValue::Text(text.to_string())),
        TargetType::Integer => text
            .parse::<i64>()
            .map(TypedValue::Integer)
            .map_err(|_| format!("'{text}' is not an integer")),
        TargetType::Decimal => {
            normalize_decimal(text, settings.decimal_precision).map(TypedValue::Decimal)
        }
        TargetType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(TypedValue::Boolean(true)),
            "false" | "f" | "no" | "n" | "0" => Ok(TypedValue::Boolean(false)),
            _ => Err(format!("'{text}' is not a boolean")),
        },
        TargetType::Date => NaiveDate::parse_from_str(text, &settings.date_format)
            .map(TypedValue::Date)
            .map_err(|_| format!("'{text}' does not match date format {}", settings.date_format)),
        TargetType::Timestamp => {
            let naive = NaiveDateTime::parse_from_str(text, &settings.timestamp_format).map_err(
                |_| {
                    format!(
                        "'{text}' does not match timestamp format {}",
                        settings.timestamp_format
                    )
                },
            )?;
            naive
                .and_local_timezone(settings.time_zone)
                .earliest()
                .map(|local| TypedValue::Timestamp(local.with_timezone(&Utc)))
                .ok_or_else(|| format!("'{text}' does not exist in {}", settings.time_zone))
        }
    }
}

/// Validate a decimal literal: optional sign, digits, at most one point,
/// fraction no wider than `precision`. The literal passes through otherwise
/// untouched so re-running staging reproduces byte-identical values.
fn normalize_decimal(text: &str, precision: u32) -> Result<String, String> {
    let unsigned = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };

    let digits_ok = !int_part.is_empty()
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.map_or(true, |frac| {
            !frac.is_empty() && frac.bytes().all(|b| b.is_ascii_digit())
        });
    if !digits_ok {
        return Err(format!("'{text}' is not a decimal number"));
    }

    if let Some(frac) = frac_part {
        if frac.len() as u32 > precision {
            return Err(format!(
                "'{text}' has {} fraction digits, maximum is {precision}",
                frac.len()
            ));
        }
    }

    Ok(text.strip_prefix('+').unwrap_or(text).to_string())
}
