use thiserror::Error;

/// A file name that does not decode is skipped with a warning, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("key '{0}' does not end with .csv")]
    NotCsv(String),

    #[error("name '{name}' is too short: {len} chars, need at least {min}")]
    TooShort { name: String, len: usize, min: usize },

    #[error("unrecognized extract type token '{token}' in '{name}'")]
    UnknownExtractType { name: String, token: String },

    #[error("{field} value '{value}' is not a valid YYYYMMDDHHMM timestamp")]
    InvalidDate {
        field: &'static str,
        value: String,
    },

    #[error("dates out of order in '{name}': expected date_from <= date_to <= date_extracted")]
    DatesOutOfOrder { name: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("row starting near byte {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{extract}: transform source column '{column}' is not a declared landing column")]
    UnknownSourceColumn {
        extract: &'static str,
        column: &'static str,
    },

    #[error("{extract}: duplicate target column '{column}'")]
    DuplicateTargetColumn {
        extract: &'static str,
        column: &'static str,
    },

    #[error("{extract}: natural key column '{column}' is not a transform target")]
    UnknownNaturalKey {
        extract: &'static str,
        column: &'static str,
    },

    #[error("{extract}: natural key column '{column}' must be declared required")]
    OptionalNaturalKey {
        extract: &'static str,
        column: &'static str,
    },
}
