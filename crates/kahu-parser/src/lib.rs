//! Feed-format knowledge for the kahu ingestion engine: the fixed positional
//! file naming convention, the multi-character CSV framing, and the
//! per-extract schema registry driving landing and staging.

pub mod coerce;
pub mod errors;
pub mod extract;
pub mod filename;
pub mod framer;
pub mod schema;

pub use coerce::{
    apply_transforms, coerce_value, CoercionSettings, FieldError, RejectCategory, TypedValue,
};
pub use errors::{FilenameError, FramerError, SchemaError};
pub use extract::{ExtractType, FullLoadRule};
pub use filename::{parse_object_key, ParsedFilename};
pub use framer::{Framer, FIELD_SEP, ROW_SEP};
pub use schema::{
    all_handlers, handler_for, validate_registry, ColumnTransform, ExtractHandler, TargetType,
    ValidationRule,
};

#[cfg(test)]
mod tests;
