//! Engine error taxonomy: one tagged error value per failure kind, each
//! carrying a context record suitable for structured logging. Per-row
//! problems are not errors at all; they become rejection rows in staging.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use kahu_bucket::BucketError;
use kahu_parser::SchemaError;
use kahu_repository::RepositoryError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Where and when an error happened, attached to every engine error so the
/// logs stay correlated by run and object.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub load_run_id: Option<Uuid>,
    pub object_key: Option<String>,
    pub row_number: Option<u64>,
    pub column: Option<String>,
    pub operation: &'static str,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl ErrorContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            load_run_id: None,
            object_key: None,
            row_number: None,
            column: None,
            operation,
            timestamp: Utc::now(),
            retryable: false,
        }
    }

    pub fn run(mut self, load_run_id: Uuid) -> Self {
        self.load_run_id = Some(load_run_id);
        self
    }

    pub fn key(mut self, object_key: &str) -> Self {
        self.object_key = Some(object_key.to_string());
        self
    }

    pub fn row(mut self, row_number: u64) -> Self {
        self.row_number = Some(row_number);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    StoreTransient,
    StoreTerminal,
    ParseStructural,
    DbTransient,
    DbConstraint,
    ResourceExhaustion,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("object store failure during {operation}: {source}", operation = .context.operation)]
    Store {
        #[source]
        source: BucketError,
        context: ErrorContext,
    },

    #[error("structural parse failure: {message}")]
    ParseStructural {
        message: String,
        context: ErrorContext,
    },

    #[error("database failure during {operation}: {source}", operation = .context.operation)]
    Db {
        #[source]
        source: sqlx::Error,
        context: ErrorContext,
    },

    #[error("run registry failure: {0}")]
    Registry(#[from] RepositoryError),

    #[error("schema registry invalid: {0}")]
    Schema(#[from] SchemaError),

    #[error("resource exhaustion: {message}")]
    ResourceExhaustion {
        message: String,
        context: ErrorContext,
    },

    #[error("cancelled during {operation}", operation = .context.operation)]
    Cancelled { context: ErrorContext },
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
        }
    }

    pub fn store(source: BucketError, context: ErrorContext) -> Self {
        let retryable = source.is_transient();
        EngineError::Store {
            source,
            context: context.retryable(retryable),
        }
    }

    pub fn db(source: sqlx::Error, context: ErrorContext) -> Self {
        let retryable = db_error_is_transient(&source);
        EngineError::Db {
            source,
            context: context.retryable(retryable),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration { .. } => ErrorKind::Configuration,
            EngineError::Store { context, .. } => {
                if context.retryable {
                    ErrorKind::StoreTransient
                } else {
                    ErrorKind::StoreTerminal
                }
            }
            EngineError::ParseStructural { .. } => ErrorKind::ParseStructural,
            EngineError::Db { source, context } => {
                if context.retryable {
                    ErrorKind::DbTransient
                } else if is_constraint_violation(source) {
                    ErrorKind::DbConstraint
                } else {
                    ErrorKind::DbTransient
                }
            }
            EngineError::Registry(_) | EngineError::Schema(_) => ErrorKind::Configuration,
            EngineError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.context().map(|c| c.retryable).unwrap_or(false)
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            EngineError::Store { context, .. }
            | EngineError::ParseStructural { context, .. }
            | EngineError::Db { context, .. }
            | EngineError::ResourceExhaustion { context, .. }
            | EngineError::Cancelled { context } => Some(context),
            _ => None,
        }
    }
}

/// Connection-level and serialization failures are worth retrying; constraint
/// violations and data errors are not.
pub fn db_error_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            // serialization_failure, deadlock_detected, insufficient class
            Some("40001") | Some("40P01") | Some("53000") | Some("53300")
        ),
        _ => false,
    }
}

pub fn is_constraint_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            )
    )
}

/// cardinality_violation: ON CONFLICT touched the same target row twice in
/// one statement. Replaying the rows one statement at a time converges.
pub fn is_cardinality_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("21000")
    )
}
