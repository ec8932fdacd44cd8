//! The kahu ingestion engine: discovery over the object store, batch
//! planning, idempotent raw loading, schema-driven staging transformation,
//! and the orchestrator that drives them with bounded concurrency.

pub mod config;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod raw_loader;
pub mod staging;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorContext, ErrorKind, Result};
