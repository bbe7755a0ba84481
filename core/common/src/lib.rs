//! Common utilities and types shared across the Outbox crates.
//!
//! This module provides the operation data model, identifiers and the
//! error taxonomy used by the storage backends and the sync engine.

pub mod error;
pub mod operation;
pub mod types;

pub use error::{Error, ErrorClass, Result, SyncError};
pub use operation::{Operation, OperationStatus};
pub use types::{OperationId, ResourceKey};
