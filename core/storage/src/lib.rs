//! Durable storage for the Outbox operation queue.
//!
//! This module provides a trait-based interface for persistence backends
//! (SQLite, in-memory) holding queued operations and committed server
//! snapshots.
//!
//! # Design Principles
//! - Pure storage: no ordering or retry policy lives here
//! - Synchronous writes: a successful `put` means the operation is durable
//! - Compare-and-set status updates: no locks beyond the single record

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DurableStore, StatusUpdate};
