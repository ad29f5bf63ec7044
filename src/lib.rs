//! kfs-meta: metadata index and concurrent enrichment engine for a file tree.
//!
//! The pieces, leaves first:
//! - Store (SQLite-backed records keyed by root-relative path)
//! - Indexer (reconciles the tree with the store, converges under change)
//! - Caches (TTL + LRU for sizes, lookups and responses)
//! - Enricher (bounded pool resolving listing entries against slow lookups)
//!
//! `GlobalState` builds them once and hands them to listings, operations and
//! the Librarian.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod librarian;
pub mod listing;
pub mod operations;
pub mod protocol;
pub mod state;
pub mod storage;

pub use config::Config;
pub use error::{MetaError, Result};
pub use state::{Caches, GlobalState, SharedState};
pub use storage::{MetaRecord, MetaStore};
