//! Sinkhouse Metadata Store
//!
//! This crate holds the coordination layer every other crate builds on: a
//! revisioned key-value store, optimistic atomic operations over it, and
//! watch-driven mirrors that keep local copies of key prefixes.
//!
//! ## Purpose
//!
//! All shared state of the pipeline (sink definitions, files, slices,
//! statistics, volume registrations, node registrations) lives in one store.
//! Workers never talk to each other; they coordinate exclusively through
//! atomic transactions and watches on this store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//! │  Repositories   │   │   Volume/Node   │   │     Checker     │
//! │ (files, slices) │   │  registration   │   │  (mirrors)      │
//! └────────┬────────┘   └────────┬────────┘   └────────┬────────┘
//!          │ AtomicOp            │ leases              │ Mirror
//!          ▼                     ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  KvStore (revisions, txn, watch)             │ ◄── You are here
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use sinkhouse_metadata::{AtomicOp, KvStore, MemoryKvStore};
//! use std::sync::Arc;
//!
//! let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
//! let op = AtomicOp::new(store.clone());
//!
//! let total: u64 = op
//!     .run("increment", |tx| async move {
//!         let value: u64 = tx.get_json("counter").await?.unwrap_or(0);
//!         tx.put_json("counter", &(value + 1))?;
//!         Ok::<_, sinkhouse_metadata::MetadataError>(value + 1)
//!     })
//!     .await?;
//! ```
//!
//! ## Thread Safety
//! - `KvStore` implementations are Send + Sync and shared as `Arc<dyn KvStore>`
//! - `MemoryKvStore` serializes transactions behind one async mutex
//! - `Mirror` reads take a short synchronous read lock

pub mod atomic;
pub mod error;
pub mod kv;
pub mod memory;
pub mod mirror;

pub use atomic::{AtomicOp, Tx, DEFAULT_MAX_ATTEMPTS};
pub use error::{MetadataError, Result};
pub use kv::{
    encode, Compare, CompareOp, EventKind, GetPrefixResponse, KeyValue, KvStore, LeaseId, Op,
    Revision, Txn, TxnResponse, WatchEvent, WatchResponse, WatchStream,
};
pub use memory::MemoryKvStore;
pub use mirror::{json_mapper, Mapper, Mirror};
