//! Selkie Lookup
//!
//! Storage-backed identity resolution for Selkie.
//!
//! # Overview
//!
//! An alternative to ring-partitioned ownership: the identity→location
//! mapping lives in shared external storage, guarded by optimistic spawn
//! locks instead of ring ownership.
//!
//! - [`LookupStorage`] — the consumed storage contract (acquire / wait /
//!   release lock semantics, single-writer activation persistence)
//! - [`MemoryLookupStorage`] — in-memory implementation with stale-lock
//!   reclaim, for tests and single-process deployments
//! - [`StorageLookup`] — the resolution front: PID cache plus a bounded
//!   worker pool keyed by identity hash, so one worker handles a given
//!   identity at a time and concurrent requests coalesce

pub mod error;
pub mod lookup;
pub mod storage;
mod worker;

pub use error::{LookupError, LookupResult};
pub use lookup::{LookupConfig, StorageLookup};
pub use storage::{LookupStorage, MemoryLookupStorage, SpawnLock};
