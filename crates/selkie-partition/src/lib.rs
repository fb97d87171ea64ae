//! Selkie Partition
//!
//! Ring-partitioned identity ownership for Selkie.
//!
//! # Overview
//!
//! One [`PartitionOwner`] runs per cluster member. It owns the in-memory
//! identity table for every identity whose ring owner is this member:
//! it serves lookups, de-duplicates concurrent spawns, drives and
//! consumes handovers during topology changes, and resolves ownership
//! conflicts by keeping the most-recently-confirmed activation.
//!
//! The [`PlacementActivator`] is the receiving end of placement: it
//! spawns actor instances locally, idempotently per identity, and its
//! local table is what handover sources stream from.

pub mod activator;
pub mod error;
pub mod handover;
pub mod owner;

pub use activator::{ActorSpawner, PlacementActivator};
pub use error::{PartitionError, PartitionResult};
pub use handover::{ChunkOutcome, HandoverSink, HandoverSource};
pub use owner::{
    LookupOutcome, OwnerConfig, OwnerEvent, PartitionOwner, PartitionOwnerHandle, RebalanceMode,
};
