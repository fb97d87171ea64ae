//! Selkie Cluster
//!
//! Topology tracking and consistent-hash placement for Selkie.
//!
//! # Overview
//!
//! This crate provides:
//! - [`HashRing`] — consistent hashing with virtual points per member
//! - [`TopologyTracker`] — the locally-known active member set, delta
//!   computation, block list, and snapshot publication
//! - [`KindRegistry`] — per-kind activator placement strategies
//! - [`PartitionMessage`] — the transport-agnostic protocol message union
//! - [`ConsensusHandle`] — the consumed gossip consensus contract

pub mod activation;
pub mod client;
pub mod consensus;
pub mod error;
pub mod messages;
pub mod ring;
pub mod strategy;
pub mod topology;

pub use activation::{Activation, Pid};
pub use client::ClusterClient;
pub use consensus::{ConsensusChecks, ConsensusHandle, ConsensusOutcome, MemoryConsensus};
pub use error::{ClientError, ClusterResult, TopologyError};
pub use messages::{HandoverAckState, HandoverChunk, HandoverMode, PartitionMessage};
pub use ring::HashRing;
pub use strategy::KindRegistry;
pub use topology::{EpochToken, Topology, TopologyEvent, TopologyTracker};
