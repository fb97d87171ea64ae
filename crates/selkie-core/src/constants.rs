//! TigerStyle constants for Selkie
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identity Limits
// =============================================================================

/// Maximum length of an identity kind in bytes
pub const IDENTITY_KIND_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an identity id in bytes
pub const IDENTITY_ID_LENGTH_BYTES_MAX: usize = 256;

// =============================================================================
// Member Limits
// =============================================================================

/// Maximum length of a member ID in bytes
pub const MEMBER_ID_LENGTH_BYTES_MAX: usize = 128;

/// Maximum number of members in a cluster
pub const CLUSTER_MEMBERS_COUNT_MAX: usize = 1000;

// =============================================================================
// Hash Ring
// =============================================================================

/// Default number of virtual points each member contributes to the ring
pub const RING_VIRTUAL_POINTS_COUNT_DEFAULT: usize = 50;

/// Maximum number of virtual points per member
pub const RING_VIRTUAL_POINTS_COUNT_MAX: usize = 1024;

// =============================================================================
// Handover
// =============================================================================

/// Default number of activations carried by one handover chunk
pub const HANDOVER_CHUNK_ACTIVATIONS_COUNT_DEFAULT: usize = 100;

/// Maximum retries for a sender whose delta handover failed validation
pub const HANDOVER_RETRY_COUNT_MAX: u32 = 3;

// =============================================================================
// Activation / Spawn
// =============================================================================

/// Default deadline for a cross-member activation request (5 sec)
pub const SPAWN_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Maximum depth of a partition owner's mailbox
pub const OWNER_MAILBOX_DEPTH_MAX: usize = 10_000;

/// Capacity of the topology/ownership event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Storage-Backed Lookup
// =============================================================================

/// Default number of lookup workers in the bounded pool
pub const LOOKUP_WORKERS_COUNT_DEFAULT: usize = 8;

/// Maximum depth of one lookup worker's queue
pub const LOOKUP_WORKER_QUEUE_DEPTH_MAX: usize = 1024;

/// Time after which an unreleased spawn lock may be reclaimed (10 sec)
pub const LOCK_STALE_TIMEOUT_MS_DEFAULT: u64 = 10 * 1000;

/// Default bounded wait for another resolver's activation to appear (5 sec)
pub const LOCK_WAIT_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

// =============================================================================
// Consensus
// =============================================================================

/// Default bounded wait for the in-flight-activation consensus check (3 sec)
pub const CONSENSUS_TIMEOUT_MS_DEFAULT: u64 = 3 * 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(IDENTITY_ID_LENGTH_BYTES_MAX >= 64);
    assert!(CLUSTER_MEMBERS_COUNT_MAX >= 1);
    assert!(RING_VIRTUAL_POINTS_COUNT_DEFAULT >= 1);
    assert!(RING_VIRTUAL_POINTS_COUNT_DEFAULT <= RING_VIRTUAL_POINTS_COUNT_MAX);
    assert!(HANDOVER_CHUNK_ACTIVATIONS_COUNT_DEFAULT >= 1);
    assert!(LOOKUP_WORKERS_COUNT_DEFAULT >= 1);
    assert!(LOCK_STALE_TIMEOUT_MS_DEFAULT > LOCK_WAIT_TIMEOUT_MS_DEFAULT);
};
