//! Selkie Core
//!
//! Core types, errors, and constants for the Selkie virtual actor
//! placement engine.
//!
//! # Overview
//!
//! Selkie decides, for a logical actor identity (a `(kind, id)` pair),
//! which single live process in a dynamic cluster currently owns it, and
//! keeps that mapping correct as members join and leave. This crate holds
//! the value types shared by every other crate in the workspace:
//!
//! - [`ClusterIdentity`] — the location-independent actor address
//! - [`Member`] / [`MemberId`] — an immutable snapshot of one cluster node
//! - [`TimeProvider`] / [`RngProvider`] — I/O abstractions so the same
//!   logic runs against the wall clock in production and a mock clock in
//!   tests
//!
//! # TigerStyle
//!
//! This crate follows explicit-limit engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g. `IDENTITY_ID_LENGTH_BYTES_MAX`)
//! - Assertions on construction, bounded iteration only

pub mod constants;
pub mod error;
pub mod identity;
pub mod io;
pub mod member;
pub mod telemetry;

pub use constants::*;
pub use error::{Error, Result};
pub use identity::ClusterIdentity;
pub use io::{MockClock, RngProvider, StdRngProvider, TimeProvider, WallClockTime};
pub use member::{Member, MemberId};
pub use telemetry::{init_telemetry, TelemetryConfig};
