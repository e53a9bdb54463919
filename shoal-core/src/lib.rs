//! Shoal Core - Strongly-typed cost vectors and identifiers for the Shoal
//! I/O scheduler.
//!
//! This crate provides the leaf types shared between the per-shard scheduler
//! and the upper I/O layers that feed it. It does NOT provide the scheduler
//! itself - that lives in `shoal-flow`.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `ClassId` with a raw index
//! - **Two-axis costs**: Every request carries an explicit `IoTicket`
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod staircase;
mod ticket;
mod types;

pub use staircase::Staircase;
pub use ticket::{
    wrapping_difference, IoTicket, MINIMAL_REQUEST_SIZE, READ_REQUEST_BASE_COUNT,
    REQUEST_TICKET_SIZE_SHIFT,
};
pub use types::ClassId;
