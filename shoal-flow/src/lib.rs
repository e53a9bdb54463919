//! Fair I/O scheduling for Shoal.
//!
//! This crate admits disk-bound work from multiple priority classes running
//! on many shards such that the aggregate rate across all shards stays
//! within a configured device capacity envelope, and within each shard the
//! queued classes observe weighted-fair service. It consists of two tightly
//! coupled components:
//!
//! - **[`FairGroup`]**: a process-wide token bucket built from wrapping
//!   monotonic rover counters, rationing a shared capacity budget to many
//!   independent shards without a mutex.
//! - **[`FairQueue`]**: a per-shard weighted scheduler built around an
//!   accumulated-cost priority heap, with a pending-capacity reservation
//!   that cooperates with the group.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    FairGroup (per device)                  │
//! │        tail rover ──────▶ head rover   (atomic u64)        │
//! └────────▲──────────────────▲──────────────────▲─────────────┘
//!          │ grab/release     │                  │
//! ┌────────┴───────┐ ┌────────┴───────┐ ┌────────┴───────┐
//! │ FairQueue      │ │ FairQueue      │ │ FairQueue      │
//! │ (shard 0)      │ │ (shard 1)      │ │ (shard N)      │
//! │ class heap,    │ │                │ │                │
//! │ pending slot   │ │                │ │                │
//! └────────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! Requests carry an [`IoTicket`](shoal_core::IoTicket) cost vector that is
//! normalised against the group's cost capacity into integer capacity
//! units, the currency of the token bucket.
//!
//! # DST Compatibility
//!
//! All time-dependent operations accept `now_us` as a parameter rather than
//! reading system time. This allows deterministic simulation testing with
//! controlled time.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use shoal_core::{ClassId, IoTicket};
//! use shoal_flow::{FairGroup, FairGroupConfig, FairQueue, FairQueueConfig};
//!
//! let config = FairGroupConfig {
//!     rate_limit_duration_us: 100_000, // 100 ms latency goal
//!     ..FairGroupConfig::for_testing()
//! };
//! let group = Arc::new(FairGroup::new(&config, 0).unwrap());
//! let mut queue = FairQueue::new(Arc::clone(&group), FairQueueConfig::for_testing(), 0);
//!
//! let class = ClassId::new(0);
//! queue.register_priority_class(class, 100);
//!
//! let ticket = IoTicket::new(1, 4096);
//! queue.queue(class, ticket, "my request");
//!
//! queue.dispatch_requests(0, |_, payload| {
//!     // Submit the I/O; later report completion:
//!     let _ = payload;
//! });
//! queue.notify_request_finished(ticket);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fair_group;
pub mod fair_queue;

// Re-export main types for convenience.
pub use error::{SchedError, SchedResult};
pub use fair_group::{
    Capacity, FairGroup, FairGroupConfig, SignedCapacity, FIXED_POINT_FACTOR, MAX_REPLENISH_RATE,
};
pub use fair_queue::{
    ClassMetrics, EntryId, FairQueue, FairQueueConfig, FairQueueStats, DEFAULT_TAU_US,
};
