//! Cross-shard token bucket.
//!
//! A fair group rations one device's capacity budget to the fair queues of
//! many shards. The budget is expressed jointly in operations-per-second and
//! bytes-per-second; a request's two-axis ticket is normalised against the
//! group's cost capacity and converted to a scalar fixed-point "capacity
//! unit", the currency the bucket trades in.
//!
//! The bucket itself is a pair of wrapping monotonic counters (rovers), one
//! chasing the other. Getting tokens advances the tail, putting tokens back
//! advances the head. If an advanced tail overruns the head the bucket is
//! empty and the grabber has to wait; shards that grabbed earlier tail
//! positions wake up earlier, so they form a queue. There is no mutex
//! anywhere: both rovers are plain atomic fetch-adds and all comparisons are
//! wrapping-signed, so they are insensitive to interleaving.
//!
//! Tokens come back two ways: a completed request releases the capacity it
//! held, and elapsed wall-clock time is converted into fresh tokens by
//! `replenish_capacity`. Replenishment is batched behind a threshold so that
//! many shards polling the clock do not fight over the shared timestamp.

use std::sync::atomic::{AtomicU64, Ordering};

use shoal_core::IoTicket;
use tracing::info;

use crate::error::{SchedError, SchedResult};

/// Scalar capacity unit, the currency of the token bucket.
///
/// All internal arithmetic on capacities is integer and wraps modulo 2^64.
pub type Capacity = u64;

/// Signed view of a capacity, used for wrapping "ahead of" comparisons and
/// for the fair queue's accumulator arithmetic.
pub type SignedCapacity = i64;

/// Factor converting a normalised (fractional) cost into an integer capacity.
///
/// Normalisation results are on the order of 2^-30, so the factor must be
/// large enough to turn the smallest realistic request into a non-zero
/// integer.
pub const FIXED_POINT_FACTOR: f64 = (1_u64 << 24) as f64;

/// Largest replenish rate the bucket arithmetic supports: replenishing after
/// a day-long stall must still fit the counter.
pub const MAX_REPLENISH_RATE: Capacity = Capacity::MAX / (24 * 60 * 60 * 1000);

/// Milliseconds per rate tick; rates are configured per second and accounted
/// per tick.
const TICK_MS: f64 = 1.0;

/// Number of rate ticks in one second.
const TICKS_PER_SECOND: f64 = 1000.0;

/// Converts a microsecond interval into rate ticks.
fn ticks_in(delta_us: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)] // Intervals are far below 2^52 us.
    let delta = delta_us as f64;
    delta / 1000.0 / TICK_MS
}

/// Wrapping rover comparison: how far `a` is ahead of `b`, zero if behind.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // Signed reinterpretation is the point.
fn rover_lag(a: Capacity, b: Capacity) -> Capacity {
    let delta = a.wrapping_sub(b) as SignedCapacity;
    if delta > 0 {
        delta as Capacity
    } else {
        0
    }
}

/// Configuration for a fair group.
///
/// One group is created per device and shared by the fair queues of all
/// shards driving that device.
#[derive(Debug, Clone)]
pub struct FairGroupConfig {
    /// Human-readable label used in logs.
    pub label: String,

    /// Weight component of the smallest request the device will see.
    pub min_weight: u32,

    /// Size component of the smallest request the device will see.
    pub min_size: u32,

    /// Sustained device capacity on the IOPS-like axis, per second.
    pub weight_rate: u64,

    /// Sustained device capacity on the bandwidth-like axis, per second.
    pub size_rate: u64,

    /// Downscaling factor in `(0, 1]` preserving headroom below the
    /// configured rates.
    pub rate_factor: f64,

    /// Latency goal: how much time the bucket is allowed to accumulate, in
    /// microseconds. This is the bucket depth expressed as a duration.
    pub rate_limit_duration_us: u64,

    /// Number of shards sharing this group. Bounds how much one shard may
    /// dispatch in a single round.
    pub shards: u32,
}

impl FairGroupConfig {
    /// Creates a configuration for testing: 1000 ops/s, 1 MiB/s, no
    /// headroom, a 1 ms latency goal and a single shard.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            label: "test".to_string(),
            min_weight: 0,
            min_size: 0,
            weight_rate: 1000,
            size_rate: 1 << 20,
            rate_factor: 1.0,
            rate_limit_duration_us: 1000,
            shards: 1,
        }
    }
}

/// The shared token bucket rationing one device's capacity across shards.
///
/// The group is the only piece of cross-shard mutable state in the
/// scheduler. It is created once per device, shared by reference, and every
/// method takes `&self`: all mutation goes through atomic operations on the
/// rover fields.
#[derive(Debug)]
pub struct FairGroup {
    label: String,

    /// Base axis for ticket normalisation: one tick's worth of the device's
    /// configured rates.
    cost_capacity: IoTicket,

    /// Capacity units added per rate tick.
    replenish_rate: Capacity,

    /// Bucket depth: capacity accumulated over the latency goal.
    replenish_limit: Capacity,

    /// Minimal number of tokens worth putting back in one batch.
    replenish_threshold: Capacity,

    /// Number of shards sharing the group.
    shards: u32,

    /// When the bucket was last replenished, in microseconds.
    last_replenished_us: AtomicU64,

    /// Consumption front: advanced by grabbers.
    capacity_tail: AtomicU64,

    /// Replenishment front: advanced by `release_capacity` and the
    /// time-based replenisher.
    capacity_head: AtomicU64,
}

impl FairGroup {
    /// Creates a fair group from `config`, with the bucket initially full.
    ///
    /// # Arguments
    ///
    /// * `config` - The group configuration.
    /// * `now_us` - Current time in microseconds.
    ///
    /// # Errors
    ///
    /// Returns `SchedError` when the configured rates normalise to a zero
    /// cost-capacity axis, the rate factor is out of range, the derived
    /// replenish rate or limit is degenerate, or the minimal request could
    /// never pass the replenish threshold.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Rates are pre-checked against their bounds.
    pub fn new(config: &FairGroupConfig, now_us: u64) -> SchedResult<Self> {
        #[allow(clippy::cast_precision_loss)] // Device rates are far below 2^52.
        let cost_capacity = IoTicket::new(
            (config.weight_rate as f64 / TICKS_PER_SECOND) as u32,
            (config.size_rate as f64 / TICKS_PER_SECOND) as u32,
        );
        if !cost_capacity.is_non_zero() {
            return Err(SchedError::ZeroCostCapacity {
                weight: cost_capacity.weight(),
                size: cost_capacity.size(),
            });
        }

        if !(config.rate_factor > 0.0 && config.rate_factor <= 1.0) {
            return Err(SchedError::RateFactorOutOfRange {
                rate_factor: config.rate_factor,
            });
        }

        let replenish_rate = (config.rate_factor * FIXED_POINT_FACTOR).round() as Capacity;
        if replenish_rate == 0 || replenish_rate > MAX_REPLENISH_RATE {
            return Err(SchedError::RateTooLarge {
                rate: replenish_rate,
                max_rate: MAX_REPLENISH_RATE,
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let replenish_limit =
            (replenish_rate as f64 * ticks_in(config.rate_limit_duration_us)).round() as Capacity;
        if replenish_limit == 0 {
            return Err(SchedError::ZeroReplenishLimit {
                rate_limit_duration_us: config.rate_limit_duration_us,
            });
        }

        let min_capacity = Self::normalized_capacity(
            IoTicket::new(config.min_weight, config.min_size),
            cost_capacity,
        );
        let replenish_threshold = min_capacity.clamp(1, replenish_limit);
        if min_capacity > replenish_threshold {
            return Err(SchedError::MinimalRequestTooLarge {
                capacity: min_capacity,
                threshold: replenish_threshold,
            });
        }

        info!(
            label = %config.label,
            cost_capacity = %cost_capacity,
            rate = replenish_rate,
            limit = replenish_limit,
            threshold = replenish_threshold,
            rate_factor = config.rate_factor,
            "created fair group"
        );

        Ok(Self {
            label: config.label.clone(),
            cost_capacity,
            replenish_rate,
            replenish_limit,
            replenish_threshold,
            shards: config.shards.max(1),
            last_replenished_us: AtomicU64::new(now_us),
            capacity_tail: AtomicU64::new(0),
            // The bucket starts full.
            capacity_head: AtomicU64::new(replenish_limit),
        })
    }

    /// Returns the group label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the normalisation axis: one tick's worth of the device rates.
    #[must_use]
    pub const fn cost_capacity(&self) -> IoTicket {
        self.cost_capacity
    }

    /// Returns the bucket depth in capacity units.
    #[must_use]
    pub const fn maximum_capacity(&self) -> Capacity {
        self.replenish_limit
    }

    /// Returns how much capacity a single shard may commit in one dispatch
    /// round, at least one unit.
    #[must_use]
    pub const fn per_shard_budget(&self) -> Capacity {
        let budget = self.replenish_limit / self.shards as Capacity;
        if budget == 0 {
            1
        } else {
            budget
        }
    }

    /// Returns when the bucket was last replenished, in microseconds.
    #[must_use]
    pub fn replenished_ts(&self) -> u64 {
        self.last_replenished_us.load(Ordering::Relaxed)
    }

    /// Converts a ticket into integer capacity units.
    ///
    /// A non-zero ticket always costs at least one unit, keeping grab and
    /// release symmetric for the tiniest requests.
    #[must_use]
    pub fn ticket_capacity(&self, ticket: IoTicket) -> Capacity {
        Self::normalized_capacity(ticket, self.cost_capacity)
    }

    /// Estimated time, in rate ticks (milliseconds), to accumulate `cap`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn capacity_duration(&self, cap: Capacity) -> f64 {
        cap as f64 / self.replenish_rate as f64
    }

    /// Converts an internal capacity value back into seconds of device time.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn capacity_tokens(cap: Capacity) -> f64 {
        cap as f64 / FIXED_POINT_FACTOR / TICKS_PER_SECOND
    }

    /// Atomically takes `cap` units from the bucket and returns the
    /// pre-update tail position.
    ///
    /// Grabbing never blocks and always succeeds in moving the tail; the
    /// returned position may be past the head, in which case the caller must
    /// wait for replenishment (see `capacity_deficiency`).
    ///
    /// # Panics
    ///
    /// Panics if `cap` exceeds the bucket depth; such a request could never
    /// be admitted.
    pub fn grab_capacity(&self, cap: Capacity) -> Capacity {
        assert!(cap <= self.replenish_limit, "grab above the bucket depth");
        self.capacity_tail.fetch_add(cap, Ordering::Relaxed)
    }

    /// Puts `cap` units back into the bucket.
    pub fn release_capacity(&self, cap: Capacity) {
        self.capacity_head.fetch_add(cap, Ordering::Relaxed);
    }

    /// Converts the time elapsed since the last replenishment into fresh
    /// tokens.
    ///
    /// The advance is batched: nothing happens until at least the replenish
    /// threshold's worth of tokens has accrued. Racing callers are allowed;
    /// the timestamp swap ensures the elapsed interval is converted at most
    /// once, and the head advance is clamped so the bucket never holds more
    /// than its depth.
    pub fn replenish_capacity(&self, now_us: u64) {
        let last = self.last_replenished_us.load(Ordering::Relaxed);
        if now_us <= last {
            return;
        }

        let extra = self.accumulated_capacity(now_us - last);
        if extra < self.replenish_threshold {
            return;
        }

        if self
            .last_replenished_us
            .compare_exchange(last, now_us, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Someone else claimed the interval.
            return;
        }

        let tail = self.capacity_tail.load(Ordering::Relaxed);
        let head = self.capacity_head.load(Ordering::Relaxed);
        let room = rover_lag(tail.wrapping_add(self.replenish_limit), head);
        let add = extra.min(room);
        if add > 0 {
            self.capacity_head.fetch_add(add, Ordering::Relaxed);
        }
    }

    /// Replenishes if enough time has passed since `local_ts_us`, the
    /// caller's own record of the last replenishment it observed.
    ///
    /// Each fair queue keeps a private timestamp so that shards only touch
    /// the shared clock once a threshold's worth of tokens could have
    /// accrued.
    pub fn maybe_replenish_capacity(&self, local_ts_us: &mut u64, now_us: u64) {
        if now_us <= *local_ts_us {
            return;
        }
        let extra = self.accumulated_capacity(now_us - *local_ts_us);
        if extra >= self.replenish_threshold {
            *local_ts_us = now_us;
            self.replenish_capacity(now_us);
        }
    }

    /// How far `from` is past the replenishment head; zero when the
    /// capacity up to `from` is already available.
    #[must_use]
    pub fn capacity_deficiency(&self, from: Capacity) -> Capacity {
        rover_lag(from, self.capacity_head.load(Ordering::Relaxed))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Bounded by MAX_REPLENISH_RATE.
    fn accumulated_capacity(&self, delta_us: u64) -> Capacity {
        #[allow(clippy::cast_precision_loss)]
        let rate = self.replenish_rate as f64;
        (rate * ticks_in(delta_us)).round() as Capacity
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Ticket components bound the product.
    fn normalized_capacity(ticket: IoTicket, axis: IoTicket) -> Capacity {
        if ticket.is_zero() {
            return 0;
        }
        let cap = (ticket.normalize(axis) * FIXED_POINT_FACTOR).round() as Capacity;
        cap.max(1)
    }
}
