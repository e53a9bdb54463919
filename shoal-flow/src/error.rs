//! Scheduler error types.

/// Scheduler error type.
///
/// All variants are construction-time configuration failures; they are not
/// retriable. Backpressure during operation is not an error and is signalled
/// through the dispatch path instead.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The configured rates normalise to a zero cost-capacity axis.
    #[error("cost capacity must be non-zero on both axes, got {weight}:{size}")]
    ZeroCostCapacity {
        /// Per-tick weight capacity derived from the weight rate.
        weight: u32,
        /// Per-tick size capacity derived from the size rate.
        size: u32,
    },

    /// The rate factor is outside the accepted `(0, 1]` range.
    #[error("rate factor {rate_factor} is outside (0, 1]")]
    RateFactorOutOfRange {
        /// The configured rate factor.
        rate_factor: f64,
    },

    /// The replenish rate exceeds the bucket's arithmetic limit.
    #[error("replenish rate {rate} exceeds the maximum {max_rate}")]
    RateTooLarge {
        /// The derived replenish rate in capacity units per tick.
        rate: u64,
        /// The largest rate the bucket arithmetic supports.
        max_rate: u64,
    },

    /// The latency goal is too short to hold even one capacity unit.
    #[error("rate limit duration of {rate_limit_duration_us}us yields an empty bucket")]
    ZeroReplenishLimit {
        /// The configured latency goal in microseconds.
        rate_limit_duration_us: u64,
    },

    /// The smallest possible request could never pass the replenish batching
    /// threshold.
    #[error("minimal request capacity {capacity} exceeds the replenish threshold {threshold}")]
    MinimalRequestTooLarge {
        /// Capacity of the configured minimal request.
        capacity: u64,
        /// The replenish threshold the bucket settled on.
        threshold: u64,
    },
}

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;
