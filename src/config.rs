//! Adaptation tuning for [`CaTree`](crate::CaTree).
//!
//! Every partition carries a signed contention score. Contended lock
//! acquisitions push it up, uncontended acquisitions and multi-partition
//! reads pull it down. Crossing [`AdaptationConfig::high_contention_limit`]
//! splits the partition, crossing [`AdaptationConfig::low_contention_limit`]
//! joins it with its neighbour.
//!
//! ```rust
//! use catree::AdaptationConfig;
//!
//! let config = AdaptationConfig::new()
//!     .with_high_contention_limit(500)
//!     .with_retry_limit(Some(1_000_000));
//!
//! assert_eq!(config.high_contention_limit, 500);
//! assert_eq!(config.low_contention_limit, -1000);
//! ```

/// Default score above which a partition splits.
pub const HIGH_CONTENTION_LIMIT: i32 = 1000;

/// Default score below which a partition joins its neighbour.
pub const LOW_CONTENTION_LIMIT: i32 = -1000;

/// Default penalty for a contended lock acquisition.
pub const FAILURE_CONTRIBUTION: i32 = 250;

/// Default credit for an uncontended lock acquisition.
pub const SUCCESS_CONTRIBUTION: i32 = 1;

/// Default credit for taking part in a multi-partition read.
pub const RANGE_CONTRIBUTION: i32 = 100;

/// Contention thresholds, score contributions, and the retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationConfig {
    /// Score above which a partition is split after a write.
    pub high_contention_limit: i32,

    /// Score below which a partition is joined with its neighbour.
    pub low_contention_limit: i32,

    /// Added when a lock could not be taken without waiting.
    pub failure_contribution: i32,

    /// Subtracted when a write lock was taken without waiting.
    pub success_contribution: i32,

    /// Subtracted from every partition read by a multi-partition range query.
    pub range_contribution: i32,

    /// Maximum number of structural retries a single operation may perform.
    ///
    /// `None` retries forever. With `Some(n)`, the operation panics on
    /// retry `n + 1`; tests use this to turn a livelock into a failure.
    pub retry_limit: Option<usize>,
}

impl AdaptationConfig {
    /// Configuration with the default thresholds and unbounded retries.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            high_contention_limit: HIGH_CONTENTION_LIMIT,
            low_contention_limit: LOW_CONTENTION_LIMIT,
            failure_contribution: FAILURE_CONTRIBUTION,
            success_contribution: SUCCESS_CONTRIBUTION,
            range_contribution: RANGE_CONTRIBUTION,
            retry_limit: None,
        }
    }

    /// Set the split threshold.
    #[must_use]
    pub const fn with_high_contention_limit(mut self, limit: i32) -> Self {
        self.high_contention_limit = limit;
        self
    }

    /// Set the join threshold.
    #[must_use]
    pub const fn with_low_contention_limit(mut self, limit: i32) -> Self {
        self.low_contention_limit = limit;
        self
    }

    /// Set the penalty for a contended lock acquisition.
    #[must_use]
    pub const fn with_failure_contribution(mut self, contribution: i32) -> Self {
        self.failure_contribution = contribution;
        self
    }

    /// Set the credit for an uncontended lock acquisition.
    #[must_use]
    pub const fn with_success_contribution(mut self, contribution: i32) -> Self {
        self.success_contribution = contribution;
        self
    }

    /// Set the credit for a multi-partition read.
    #[must_use]
    pub const fn with_range_contribution(mut self, contribution: i32) -> Self {
        self.range_contribution = contribution;
        self
    }

    /// Bound the number of structural retries per operation.
    #[must_use]
    pub const fn with_retry_limit(mut self, limit: Option<usize>) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Never split or join on statistics alone.
    ///
    /// Forced adaptation through the diagnostics API still works.
    #[must_use]
    pub const fn frozen() -> Self {
        Self::new()
            .with_high_contention_limit(i32::MAX)
            .with_low_contention_limit(i32::MIN)
    }

    /// Check whether a score calls for a split.
    #[inline]
    #[must_use]
    pub const fn wants_split(&self, score: i32) -> bool {
        score > self.high_contention_limit
    }

    /// Check whether a score calls for a join.
    #[inline]
    #[must_use]
    pub const fn wants_join(&self, score: i32) -> bool {
        score < self.low_contention_limit
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self::new()
    }
}
