use std::time::Duration;

/// Retry policy of an [`Stm`](crate::Stm) engine.
///
/// Conflicting attempts are re-run immediately with a short
/// [`Backoff`](crossbeam_utils::Backoff) snooze for the first
/// `spin_attempts` retries, then with a random sleep of up to
/// `max_backoff`. By default there is no retry bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmConfig {
    /// Maximum number of retries before `dosync` returns
    /// [`StmError::Timeout`](crate::StmError::Timeout). `None` retries forever.
    pub max_retries: Option<u32>,
    /// Retries that only snooze before random sleeps kick in.
    pub spin_attempts: u32,
    /// Upper bound of the random sleep between later retries.
    pub max_backoff: Duration,
}

impl StmConfig {
    /// Unbounded retries, 16 snoozing retries, random sleeps up to 500µs.
    pub const fn new() -> Self {
        Self {
            max_retries: None,
            spin_attempts: 16,
            max_backoff: Duration::from_micros(500),
        }
    }

    /// Give up with `Timeout` after `max_retries` retries.
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Number of retries that snooze instead of sleeping.
    pub const fn with_spin_attempts(mut self, spin_attempts: u32) -> Self {
        self.spin_attempts = spin_attempts;
        self
    }

    /// Upper bound of the random sleep between retries.
    pub const fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
}

impl Default for StmConfig {
    fn default() -> Self {
        Self::new()
    }
}
