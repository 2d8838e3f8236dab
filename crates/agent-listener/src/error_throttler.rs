// Exponential backoff with jitter for retryable errors in the message pump.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimum backoff delay.
const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Multiplier for exponential growth.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Jitter applied to each wait, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.2;

/// Exponential backoff error throttler.
///
/// Each call to `increment_and_wait` doubles the delay (capped at 60s) and
/// sleeps the current period ±20% jitter. `reset` returns the delay to 1s.
pub struct ErrorThrottler {
    current_delay: Duration,
}

impl ErrorThrottler {
    pub fn new() -> Self {
        Self {
            current_delay: MIN_BACKOFF,
        }
    }

    /// Reset the backoff delay to the minimum.
    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
    }

    /// Returns the current delay without incrementing.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Sleep for the current period with jitter, then grow the delay.
    ///
    /// Returns `true` if the delay completed normally, `false` if cancelled.
    pub async fn increment_and_wait(&mut self, cancel: CancellationToken) -> bool {
        let base = self.current_delay.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let delay = Duration::from_secs_f64((base * (1.0 + jitter)).max(0.1));

        tracing::warn!(
            "Error throttling: waiting {:.1}s before retry",
            delay.as_secs_f64()
        );

        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        };

        let next_ms = (self.current_delay.as_millis() as f64 * BACKOFF_MULTIPLIER) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(MAX_BACKOFF);

        completed
    }
}

impl Default for ErrorThrottler {
    fn default() -> Self {
        Self::new()
    }
}
