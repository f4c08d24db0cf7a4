use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::time::Duration;

/// Configuration of the exponential [`Backoff`].
///
/// The defaults are tuned for broker reconnect loops: start at 500 ms, grow
/// to a ceiling of 30 s, never give up on elapsed time alone (the retry
/// budget is enforced by the caller, in attempts, not in wall-clock time).
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// The first interval to wait.
    pub initial_interval: Duration,
    /// The ceiling for the growing intervals.
    pub max_interval: Duration,
    /// The factor by which each subsequent interval grows.
    pub multiplier: f64,
    /// The degree of jitter applied to every interval.
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.3,
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

/// Thin wrapper around [`ExponentialBackoff`] with interior mutability, so a
/// worker can keep it in a shared `self` without threading `&mut` through its
/// serve loop.
pub struct Backoff {
    inner: Mutex<ExponentialBackoff>,
}

impl Backoff {
    /// Builds a new [`Backoff`] from the given config.
    pub fn new(config: impl AsRef<BackoffConfig>) -> Self {
        let config = config.as_ref();
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval)
            .with_max_interval(config.max_interval)
            .with_multiplier(config.multiplier)
            .with_randomization_factor(config.randomization_factor)
            .with_max_elapsed_time(None)
            .build();

        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Returns the next interval to wait.
    pub fn next(&self) -> Option<Duration> {
        self.inner.lock().next_backoff()
    }

    /// Sleeps for the next interval.
    pub async fn sleep_next(&self) {
        match self.next() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => tokio::task::yield_now().await,
        }
    }

    /// Resets this backoff to its initial interval.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_grow_until_ceiling() {
        // Given
        let config = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
            randomization_factor: 0.0,
        };
        let backoff = Backoff::new(&config);

        // When
        let first = backoff.next().unwrap();
        let second = backoff.next().unwrap();
        let third = backoff.next().unwrap();
        let fourth = backoff.next().unwrap();

        // Then
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(400));
        assert_eq!(fourth, Duration::from_millis(400));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        // Given
        let config = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.0,
        };
        let backoff = Backoff::new(&config);

        // When
        let _ = backoff.next();
        let _ = backoff.next();
        backoff.reset();

        // Then
        assert_eq!(backoff.next().unwrap(), Duration::from_millis(100));
    }
}
