use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay, as a fraction of the current base delay.
pub const RANDOM_FACTOR: f64 = 0.5;

/// Retry policy shared by the persistent streams.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    /// Zero means retry forever.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetrySettings {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// Exponential backoff with jitter.
///
/// The first delay after construction or [`reset`](Self::reset) is zero so a
/// dropped connection is retried immediately; every following delay grows by
/// `multiplier` up to `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: RetrySettings,
    current_base: Duration,
    attempts: usize,
}

impl ExponentialBackoff {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
        self.attempts = 0;
    }

    /// Makes the next delay the maximum, used when the backend reports
    /// resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Returns `None` once `max_attempts` delays have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.settings.max_attempts > 0 && self.attempts >= self.settings.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base_millis = self.current_base.as_millis() as f64;
        let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
        let max_millis = self.settings.max_delay.as_millis() as f64;
        let delay_millis = (base_millis + jitter).round().clamp(0.0, max_millis);

        self.current_base = if self.current_base.is_zero() {
            self.settings.initial_delay
        } else {
            self.current_base
                .mul_f64(self.settings.multiplier)
                .min(self.settings.max_delay)
        };

        Some(Duration::from_millis(delay_millis as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings() -> RetrySettings {
        RetrySettings::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1_000))
            .with_multiplier(2.0)
    }

    #[test]
    fn first_delay_is_immediate() {
        let mut backoff = ExponentialBackoff::new(settings());
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Some(Duration::ZERO));
    }

    #[test]
    fn delays_grow_within_jitter_bounds() {
        let mut backoff = ExponentialBackoff::new(settings());
        let mut rng = StdRng::seed_from_u64(42);
        backoff.next_delay_with_rng(&mut rng);
        let second = backoff.next_delay_with_rng(&mut rng).unwrap();
        assert!(second >= Duration::from_millis(50) && second <= Duration::from_millis(150));
        let third = backoff.next_delay_with_rng(&mut rng).unwrap();
        assert!(third >= Duration::from_millis(100) && third <= Duration::from_millis(300));
    }

    #[test]
    fn reset_to_max_caps_next_delay() {
        let mut backoff = ExponentialBackoff::new(settings());
        let mut rng = StdRng::seed_from_u64(3);
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng).unwrap();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1_000));
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut backoff = ExponentialBackoff::new(settings().with_max_attempts(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }
}
