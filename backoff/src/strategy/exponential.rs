use std::time::Duration;

use rand::Rng;

/// An exponential backoff strategy that increases the cool-off with each
/// retry.
///
/// The delay for attempt `n` (1-based) is `base * factor^(n - 1)`, with
/// optional jitter applied, capped at `max`.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::new(
///     Duration::from_millis(500), // base interval
///     Duration::from_secs(1),     // cap
///     2.0,                        // factor
///     0.0,                        // jitter
///     None,                       // retry forever
/// );
///
/// assert_eq!(backoff.next(), Some(Duration::from_millis(500)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    /// The starting cool-off interval.
    base: Duration,
    /// The cap applied to every computed interval.
    max: Duration,
    /// Multiplier applied for each successive attempt.
    factor: f64,
    /// Randomization factor between 0.0 and 1.0.
    jitter: f64,
    /// Maximum number of attempts. `None` retries indefinitely.
    max_attempts: Option<u32>,
    /// Attempts handed out so far.
    attempt: u32,
}

impl Exponential {
    pub fn new(
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            base,
            max,
            factor,
            jitter,
            max_attempts,
            attempt: 0,
        }
    }

    /// Starts the strategy over, as after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of intervals handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        // attempt is always >= 1 when called from next(), guard anyway so
        // powi never sees -1.
        let exponent = attempt.max(1) - 1;
        let base_micros = (self.base.as_micros() as f64) * self.factor.powi(exponent as i32);

        if self.jitter == 0.0 {
            return Duration::from_micros(base_micros as u64).min(self.max);
        }

        // jitter of j scales the delay uniformly into [1-j, 1+j].
        let scale: f64 = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_micros((base_micros * scale) as u64).min(self.max)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempt >= max_attempts {
                return None;
            }
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}
