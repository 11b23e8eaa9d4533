use std::time::Duration;

/// A fixed-interval strategy, mostly useful in tests where an exponential
/// curve only obscures timing assertions.
#[derive(Debug, Clone)]
pub struct Fixed {
    interval: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Fixed {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis), None)
    }
}

impl Iterator for Fixed {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempt >= max_attempts {
                return None;
            }
        }
        self.attempt += 1;
        Some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_constant_interval() {
        let mut interval = Fixed::from_millis(10);
        assert_eq!(interval.next(), Some(Duration::from_millis(10)));
        assert_eq!(interval.next(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn bounded_attempts() {
        let mut interval = Fixed::new(Duration::from_millis(1), Some(2));
        assert!(interval.next().is_some());
        assert!(interval.next().is_some());
        assert_eq!(interval.next(), None);
    }
}
