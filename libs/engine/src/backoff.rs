use std::time::Duration;

use rand::Rng;

/// Reconnect backoff with inspectable state.
///
/// The delay doubles on every failed attempt up to `max`, with a random
/// jitter fraction added on top so a fleet of clients does not reconnect in
/// lockstep. `reset` is called after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 0.2)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay to sleep before the next attempt, advancing the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts += 1;
        self.current = (self.current * 2).min(self.max);

        if self.jitter == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..spread.max(f64::EPSILON));
        base + Duration::from_secs_f64(extra)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next call to `next_delay` will start from, without jitter.
    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(8), 0.5);
        for _ in 0..32 {
            let base = backoff.current_delay();
            let delay = backoff.next_delay();
            assert!(delay >= base);
            assert!(delay <= base + base.mul_f64(0.5) + Duration::from_millis(1));
            backoff.reset();
        }
    }
}
