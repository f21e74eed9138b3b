// =============================================================================
// Unified backoff policy
// =============================================================================
//
// One policy for WS reconnects, tick-store batch-write retries, and engine
// restarts: initial=1s, factor=1.8, max=30s, jitter=+-20%.
// =============================================================================

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 1.8,
            max_retries: None,
            jitter_factor: 0.20,
        }
    }
}

impl BackoffConfig {
    /// Engine restarts: capped at 5 attempts before `permanently_failed` (§4.7).
    pub fn engine_restart() -> Self {
        Self {
            max_retries: Some(5),
            ..Default::default()
        }
    }
}

/// Stateful exponential backoff with jitter.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: usize,
    current_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Return the next delay and advance state, or `None` if retries are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.jittered(self.current_delay);
        self.attempt += 1;
        self.current_delay = Duration::from_secs_f64(
            (self.current_delay.as_secs_f64() * self.config.factor)
                .min(self.config.max_delay.as_secs_f64()),
        );
        Some(delay)
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return base;
        }
        let mut rng = rand::thread_rng();
        // +-jitter_factor around 1.0
        let span = self.config.jitter_factor;
        let mult = 1.0 + rng.gen_range(-span..=span);
        Duration::from_secs_f64((base.as_secs_f64() * mult).max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempt_number(&self) -> usize {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        match self.config.max_retries {
            Some(max) => self.attempt < max,
            None => true,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor() {
        let config = BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let mut b = ExponentialBackoff::with_config(config);
        let d1 = b.next_delay().unwrap();
        let d2 = b.next_delay().unwrap();
        assert!((d1.as_secs_f64() - 1.0).abs() < 1e-9);
        assert!((d2.as_secs_f64() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn caps_at_max_delay() {
        let config = BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let mut b = ExponentialBackoff::with_config(config);
        for _ in 0..20 {
            b.next_delay();
        }
        let d = b.next_delay().unwrap();
        assert!(d.as_secs_f64() <= 30.0 + 1e-9);
    }

    #[test]
    fn engine_restart_caps_at_five_attempts() {
        let mut b = ExponentialBackoff::with_config(BackoffConfig::engine_restart());
        for _ in 0..5 {
            assert!(b.next_delay().is_some());
        }
        assert!(b.next_delay().is_none());
        assert!(!b.can_retry());
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut b = ExponentialBackoff::new();
        let d = b.next_delay().unwrap();
        assert!(d.as_secs_f64() >= 0.8 && d.as_secs_f64() <= 1.2);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = ExponentialBackoff::new();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempt_number(), 0);
    }
}
