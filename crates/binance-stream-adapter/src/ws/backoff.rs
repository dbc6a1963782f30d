/*
[INPUT]:  Backoff configuration (initial, cap, multiplier, jitter)
[OUTPUT]: Reconnect delay sequence
[POS]:    WebSocket layer - reconnect pacing
[UPDATE]: When changing reconnect pacing
*/

use rand::Rng;
use std::time::Duration;

/// Largest accepted proportional jitter ratio
pub const MAX_JITTER_RATIO: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitterPolicy {
    None,
    /// Add up to `ratio * delay` of random extra wait
    Proportional(f64),
}

impl JitterPolicy {
    /// Ratio must be finite and within `0.0..=MAX_JITTER_RATIO`
    pub fn is_valid(&self) -> bool {
        match *self {
            JitterPolicy::None => true,
            JitterPolicy::Proportional(ratio) => (0.0..=MAX_JITTER_RATIO).contains(&ratio),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub jitter: JitterPolicy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
            jitter: JitterPolicy::None,
        }
    }
}

/// Reconnect delay tracker
///
/// `next_delay` hands out the current delay and then advances it, capped at
/// `max`. `reset` goes back to `initial` after a successful connect.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempt: u32,
    current: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial.min(config.max);
        Self {
            config,
            attempt: 0,
            current,
        }
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempt = self.attempt.saturating_add(1);
        self.current = base
            .saturating_mul(self.config.multiplier.max(1))
            .min(self.config.max);
        match self.config.jitter {
            JitterPolicy::None => base,
            JitterPolicy::Proportional(ratio) if ratio > 0.0 => {
                let ratio = ratio.min(MAX_JITTER_RATIO);
                let scale = rand::thread_rng().gen_range(0.0..=ratio);
                let extra = Duration::try_from_secs_f64(base.as_secs_f64() * scale)
                    .unwrap_or(Duration::ZERO);
                base.saturating_add(extra).min(self.config.max)
            }
            JitterPolicy::Proportional(_) => base,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.config.initial.min(self.config.max);
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps_at_30s() {
        let mut backoff = BackoffState::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn backoff_is_monotonic_and_resets() {
        let mut backoff = BackoffState::new(BackoffConfig {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
            multiplier: 3,
            jitter: JitterPolicy::None,
        });
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let mut backoff = BackoffState::new(BackoffConfig {
            jitter: JitterPolicy::Proportional(0.5),
            ..BackoffConfig::default()
        });
        for expected_base in [1u64, 2, 4] {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(expected_base));
            assert!(delay <= Duration::from_millis(expected_base * 1500));
        }
    }

    #[test]
    fn backoff_clamps_oversized_jitter() {
        let mut backoff = BackoffState::new(BackoffConfig {
            jitter: JitterPolicy::Proportional(1e300),
            ..BackoffConfig::default()
        });
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_secs(2));

        let mut infinite = BackoffState::new(BackoffConfig {
            jitter: JitterPolicy::Proportional(f64::INFINITY),
            ..BackoffConfig::default()
        });
        assert!(infinite.next_delay() <= Duration::from_secs(2));
    }

    #[test]
    fn jitter_policy_validity() {
        assert!(JitterPolicy::None.is_valid());
        assert!(JitterPolicy::Proportional(0.0).is_valid());
        assert!(JitterPolicy::Proportional(1.0).is_valid());
        assert!(!JitterPolicy::Proportional(1.5).is_valid());
        assert!(!JitterPolicy::Proportional(-0.1).is_valid());
        assert!(!JitterPolicy::Proportional(f64::NAN).is_valid());
        assert!(!JitterPolicy::Proportional(f64::INFINITY).is_valid());
    }
}
