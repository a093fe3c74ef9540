//! Backoff policy for failed sync cycles.
//!
//! The dispatcher applies this between retryable failures (transport
//! faults, rate-limit rejections); a successful cycle resets the attempt
//! counter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier per attempt (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per attempt.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculates the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi((attempt.saturating_sub(1)) as i32);
                Duration::from_secs_f64(delay_secs).min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * attempt.saturating_sub(1);
                delay.min(*max_delay)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let config = BackoffConfig::Fixed {
            delay: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn linear_backoff_increments_and_caps() {
        let config = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(6));
    }

    #[test]
    fn config_parses_from_toml() {
        let parsed: BackoffConfig = toml::from_str(
            r#"
            type = "exponential"
            initial_delay = "1s"
            max_delay = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(parsed.delay_for_attempt(30), Duration::from_secs(120));
    }
}
