//! Retry backoff applied when a task is claimed.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Backoff function for the next processing time after a claim.
///
/// With `a` the attempt count before the claim and `r` the retry interval:
/// linear waits `r`, arithmetic waits `(1 + 2a) * r`, geometric waits `2^a * r`.
/// The database evaluates the formula inside the claim statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRetryType {
    LinearBackoff,
    ArithmeticBackoff,
    GeometricBackoff,
}

impl Default for TaskRetryType {
    fn default() -> Self {
        Self::GeometricBackoff
    }
}

impl TaskRetryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRetryType::LinearBackoff => "linear_backoff",
            TaskRetryType::ArithmeticBackoff => "arithmetic_backoff",
            TaskRetryType::GeometricBackoff => "geometric_backoff",
        }
    }

    /// Delay the claim statement adds to `now`, computed client side.
    ///
    /// Saturates instead of overflowing for very large attempt counts.
    pub fn backoff(&self, attempt: u64, retry_interval: Duration) -> Duration {
        let factor = match self {
            TaskRetryType::LinearBackoff => 1,
            TaskRetryType::ArithmeticBackoff => attempt.saturating_mul(2).saturating_add(1),
            TaskRetryType::GeometricBackoff => {
                if attempt >= u64::from(u64::BITS) {
                    u64::MAX
                } else {
                    1u64 << attempt
                }
            }
        };
        Duration::from_secs(retry_interval.as_secs().saturating_mul(factor))
    }
}

impl core::fmt::Display for TaskRetryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskRetryType {
    type Err = ConfigError;

    /// Accepts `linear`, `arithmetic`, `geometric`, with or without a
    /// `_backoff` suffix, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let kind = normalized.strip_suffix("_backoff").unwrap_or(&normalized);
        match kind {
            "linear" => Ok(Self::LinearBackoff),
            "arithmetic" => Ok(Self::ArithmeticBackoff),
            "geometric" => Ok(Self::GeometricBackoff),
            _ => Err(ConfigError::UnknownRetryType(s.to_string())),
        }
    }
}

/// Retry policy of one queue, passed to every claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PickTaskSettings {
    pub retry_type: TaskRetryType,
    /// Base retry interval. Sent to the database in whole seconds.
    #[serde(rename = "retry_interval_secs", with = "duration_secs")]
    pub retry_interval: Duration,
}

impl PickTaskSettings {
    pub fn new(retry_type: TaskRetryType, retry_interval: Duration) -> Self {
        Self {
            retry_type,
            retry_interval,
        }
    }

    /// Retry interval as a bindable whole-second count.
    pub fn retry_interval_secs(&self) -> i64 {
        i64::try_from(self.retry_interval.as_secs()).unwrap_or(i64::MAX)
    }
}

impl Default for PickTaskSettings {
    fn default() -> Self {
        Self::new(TaskRetryType::default(), Duration::from_secs(60))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TEN: Duration = Duration::from_secs(10);

    #[test]
    fn backoff_at_attempt_zero_is_one_interval() {
        for kind in [
            TaskRetryType::LinearBackoff,
            TaskRetryType::ArithmeticBackoff,
            TaskRetryType::GeometricBackoff,
        ] {
            assert_eq!(kind.backoff(0, TEN), TEN, "{kind}");
        }
    }

    #[test]
    fn backoff_at_attempt_two() {
        assert_eq!(TaskRetryType::LinearBackoff.backoff(2, TEN), Duration::from_secs(10));
        assert_eq!(TaskRetryType::ArithmeticBackoff.backoff(2, TEN), Duration::from_secs(50));
        assert_eq!(TaskRetryType::GeometricBackoff.backoff(2, TEN), Duration::from_secs(40));
    }

    #[test]
    fn geometric_backoff_saturates() {
        assert_eq!(
            TaskRetryType::GeometricBackoff.backoff(200, TEN),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn parses_short_and_long_names() {
        assert_eq!("linear".parse::<TaskRetryType>().unwrap(), TaskRetryType::LinearBackoff);
        assert_eq!(
            "ARITHMETIC_BACKOFF".parse::<TaskRetryType>().unwrap(),
            TaskRetryType::ArithmeticBackoff
        );
        assert_eq!(
            "geometric_backoff".parse::<TaskRetryType>().unwrap(),
            TaskRetryType::GeometricBackoff
        );
        assert_eq!(
            "fibonacci".parse::<TaskRetryType>().unwrap_err(),
            ConfigError::UnknownRetryType("fibonacci".into())
        );
    }

    #[test]
    fn settings_serialize_interval_in_seconds() {
        let settings = PickTaskSettings::new(TaskRetryType::LinearBackoff, Duration::from_millis(90_500));
        let json = serde_json::to_value(settings).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"retry_type": "linear_backoff", "retry_interval_secs": 90})
        );
        assert_eq!(settings.retry_interval_secs(), 90);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: linear backoff ignores the attempt count.
        #[test]
        fn linear_is_constant(a in 0u64..10_000, r in 0u64..100_000) {
            let r = Duration::from_secs(r);
            prop_assert_eq!(TaskRetryType::LinearBackoff.backoff(a, r), r);
        }

        /// Property: each extra attempt adds two intervals to arithmetic backoff.
        #[test]
        fn arithmetic_steps_by_two_intervals(a in 0u64..10_000, r in 0u64..100_000) {
            let r_d = Duration::from_secs(r);
            let next = TaskRetryType::ArithmeticBackoff.backoff(a + 1, r_d);
            let this = TaskRetryType::ArithmeticBackoff.backoff(a, r_d);
            prop_assert_eq!(next - this, Duration::from_secs(2 * r));
        }

        /// Property: geometric backoff doubles per attempt while it fits.
        #[test]
        fn geometric_doubles(a in 0u64..20, r in 0u64..100_000) {
            let r = Duration::from_secs(r);
            let next = TaskRetryType::GeometricBackoff.backoff(a + 1, r);
            let this = TaskRetryType::GeometricBackoff.backoff(a, r);
            prop_assert_eq!(next, this * 2);
        }
    }
}
