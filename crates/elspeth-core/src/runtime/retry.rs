// crates/elspeth-core/src/runtime/retry.rs
// ============================================================================
// Module: Retry Manager
// Description: Exponential backoff with jitter, clamped to configured
//              bounds; total coercion of externally supplied policy input.
// Purpose: Transform retries must never hang a run on a misconfigured
//          policy (negative/zero/absurd values), so the boundary between
//          "what the user configured" and "what the engine executes" is a
//          total function, not a fallible parse.
// Dependencies: rand, crate::core
// ============================================================================

use std::time::Duration;

use rand::Rng;

use crate::core::MaxRetriesExceeded;
use crate::core::TokenId;

/// Raw, externally supplied retry policy. Every field is user input and
/// may be absent, negative, zero, or nonsensical; [`RuntimeRetryConfig::from_policy`]
/// is the single trust boundary that turns this into an engine-safe config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicyInput {
    /// Requested maximum retry attempts.
    pub max_retries: Option<i64>,
    /// Requested base delay in milliseconds.
    pub base_delay_ms: Option<i64>,
    /// Requested maximum delay in milliseconds.
    pub max_delay_ms: Option<i64>,
    /// Whether jitter should be applied.
    pub jitter: Option<bool>,
}

/// Engine-safe retry configuration. Always constructible, never fails:
/// every pathological input from [`RetryPolicyInput`] is coerced to a safe
/// default rather than rejected, since a malformed retry policy on a
/// running pipeline should degrade, not abort, the pre-flight checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeRetryConfig {
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: bool,
}

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const HARD_MAX_RETRIES: u32 = 100;
const HARD_MAX_DELAY_MS: u64 = 300_000;

impl Default for RuntimeRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RuntimeRetryConfig {
    /// Coerces externally supplied policy input into a safe configuration.
    /// Negative or absent values fall back to the engine default; values
    /// above a hard ceiling are clamped rather than honored, so a typo'd
    /// config cannot turn into a day-long retry loop.
    #[must_use]
    pub fn from_policy(input: RetryPolicyInput) -> Self {
        let default = Self::default();
        let max_retries = input
            .max_retries
            .and_then(|v| u32::try_from(v).ok())
            .map_or(default.max_retries, |v| v.min(HARD_MAX_RETRIES));
        let base_delay_ms = input
            .base_delay_ms
            .and_then(|v| u64::try_from(v).ok())
            .filter(|&v| v > 0)
            .map_or(default.base_delay_ms, |v| v.min(HARD_MAX_DELAY_MS));
        let max_delay_ms = input
            .max_delay_ms
            .and_then(|v| u64::try_from(v).ok())
            .filter(|&v| v > 0)
            .map_or(default.max_delay_ms, |v| v.min(HARD_MAX_DELAY_MS));
        let max_delay_ms = max_delay_ms.max(base_delay_ms);
        let jitter = input.jitter.unwrap_or(default.jitter);
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            jitter,
        }
    }

    /// Maximum retry attempts after the initial attempt.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Computes the backoff delay before attempt `attempt` (1-based: the
    /// delay before the first retry is `delay_for(1)`). Exponential growth
    /// clamped to `max_delay_ms`, with optional full jitter per
    /// attempt so concurrent retries do not synchronize.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.base_delay_ms.saturating_mul(1u64 << exponent.min(20));
        let capped = scaled.min(self.max_delay_ms);
        let delay_ms = if self.jitter && capped > 0 {
            rng.gen_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(delay_ms)
    }

    /// Returns [`MaxRetriesExceeded`] if `attempt` has exhausted the
    /// configured retry budget, otherwise `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`MaxRetriesExceeded`] once `attempt` exceeds `max_retries`.
    pub fn check_exhausted(&self, token: TokenId, attempt: u32) -> Result<(), MaxRetriesExceeded> {
        if attempt > self.max_retries {
            return Err(MaxRetriesExceeded {
                token,
                attempts: attempt,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn negative_and_absent_inputs_fall_back_to_defaults() {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries: Some(-5),
            base_delay_ms: Some(-1),
            max_delay_ms: None,
            jitter: None,
        });
        assert_eq!(config, RuntimeRetryConfig::default());
    }

    #[test]
    fn absurd_values_are_clamped_not_rejected() {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries: Some(1_000_000),
            base_delay_ms: Some(1),
            max_delay_ms: Some(999_999_999),
            jitter: Some(false),
        });
        assert_eq!(config.max_retries(), HARD_MAX_RETRIES);
        assert!(config.delay_for(40, &mut StdRng::seed_from_u64(1)).as_millis() <= u128::from(HARD_MAX_DELAY_MS));
    }

    #[test]
    fn max_delay_is_never_below_base_delay() {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries: None,
            base_delay_ms: Some(5_000),
            max_delay_ms: Some(100),
            jitter: Some(false),
        });
        assert_eq!(config.delay_for(1, &mut StdRng::seed_from_u64(1)).as_millis(), 5_000);
    }

    #[test]
    fn delay_grows_exponentially_and_clamps() {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries: Some(10),
            base_delay_ms: Some(100),
            max_delay_ms: Some(1_000),
            jitter: Some(false),
        });
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(config.delay_for(1, &mut rng).as_millis(), 100);
        assert_eq!(config.delay_for(2, &mut rng).as_millis(), 200);
        assert_eq!(config.delay_for(3, &mut rng).as_millis(), 400);
        assert_eq!(config.delay_for(5, &mut rng).as_millis(), 1_000);
    }

    #[test]
    fn exhaustion_is_detected_past_max_retries() {
        let config = RuntimeRetryConfig::from_policy(RetryPolicyInput {
            max_retries: Some(2),
            ..Default::default()
        });
        let token = TokenId::from_raw(1).expect("non-zero");
        assert!(config.check_exhausted(token, 2).is_ok());
        assert!(config.check_exhausted(token, 3).is_err());
    }
}
