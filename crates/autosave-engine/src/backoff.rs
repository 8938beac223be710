use std::time::Duration;

use autosave_core::AutoSaveConfig;

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// Exponential: `retry_delay * 2^(attempt - 1)`, capped at `max_retry_delay`.
pub fn retry_delay(config: &AutoSaveConfig, attempt: u32) -> Duration {
    let base = u64::try_from(config.retry_delay.as_millis()).unwrap_or(u64::MAX);
    let cap = u64::try_from(config.max_retry_delay.as_millis()).unwrap_or(u64::MAX);
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(factor).min(cap.max(base)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, cap_ms: u64) -> AutoSaveConfig {
        AutoSaveConfig::default()
            .with_retry_delay(Duration::from_millis(base_ms), Duration::from_millis(cap_ms))
    }

    #[test]
    fn test_doubles_per_attempt() {
        let config = config(100, 10_000);
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_capped() {
        let config = config(1000, 3000);
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(3000));
        assert_eq!(retry_delay(&config, 64), Duration::from_millis(3000));
    }

    #[test]
    fn test_non_decreasing() {
        let config = config(250, 30_000);
        let delays: Vec<_> = (1..20).map(|n| retry_delay(&config, n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
