//! Health score tracking
//!
//! A per-account reputation signal in `[0, max_score]` that degrades on
//! failure and passively recovers with time, independent of whether the
//! account is ever selected again. Pure compute-from-state-and-now, no
//! hidden I/O — the same shape as `quota.rs`'s classification helpers in the
//! teacher, generalized from a one-shot classification into a persistent,
//! decaying score driven by [`HealthScoreConfig`].

use serde::{Deserialize, Serialize};

const MS_PER_HOUR: u64 = 3_600_000;

/// Tunables for health score accrual and decay, loaded from the `health_score`
/// section of the pool config. Defaults match the documented fallback:
/// `{70, +1, -10, -20, 50, 100}` for
/// `{initial, success_reward, rate_limit_penalty, failure_penalty, min_usable, max_score}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScoreConfig {
    pub initial: f64,
    pub success_reward: f64,
    pub rate_limit_penalty: f64,
    pub failure_penalty: f64,
    pub min_usable: f64,
    pub max_score: f64,
    pub recovery_rate_per_hour: f64,
}

impl Default for HealthScoreConfig {
    fn default() -> Self {
        Self {
            initial: 70.0,
            success_reward: 1.0,
            rate_limit_penalty: -10.0,
            failure_penalty: -20.0,
            min_usable: 50.0,
            max_score: 100.0,
            recovery_rate_per_hour: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: f64,
    pub last_updated: u64,
    pub consecutive_failures: u32,
}

impl HealthScore {
    pub fn new(config: &HealthScoreConfig) -> Self {
        Self {
            score: config.initial,
            last_updated: 0,
            consecutive_failures: 0,
        }
    }

    /// Apply passive recovery up to `now_ms`. Only whole elapsed hours are
    /// consumed, leaving the remainder for the next accrual — matches the
    /// `floor((now - lastUpdated) / 1h)` read-time formula without losing
    /// partial-hour progress between reads.
    pub fn recover(&mut self, now_ms: u64, config: &HealthScoreConfig) {
        if now_ms <= self.last_updated {
            return;
        }
        let elapsed_hours = (now_ms - self.last_updated) / MS_PER_HOUR;
        if elapsed_hours == 0 {
            return;
        }
        self.score = (self.score + elapsed_hours as f64 * config.recovery_rate_per_hour)
            .min(config.max_score);
        self.last_updated += elapsed_hours * MS_PER_HOUR;
        if self.score >= config.max_score {
            self.consecutive_failures = 0;
        }
    }

    pub fn record_success(&mut self, now_ms: u64, config: &HealthScoreConfig) {
        self.recover(now_ms, config);
        self.consecutive_failures = 0;
        self.score = (self.score + config.success_reward).clamp(0.0, config.max_score);
        self.last_updated = now_ms;
    }

    /// Record a rate-limit signal, distinct from a generic failure: penalized
    /// less harshly since it reflects upstream load, not account health.
    pub fn record_rate_limit(&mut self, now_ms: u64, config: &HealthScoreConfig) {
        self.recover(now_ms, config);
        self.consecutive_failures += 1;
        self.score = (self.score + config.rate_limit_penalty).clamp(0.0, config.max_score);
        self.last_updated = now_ms;
    }

    pub fn record_failure(&mut self, now_ms: u64, config: &HealthScoreConfig) {
        self.recover(now_ms, config);
        self.consecutive_failures += 1;
        self.score = (self.score + config.failure_penalty).clamp(0.0, config.max_score);
        self.last_updated = now_ms;
    }

    /// Score as of `now_ms`, with passive recovery applied but not stored.
    pub fn current_score(&self, now_ms: u64, config: &HealthScoreConfig) -> f64 {
        let mut snapshot = *self;
        snapshot.recover(now_ms, config);
        snapshot.score
    }

    pub fn is_usable(&self, now_ms: u64, config: &HealthScoreConfig) -> bool {
        self.current_score(now_ms, config) >= config.min_usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_configured_initial_score() {
        let config = HealthScoreConfig::default();
        let health = HealthScore::new(&config);
        assert_eq!(health.score, 70.0);
        assert!(health.is_usable(0, &config));
    }

    #[test]
    fn failure_applies_failure_penalty() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(0, &config);
        assert_eq!(health.score, 50.0);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[test]
    fn rate_limit_applies_lighter_penalty_than_failure() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_rate_limit(0, &config);
        assert_eq!(health.score, 60.0);
    }

    #[test]
    fn score_floors_at_zero() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        for i in 0..10 {
            health.record_failure(i, &config);
        }
        assert_eq!(health.score, 0.0);
    }

    #[test]
    fn recovers_after_a_full_hour() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(0, &config);
        assert_eq!(health.score, 50.0);
        health.recover(MS_PER_HOUR, &config);
        assert_eq!(health.score, 55.0);
    }

    #[test]
    fn partial_hour_does_not_yet_recover() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(0, &config);
        health.recover(MS_PER_HOUR - 1, &config);
        assert_eq!(health.score, 50.0);
    }

    #[test]
    fn recovery_caps_at_max_score_and_resets_streak() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(0, &config);
        health.recover(1_000 * MS_PER_HOUR, &config);
        assert_eq!(health.score, 100.0);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn below_min_usable_is_not_usable() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        for i in 0..2 {
            health.record_failure(i, &config);
        }
        assert!(health.score < config.min_usable);
        assert!(!health.is_usable(1, &config));
    }

    #[test]
    fn success_clears_failure_streak_and_applies_reward() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(0, &config);
        health.record_failure(1, &config);
        assert_eq!(health.consecutive_failures, 2);
        health.record_success(2, &config);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.score, 31.0);
    }

    #[test]
    fn recover_does_not_rewind_on_stale_timestamp() {
        let config = HealthScoreConfig::default();
        let mut health = HealthScore::new(&config);
        health.record_failure(1_000, &config);
        let before = health.score;
        health.recover(500, &config);
        assert_eq!(health.score, before);
    }
}
