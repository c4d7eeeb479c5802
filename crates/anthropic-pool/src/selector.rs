//! Account selection strategies
//!
//! A pure function of the candidate list, the configured strategy, the
//! current index, the health/bucket trackers, and a round-robin cursor.
//! Returns the chosen candidate's position in `candidates` plus the cursor
//! value the caller should remember for next time. No I/O, no mutation of
//! caller state — the manager applies the result.

use serde::{Deserialize, Serialize};

use crate::bucket::{TokenBucket, TokenBucketConfig};
use crate::health::{HealthScore, HealthScoreConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Sticky
    }
}

/// A candidate under consideration, identified by its position in the
/// account pool (not the position in the candidate slice).
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub pool_index: usize,
    pub health: HealthScore,
    pub bucket: TokenBucket,
    pub last_used: u64,
}

pub struct Selection {
    /// Index into the `candidates` slice that was passed in.
    pub candidate_slot: usize,
    pub new_cursor: usize,
}

/// `min(now - lastUsed, 3600s)` bonus applied to hybrid scoring, per §4.3.
const HYBRID_STICKINESS_CAP_S: f64 = 3600.0;
const HYBRID_CURRENT_BONUS: f64 = 150.0;
const HYBRID_SWITCH_THRESHOLD: f64 = 100.0;

/// Select the next account, given the candidate list already filtered to
/// enabled/not-cooled-down/not-skipped entries.
pub fn select(
    candidates: &[Candidate],
    strategy: Strategy,
    current_pool_index: Option<usize>,
    cursor: usize,
    now_ms: u64,
    health_config: &HealthScoreConfig,
    bucket_config: &TokenBucketConfig,
) -> Option<Selection> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        Strategy::Sticky => select_sticky(candidates, current_pool_index, cursor),
        Strategy::RoundRobin => select_round_robin(candidates, cursor),
        Strategy::Hybrid => select_hybrid(
            candidates,
            current_pool_index,
            cursor,
            now_ms,
            health_config,
            bucket_config,
        ),
    }
}

fn select_sticky(
    candidates: &[Candidate],
    current_pool_index: Option<usize>,
    cursor: usize,
) -> Option<Selection> {
    if let Some(current) = current_pool_index
        && let Some(slot) = candidates.iter().position(|c| c.pool_index == current)
    {
        return Some(Selection {
            candidate_slot: slot,
            new_cursor: cursor,
        });
    }
    select_round_robin(candidates, cursor)
}

fn select_round_robin(candidates: &[Candidate], cursor: usize) -> Option<Selection> {
    let slot = cursor % candidates.len();
    Some(Selection {
        candidate_slot: slot,
        new_cursor: cursor + 1,
    })
}

fn select_hybrid(
    candidates: &[Candidate],
    current_pool_index: Option<usize>,
    cursor: usize,
    now_ms: u64,
    health_config: &HealthScoreConfig,
    bucket_config: &TokenBucketConfig,
) -> Option<Selection> {
    let usable: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            c.health.is_usable(now_ms, health_config) && c.bucket.has_tokens(now_ms, bucket_config)
        })
        .collect();

    let pool = if usable.is_empty() {
        candidates.iter().collect::<Vec<_>>()
    } else {
        usable
    };

    let score = |candidate: &Candidate| -> f64 {
        let health_score = candidate.health.current_score(now_ms, health_config);
        let tokens = candidate.bucket.current_tokens(now_ms, bucket_config);
        let idle_s = ((now_ms.saturating_sub(candidate.last_used)) as f64 / 1000.0)
            .min(HYBRID_STICKINESS_CAP_S);
        health_score * 2.0 + (tokens / bucket_config.max_tokens) * 500.0 + idle_s * 0.1
    };

    let best = pool
        .iter()
        .max_by(|a, b| {
            let score_a = score(a) + current_bonus(a, current_pool_index);
            let score_b = score(b) + current_bonus(b, current_pool_index);
            score_a.total_cmp(&score_b)
        })
        .copied()?;

    let chosen = match current_pool_index.and_then(|idx| pool.iter().find(|c| c.pool_index == idx)) {
        Some(current) if current.pool_index != best.pool_index => {
            let best_base = score(best);
            let current_base = score(current);
            if best_base - current_base >= HYBRID_SWITCH_THRESHOLD {
                best
            } else {
                current
            }
        }
        Some(current) => current,
        None => best,
    };

    let slot = candidates.iter().position(|c| c.pool_index == chosen.pool_index)?;
    Some(Selection {
        candidate_slot: slot,
        new_cursor: cursor,
    })
}

fn current_bonus(candidate: &Candidate, current_pool_index: Option<usize>) -> f64 {
    if current_pool_index == Some(candidate.pool_index) {
        HYBRID_CURRENT_BONUS
    } else {
        0.0
    }
}
