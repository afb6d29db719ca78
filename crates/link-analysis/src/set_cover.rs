//! Greedy Set-Cover pool optimization (Chvátal 1979).
//!
//! Per constellation, pick the smallest candidate subset whose
//! per-timestamp visible count stays inside the target band for the
//! required fraction of the window, with no zero-coverage timestamps.
//! Each round selects the candidate with the highest contribution:
//! timestamps it would lift toward `target_min`, minus a penalty for
//! timestamps already at `target_max`. Ties break on lower penalty, then
//! lower satellite id, which makes the selection fully deterministic.

use tracing::{debug, info};

use crate::CandidateEntry;

#[derive(Debug, Clone, Copy)]
pub struct PoolTargets {
    pub target_min: usize,
    pub target_max: usize,
    /// Hard cap on the selected pool size.
    pub max_pool_size: usize,
    pub required_coverage_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SetCoverOutcome {
    /// Selected satellite ids, in selection order.
    pub selected: Vec<String>,
    /// Per-timestamp visible count of the selected pool.
    pub visible_counts: Vec<usize>,
    pub coverage_rate: f64,
}

/// Fraction of timestamps with a visible count inside the band.
pub fn coverage_rate(counts: &[usize], targets: &PoolTargets) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    let in_band = counts
        .iter()
        .filter(|&&v| v >= targets.target_min && v <= targets.target_max)
        .count();
    in_band as f64 / counts.len() as f64
}

fn has_zero_coverage(counts: &[usize]) -> bool {
    counts.iter().any(|&v| v == 0)
}

/// Numeric-first id ordering so "9" sorts before "10".
fn id_key(id: &str) -> (u64, &str) {
    (id.parse::<u64>().unwrap_or(u64::MAX), id)
}

struct Scored {
    index: usize,
    contribution: i64,
    penalty: i64,
}

pub fn optimize_pool(candidates: &[CandidateEntry], targets: &PoolTargets) -> SetCoverOutcome {
    let point_count = candidates
        .first()
        .map(|c| c.visibility.len())
        .unwrap_or(0);
    let masks: Vec<Vec<bool>> = candidates
        .iter()
        .map(|c| c.visibility.iter().map(|s| s.is_connectable).collect())
        .collect();

    let mut counts = vec![0usize; point_count];
    let mut selected_flags = vec![false; candidates.len()];
    let mut selected: Vec<String> = Vec::new();

    loop {
        let rate = coverage_rate(&counts, targets);
        if rate >= targets.required_coverage_rate && !has_zero_coverage(&counts) {
            debug!("coverage target reached at rate {rate:.3}");
            break;
        }
        if selected.len() >= targets.max_pool_size {
            debug!("pool hard cap {} reached", targets.max_pool_size);
            break;
        }

        let mut best: Option<Scored> = None;
        for (index, mask) in masks.iter().enumerate() {
            if selected_flags[index] {
                continue;
            }
            let mut gain = 0i64;
            let mut penalty = 0i64;
            for (t, &connectable) in mask.iter().enumerate() {
                if !connectable {
                    continue;
                }
                if counts[t] < targets.target_min {
                    gain += 1;
                }
                if counts[t] >= targets.target_max {
                    penalty += 1;
                }
            }
            let scored = Scored {
                index,
                contribution: gain - penalty,
                penalty,
            };
            best = Some(match best {
                None => scored,
                Some(current) => pick_better(current, scored, candidates),
            });
        }

        let Some(best) = best else {
            break; // no unselected candidates remain
        };
        if best.contribution <= 0 {
            debug!("no candidate with positive contribution left");
            break;
        }

        selected_flags[best.index] = true;
        selected.push(candidates[best.index].satellite_id.clone());
        for (t, &connectable) in masks[best.index].iter().enumerate() {
            if connectable {
                counts[t] += 1;
            }
        }
    }

    let rate = coverage_rate(&counts, targets);
    info!(
        "set-cover selected {} of {} candidates, coverage rate {rate:.3}",
        selected.len(),
        candidates.len()
    );

    SetCoverOutcome {
        selected,
        visible_counts: counts,
        coverage_rate: rate,
    }
}

fn pick_better(a: Scored, b: Scored, candidates: &[CandidateEntry]) -> Scored {
    if b.contribution != a.contribution {
        return if b.contribution > a.contribution { b } else { a };
    }
    if b.penalty != a.penalty {
        return if b.penalty < a.penalty { b } else { a };
    }
    let id_a = id_key(&candidates[a.index].satellite_id);
    let id_b = id_key(&candidates[b.index].satellite_id);
    if id_b < id_a {
        b
    } else {
        a
    }
}
