//! Load balancer: worker selection across strategies, diagnostic scoring,
//! adaptive weight learning and rebalancing recommendations.
//!
//! All operations are synchronous and non-suspending; the balancer works on
//! worker snapshots handed to it by the caller (typically freshly
//! discovered from the registry). Recommendations are advisory.

mod strategies;

pub use strategies::{Strategy, WorkerHistory};

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use sentinel_common::config::BalancerConfig;
use sentinel_common::ids::WorkerId;
use sentinel_common::types::{TaskRequirements, WorkerRecord, WorkerStatus};

use strategies::{
    capability_score, normalize, performance_score, reliability, strategy_scores, SUB_STRATEGIES,
};

/// Initial adaptive weights, in `SUB_STRATEGIES` order.
const INITIAL_WEIGHTS: [f64; 4] = [0.4, 0.3, 0.2, 0.1];
/// Bounds preventing weight collapse.
const WEIGHT_FLOOR: f64 = 0.05;
const WEIGHT_CEILING: f64 = 0.8;
/// Feedback calls between weight recomputations.
const RECOMPUTE_PERIOD: u64 = 10;

/// Diagnostic score breakdown for one worker.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerScore {
    pub worker_id: WorkerId,
    pub capacity: f64,
    pub performance: f64,
    pub affinity: f64,
    pub reliability: f64,
    pub total: f64,
}

/// A single move suggestion from an overloaded worker to an underutilized
/// one.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MigrationSuggestion {
    pub from: WorkerId,
    pub to: WorkerId,
    /// `10 × load` of the overloaded worker; higher moves first.
    pub priority: f64,
}

/// Pool-level rebalancing recommendation.
#[derive(Clone, Debug, Serialize)]
pub struct RebalanceRecommendation {
    pub from: WorkerId,
    pub to: WorkerId,
    pub load_variance: f64,
    pub load_spread: f64,
}

/// Counter snapshot, exposed through `get_metrics`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BalancerMetrics {
    pub selections: u64,
    pub no_match: u64,
    pub feedbacks: u64,
    pub weights: [f64; 4],
}

#[derive(Clone, Copy, Debug, Default)]
struct StrategyStats {
    successes: u64,
    failures: u64,
}

impl StrategyStats {
    /// Neutral prior until a strategy has real outcomes.
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }
}

struct BalancerInner {
    strategy: Strategy,
    rr_index: usize,
    weights: [f64; 4],
    stats: [StrategyStats; 4],
    history: HashMap<WorkerId, WorkerHistory>,
    /// Sub-strategy that decided the most recent assignment per worker,
    /// credited when the outcome arrives.
    decided_by: HashMap<WorkerId, usize>,
    selections: u64,
    no_match: u64,
    feedbacks: u64,
}

pub struct LoadBalancer {
    config: BalancerConfig,
    inner: Mutex<BalancerInner>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        let strategy = Strategy::parse(&config.strategy).unwrap_or(Strategy::Adaptive);
        Self {
            config,
            inner: Mutex::new(BalancerInner {
                strategy,
                rr_index: 0,
                weights: INITIAL_WEIGHTS,
                stats: [StrategyStats::default(); 4],
                history: HashMap::new(),
                decided_by: HashMap::new(),
                selections: 0,
                no_match: 0,
                feedbacks: 0,
            }),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.lock().unwrap().strategy
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.inner.lock().unwrap().strategy = strategy;
    }

    /// Pick a worker for the task, or None when nothing qualifies.
    ///
    /// Pipeline: capability subset filter, capacity/overload filter,
    /// anti-affinity removal, affinity stable-sort, then the active
    /// strategy. The returned worker always carries every required
    /// capability and is never offline.
    pub fn select_worker(
        &self,
        requirements: &TaskRequirements,
        workers: &[WorkerRecord],
    ) -> Option<WorkerRecord> {
        let candidates = self.filter_candidates(requirements, workers);

        let mut inner = self.inner.lock().unwrap();
        if candidates.is_empty() {
            inner.no_match += 1;
            metrics::counter!("balancer.no_match").increment(1);
            return None;
        }

        let strategy = inner.strategy;
        let chosen_index = match strategy {
            Strategy::RoundRobin => {
                let index = inner.rr_index % candidates.len();
                inner.rr_index = inner.rr_index.wrapping_add(1);
                index
            }
            Strategy::LeastLoaded => {
                argmax_with_id_tiebreak(&candidates, |w| w.available_capacity() as f64)
            }
            Strategy::CapabilityBased => {
                argmax_with_id_tiebreak(&candidates, |w| capability_score(requirements, w))
            }
            Strategy::PerformanceBased => {
                let now = Utc::now();
                argmax_with_id_tiebreak(&candidates, |w| {
                    performance_score(w, inner.history.get(&w.id), now)
                })
            }
            Strategy::Adaptive => self.select_adaptive(&mut inner, requirements, &candidates),
        };

        let chosen = candidates[chosen_index].clone();
        if strategy != Strategy::Adaptive {
            // Direct strategies credit themselves.
            if let Some(position) = SUB_STRATEGIES.iter().position(|s| *s == strategy) {
                inner.decided_by.insert(chosen.id, position);
            }
        }

        inner.selections += 1;
        metrics::counter!("balancer.selections", "strategy" => strategy.as_str()).increment(1);
        tracing::debug!(
            worker_id = %chosen.id,
            strategy = strategy.as_str(),
            task_type = %requirements.task_type,
            "Worker selected"
        );
        Some(chosen)
    }

    /// Weighted vote of the four sub-strategies; records which one decided.
    fn select_adaptive(
        &self,
        inner: &mut BalancerInner,
        requirements: &TaskRequirements,
        candidates: &[WorkerRecord],
    ) -> usize {
        let now = Utc::now();
        let history = inner.history.clone();
        let lookup = |w: &WorkerRecord| history.get(&w.id).cloned();

        let per_strategy: Vec<Vec<f64>> = SUB_STRATEGIES
            .iter()
            .map(|s| {
                normalize(&strategy_scores(
                    *s,
                    requirements,
                    candidates,
                    &lookup,
                    inner.rr_index,
                    now,
                ))
            })
            .collect();
        inner.rr_index = inner.rr_index.wrapping_add(1);

        let combined: Vec<f64> = (0..candidates.len())
            .map(|i| {
                per_strategy
                    .iter()
                    .zip(inner.weights.iter())
                    .map(|(scores, weight)| weight * scores[i])
                    .sum()
            })
            .collect();

        let chosen = argmax_with_id_tiebreak(candidates, |w| {
            let index = candidates.iter().position(|c| c.id == w.id).unwrap();
            combined[index]
        });

        // The deciding sub-strategy is the largest weighted contributor to
        // the winner's combined score.
        let decider = (0..SUB_STRATEGIES.len())
            .max_by(|a, b| {
                (inner.weights[*a] * per_strategy[*a][chosen])
                    .total_cmp(&(inner.weights[*b] * per_strategy[*b][chosen]))
            })
            .unwrap_or(0);
        inner.decided_by.insert(candidates[chosen].id, decider);

        chosen
    }

    /// Diagnostic breakdown for every worker, unfiltered. Workers missing a
    /// required capability score zero across the board.
    pub fn score_workers(
        &self,
        requirements: &TaskRequirements,
        workers: &[WorkerRecord],
    ) -> Vec<WorkerScore> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();

        workers
            .iter()
            .map(|worker| {
                if !worker.has_capabilities(&requirements.capabilities) {
                    return WorkerScore {
                        worker_id: worker.id,
                        capacity: 0.0,
                        performance: 0.0,
                        affinity: 0.0,
                        reliability: 0.0,
                        total: 0.0,
                    };
                }

                let capacity = if worker.max_concurrent_tasks == 0 {
                    0.0
                } else {
                    worker.available_capacity() as f64 / worker.max_concurrent_tasks as f64
                };
                let performance = performance_score(worker, inner.history.get(&worker.id), now);
                let affinity = if requirements.anti_affinity.contains(&worker.id) {
                    0.0
                } else if requirements.affinity.contains(&worker.id) {
                    1.0
                } else {
                    0.5
                };
                let reliability = reliability(inner.history.get(&worker.id), now);

                WorkerScore {
                    worker_id: worker.id,
                    capacity,
                    performance,
                    affinity,
                    reliability,
                    total: 0.3 * capacity
                        + 0.3 * performance
                        + 0.2 * affinity
                        + 0.2 * reliability,
                }
            })
            .collect()
    }

    /// Feed one task outcome back: updates the worker's history, credits
    /// the deciding sub-strategy, and periodically recomputes the adaptive
    /// weights.
    pub fn update_context(
        &self,
        worker_id: WorkerId,
        task_type: &str,
        success: bool,
        duration_ms: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();

        inner.history.entry(worker_id).or_default().record(success);

        if let Some(decider) = inner.decided_by.remove(&worker_id) {
            let stats = &mut inner.stats[decider];
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }

        inner.feedbacks += 1;
        metrics::counter!(
            "balancer.feedback",
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
        tracing::trace!(
            worker_id = %worker_id,
            task_type = task_type,
            success = success,
            duration_ms = duration_ms,
            "Task outcome recorded"
        );

        if inner.feedbacks % RECOMPUTE_PERIOD == 0 {
            recompute_weights(&mut inner);
        }
    }

    /// Migration suggestions from every overloaded worker to the least
    /// loaded underutilized one, ordered by descending priority.
    pub fn detect_overload(&self, workers: &[WorkerRecord]) -> Vec<MigrationSuggestion> {
        let mut overloaded: Vec<&WorkerRecord> = workers
            .iter()
            .filter(|w| w.load_fraction() >= self.config.load_threshold)
            .collect();
        overloaded.sort_by(|a, b| {
            b.load_fraction()
                .total_cmp(&a.load_fraction())
                .then_with(|| a.id.cmp(&b.id))
        });

        let target = workers
            .iter()
            .filter(|w| w.load_fraction() < self.config.underutilized_threshold)
            .min_by(|a, b| {
                a.load_fraction()
                    .total_cmp(&b.load_fraction())
                    .then_with(|| a.id.cmp(&b.id))
            });

        let Some(target) = target else {
            return Vec::new();
        };

        overloaded
            .into_iter()
            .filter(|w| w.id != target.id)
            .map(|w| MigrationSuggestion {
                from: w.id,
                to: target.id,
                priority: 10.0 * w.load_fraction(),
            })
            .collect()
    }

    /// Pool-level recommendation when load is badly skewed: variance above
    /// 0.1 and busiest-to-idlest spread above 0.2.
    pub fn suggest_migration(
        &self,
        workers: &[WorkerRecord],
        pending_queue: &[TaskRequirements],
    ) -> Option<RebalanceRecommendation> {
        if workers.len() < 2 {
            return None;
        }

        let loads: Vec<f64> = workers.iter().map(|w| w.load_fraction()).collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let variance =
            loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;

        let busiest = workers
            .iter()
            .max_by(|a, b| a.load_fraction().total_cmp(&b.load_fraction()))?;
        let idlest = workers
            .iter()
            .min_by(|a, b| a.load_fraction().total_cmp(&b.load_fraction()))?;
        let spread = busiest.load_fraction() - idlest.load_fraction();

        if variance <= 0.1 || spread <= 0.2 {
            return None;
        }

        tracing::info!(
            variance = variance,
            spread = spread,
            pending = pending_queue.len(),
            "Load imbalance detected"
        );

        Some(RebalanceRecommendation {
            from: busiest.id,
            to: idlest.id,
            load_variance: variance,
            load_spread: spread,
        })
    }

    /// Order the pending queue by descending task priority, breaking ties
    /// by the best achievable worker score. Stable.
    pub fn reorder_queue(
        &self,
        queue: &[TaskRequirements],
        workers: &[WorkerRecord],
    ) -> Vec<TaskRequirements> {
        let mut scored: Vec<(TaskRequirements, f64)> = queue
            .iter()
            .map(|task| {
                let best = self
                    .score_workers(task, workers)
                    .into_iter()
                    .map(|s| s.total)
                    .fold(0.0_f64, f64::max);
                (task.clone(), best)
            })
            .collect();

        scored.sort_by(|(a, a_best), (b, b_best)| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then_with(|| b_best.total_cmp(a_best))
        });

        scored.into_iter().map(|(task, _)| task).collect()
    }

    pub fn get_metrics(&self) -> BalancerMetrics {
        let inner = self.inner.lock().unwrap();
        BalancerMetrics {
            selections: inner.selections,
            no_match: inner.no_match,
            feedbacks: inner.feedbacks,
            weights: inner.weights,
        }
    }

    /// Current adaptive weights, in `SUB_STRATEGIES` order.
    pub fn weights(&self) -> [f64; 4] {
        self.inner.lock().unwrap().weights
    }

    fn filter_candidates(
        &self,
        requirements: &TaskRequirements,
        workers: &[WorkerRecord],
    ) -> Vec<WorkerRecord> {
        let mut candidates: Vec<WorkerRecord> = workers
            .iter()
            .filter(|w| w.has_capabilities(&requirements.capabilities))
            .filter(|w| {
                let status = w.status();
                status != WorkerStatus::Offline
                    && status != WorkerStatus::Overloaded
                    && w.available_capacity() >= requirements.complexity
            })
            .filter(|w| !requirements.anti_affinity.contains(&w.id))
            .cloned()
            .collect();

        // Affinity is a soft preference: stable-sort preferred workers to
        // the front without dropping anyone.
        candidates.sort_by_key(|w| !requirements.affinity.contains(&w.id));
        candidates
    }
}

/// Multiplicative-weights update: each sub-strategy's weight is scaled by
/// `0.5 + success_rate` (neutral at a 50% rate), normalized, then clamped
/// to `[WEIGHT_FLOOR, WEIGHT_CEILING]`.
fn recompute_weights(inner: &mut BalancerInner) {
    for (weight, stats) in inner.weights.iter_mut().zip(inner.stats.iter()) {
        *weight *= 0.5 + stats.success_rate();
    }

    let sum: f64 = inner.weights.iter().sum();
    if sum > 0.0 {
        for weight in inner.weights.iter_mut() {
            *weight = (*weight / sum).clamp(WEIGHT_FLOOR, WEIGHT_CEILING);
        }
    }

    tracing::debug!(weights = ?inner.weights, "Adaptive weights recomputed");
    for (strategy, weight) in SUB_STRATEGIES.iter().zip(inner.weights.iter()) {
        metrics::gauge!("balancer.weight", "strategy" => strategy.as_str()).set(*weight);
    }
}

/// Index of the highest-scoring worker; equal scores go to the
/// lexicographically smaller worker id, keeping selection stable.
fn argmax_with_id_tiebreak<F: Fn(&WorkerRecord) -> f64>(
    candidates: &[WorkerRecord],
    score: F,
) -> usize {
    let mut best = 0;
    let mut best_score = score(&candidates[0]);

    for (index, worker) in candidates.iter().enumerate().skip(1) {
        let s = score(worker);
        if s > best_score || (s == best_score && worker.id < candidates[best].id) {
            best = index;
            best_score = s;
        }
    }
    best
}
