use chrono::{DateTime, Utc};

use sentinel_common::types::{TaskRequirements, WorkerRecord};

/// The closed set of selection strategies. The adaptive meta-strategy
/// combines the first four with learned weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    CapabilityBased,
    PerformanceBased,
    Adaptive,
}

/// The four sub-strategies the adaptive strategy weighs, in weight-array
/// order.
pub const SUB_STRATEGIES: [Strategy; 4] = [
    Strategy::RoundRobin,
    Strategy::LeastLoaded,
    Strategy::CapabilityBased,
    Strategy::PerformanceBased,
];

impl Strategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round-robin" => Some(Self::RoundRobin),
            "least-loaded" => Some(Self::LeastLoaded),
            "capability-based" => Some(Self::CapabilityBased),
            "performance-based" => Some(Self::PerformanceBased),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastLoaded => "least-loaded",
            Self::CapabilityBased => "capability-based",
            Self::PerformanceBased => "performance-based",
            Self::Adaptive => "adaptive",
        }
    }
}

/// Age below which a worker's most recent failure suppresses its
/// reliability component.
const RECENT_FAILURE_WINDOW_SECS: i64 = 60;

/// Per-worker outcome history kept by the balancer context.
#[derive(Clone, Debug, Default)]
pub struct WorkerHistory {
    pub successes: u64,
    pub failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

impl WorkerHistory {
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
            self.last_failure = Some(Utc::now());
        }
    }
}

/// Reliability component: a worker that failed within the last minute is
/// distrusted outright.
pub fn reliability(history: Option<&WorkerHistory>, now: DateTime<Utc>) -> f64 {
    match history.and_then(|h| h.last_failure) {
        Some(at) if (now - at).num_seconds() < RECENT_FAILURE_WINDOW_SECS => 0.0,
        _ => 1.0,
    }
}

/// Specialization score: overlap with the requirement divided by the
/// worker's total capability count, discounted by current load. A worker
/// that does exactly what the task needs and nothing else scores highest.
pub fn capability_score(requirements: &TaskRequirements, worker: &WorkerRecord) -> f64 {
    if worker.capabilities.is_empty() {
        return 0.0;
    }
    let overlap = requirements
        .capabilities
        .intersection(&worker.capabilities)
        .count() as f64;
    (overlap / worker.capabilities.len() as f64) * (1.0 - worker.load_fraction())
}

/// Performance score: success history, speed, reliability and headroom.
pub fn performance_score(
    worker: &WorkerRecord,
    history: Option<&WorkerHistory>,
    now: DateTime<Utc>,
) -> f64 {
    let avg_secs = worker.metrics.avg_task_duration_ms / 1_000.0;
    0.35 * worker.metrics.success_rate()
        + 0.25 * (1.0 / (1.0 + avg_secs))
        + 0.25 * reliability(history, now)
        + 0.15 * (1.0 - worker.load_fraction())
}

/// Raw per-worker scores for one sub-strategy over an ordered candidate
/// list. `rr_index` is the round-robin strategy's sticky position.
pub fn strategy_scores(
    strategy: Strategy,
    requirements: &TaskRequirements,
    candidates: &[WorkerRecord],
    history: &dyn Fn(&WorkerRecord) -> Option<WorkerHistory>,
    rr_index: usize,
    now: DateTime<Utc>,
) -> Vec<f64> {
    let n = candidates.len();
    match strategy {
        Strategy::RoundRobin => (0..n)
            .map(|position| {
                // The worker at the sticky index scores 1, decaying with
                // rotational distance.
                let distance = (position + n - rr_index % n.max(1)) % n.max(1);
                (n - distance) as f64 / n as f64
            })
            .collect(),
        Strategy::LeastLoaded => candidates
            .iter()
            .map(|w| w.available_capacity() as f64)
            .collect(),
        Strategy::CapabilityBased => candidates
            .iter()
            .map(|w| capability_score(requirements, w))
            .collect(),
        Strategy::PerformanceBased => candidates
            .iter()
            .map(|w| performance_score(w, history(w).as_ref(), now))
            .collect(),
        Strategy::Adaptive => vec![0.0; n],
    }
}

/// Normalize raw scores to [0, 1] by the maximum, for cross-strategy
/// weighting.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| s / max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::ids::{NodeId, WorkerId};
    use sentinel_common::types::WorkerRegistration;

    fn worker(caps: &[&str], max: u32, current: u32) -> WorkerRecord {
        let mut record = WorkerRecord::new(
            WorkerId::new(),
            WorkerRegistration {
                node_id: NodeId::new("n"),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                max_concurrent_tasks: max,
            },
        );
        record.current_tasks = current;
        record
    }

    fn requirements(caps: &[&str]) -> TaskRequirements {
        TaskRequirements::new("build").with_capabilities(caps.iter().copied())
    }

    #[test]
    fn test_strategy_parse_round_trip() {
        for name in [
            "round-robin",
            "least-loaded",
            "capability-based",
            "performance-based",
            "adaptive",
        ] {
            assert_eq!(Strategy::parse(name).unwrap().as_str(), name);
        }
        assert!(Strategy::parse("force-acquire").is_none());
    }

    #[test]
    fn test_capability_score_rewards_specialists() {
        let req = requirements(&["rust"]);
        let specialist = worker(&["rust"], 10, 0);
        let generalist = worker(&["rust", "python", "go", "java"], 10, 0);

        assert!(capability_score(&req, &specialist) > capability_score(&req, &generalist));
    }

    #[test]
    fn test_capability_score_penalized_by_load() {
        let req = requirements(&["rust"]);
        let idle = worker(&["rust"], 10, 0);
        let loaded = worker(&["rust"], 10, 8);

        assert!(capability_score(&req, &idle) > capability_score(&req, &loaded));
    }

    #[test]
    fn test_reliability_discounts_recent_failure() {
        let now = Utc::now();
        let mut history = WorkerHistory::default();
        assert_eq!(reliability(Some(&history), now), 1.0);

        history.record(false);
        assert_eq!(reliability(Some(&history), now), 0.0);

        // An old failure no longer discounts.
        history.last_failure = Some(now - chrono::Duration::seconds(120));
        assert_eq!(reliability(Some(&history), now), 1.0);

        assert_eq!(reliability(None, now), 1.0);
    }

    #[test]
    fn test_round_robin_scores_rotate() {
        let req = requirements(&[]);
        let candidates = vec![worker(&[], 4, 0), worker(&[], 4, 0), worker(&[], 4, 0)];
        let none = |_: &WorkerRecord| -> Option<WorkerHistory> { None };

        let at_zero = strategy_scores(
            Strategy::RoundRobin,
            &req,
            &candidates,
            &none,
            0,
            Utc::now(),
        );
        assert_eq!(at_zero[0], 1.0);

        let at_one = strategy_scores(
            Strategy::RoundRobin,
            &req,
            &candidates,
            &none,
            1,
            Utc::now(),
        );
        assert_eq!(at_one[1], 1.0);
        assert!(at_one[0] < 1.0);
    }

    #[test]
    fn test_normalize_handles_all_zero() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
        let normalized = normalize(&[1.0, 4.0]);
        assert_eq!(normalized, vec![0.25, 1.0]);
    }

    #[test]
    fn test_empty_requirements_give_generalists_zero_specialization() {
        let req = requirements(&[]);
        let generalist = worker(&["rust", "go"], 10, 0);
        assert_eq!(capability_score(&req, &generalist), 0.0);
    }
}
