use std::collections::HashMap;

use serde_json::Value;

use super::clock::ClockOrdering;
use super::MemoryEntry;

/// Outcome of collapsing concurrent entries to a single value.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub entry: MemoryEntry,
    /// Name of the strategy that decided, for the conflict-resolved event.
    pub strategy: &'static str,
    pub discarded: Vec<MemoryEntry>,
}

/// A pluggable resolver for pairwise-concurrent entries.
///
/// Resolvers must be commutative (argument order never changes the outcome)
/// and idempotent (re-resolving the output with any input is stable). The
/// registry pre-sorts candidates by `(timestamp, owner)` so implementations
/// see a canonical order.
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, candidates: Vec<MemoryEntry>) -> Resolution;
}

/// Last-writer-wins by wall-clock timestamp, owner id as the tie-break.
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn resolve(&self, mut candidates: Vec<MemoryEntry>) -> Resolution {
        // Canonical order puts the winner last.
        let entry = candidates.pop().expect("resolver requires candidates");
        Resolution {
            entry,
            strategy: self.name(),
            discarded: candidates,
        }
    }
}

/// Set union for array-typed values. Elements are deduplicated by their
/// JSON encoding and sorted so the outcome is order-independent.
pub struct UnionResolver;

impl ConflictResolver for UnionResolver {
    fn name(&self) -> &'static str {
        "union"
    }

    fn resolve(&self, candidates: Vec<MemoryEntry>) -> Resolution {
        let mut elements: Vec<Value> = Vec::new();
        let mut seen: Vec<String> = Vec::new();

        for entry in &candidates {
            if let Value::Array(items) = &entry.value {
                for item in items {
                    let encoded = item.to_string();
                    if !seen.contains(&encoded) {
                        seen.push(encoded);
                        elements.push(item.clone());
                    }
                }
            }
        }
        elements.sort_by_key(|v| v.to_string());

        merged_resolution(self.name(), candidates, Value::Array(elements))
    }
}

/// Shallow merge for map-typed values. Entries are applied in ascending
/// timestamp order, so the newest writer wins each contested field.
pub struct ShallowMergeResolver;

impl ConflictResolver for ShallowMergeResolver {
    fn name(&self) -> &'static str {
        "shallow-merge"
    }

    fn resolve(&self, candidates: Vec<MemoryEntry>) -> Resolution {
        let mut merged = serde_json::Map::new();
        for entry in &candidates {
            if let Value::Object(map) = &entry.value {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        merged_resolution(self.name(), candidates, Value::Object(merged))
    }
}

/// Numeric maximum.
pub struct MaxResolver;

impl ConflictResolver for MaxResolver {
    fn name(&self) -> &'static str {
        "max"
    }

    fn resolve(&self, candidates: Vec<MemoryEntry>) -> Resolution {
        let max = candidates
            .iter()
            .filter_map(|e| e.value.as_f64())
            .fold(f64::NEG_INFINITY, f64::max);

        let value = if max.is_finite() {
            serde_json::Number::from_f64(max)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        merged_resolution(self.name(), candidates, value)
    }
}

/// Build a resolution whose entry carries the merged value on top of the
/// newest candidate's clock and timestamp, with every input listed as
/// discarded except the base.
fn merged_resolution(
    strategy: &'static str,
    mut candidates: Vec<MemoryEntry>,
    value: Value,
) -> Resolution {
    let mut base = candidates.pop().expect("resolver requires candidates");
    // The merged entry observes every contributing clock so it causally
    // follows all inputs.
    for other in &candidates {
        base.clock.observe(&other.clock);
    }
    base.value = value;
    Resolution {
        entry: base,
        strategy,
        discarded: candidates,
    }
}

/// Resolver dispatch: dominance first, then a per-value-type resolver,
/// falling back to last-writer-wins.
pub struct ResolverRegistry {
    by_type: HashMap<String, Box<dyn ConflictResolver>>,
    fallback: Box<dyn ConflictResolver>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            fallback: Box::new(LastWriterWins),
        }
    }

    /// Register a resolver for a value type tag (`"set"`, `"map"`,
    /// `"counter"`, or consumer-defined).
    pub fn register(&mut self, value_type: impl Into<String>, resolver: Box<dyn ConflictResolver>) {
        self.by_type.insert(value_type.into(), resolver);
    }

    /// Built-in resolvers for the common value shapes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("set", Box::new(UnionResolver));
        registry.register("map", Box::new(ShallowMergeResolver));
        registry.register("counter", Box::new(MaxResolver));
        registry
    }

    /// Collapse candidates to one entry.
    ///
    /// If any entry strictly dominates all others it wins outright with
    /// strategy `dominated`. Otherwise the candidates are canonically
    /// ordered by `(timestamp, owner)` and handed to the resolver for
    /// `value_type` (or the fallback).
    pub fn resolve(&self, value_type: Option<&str>, mut candidates: Vec<MemoryEntry>) -> Resolution {
        assert!(!candidates.is_empty(), "resolve requires candidates");

        if candidates.len() == 1 {
            return Resolution {
                entry: candidates.pop().unwrap(),
                strategy: "dominated",
                discarded: Vec::new(),
            };
        }

        if let Some(winner) = dominant_index(&candidates) {
            let entry = candidates.swap_remove(winner);
            return Resolution {
                entry,
                strategy: "dominated",
                discarded: candidates,
            };
        }

        // Canonical order: ascending (timestamp, owner). Makes every
        // resolver commutative over its inputs.
        candidates.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.owner.cmp(&b.owner))
        });

        let resolver = value_type
            .and_then(|t| self.by_type.get(t))
            .unwrap_or(&self.fallback);

        resolver.resolve(candidates)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Index of an entry whose clock strictly dominates every other, if any.
fn dominant_index(candidates: &[MemoryEntry]) -> Option<usize> {
    candidates.iter().position(|candidate| {
        candidates
            .iter()
            .filter(|other| !std::ptr::eq(*other, candidate))
            .all(|other| candidate.clock.compare(&other.clock) == ClockOrdering::After)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::clock::VectorClock;
    use chrono::{TimeZone, Utc};
    use sentinel_common::ids::WorkerId;

    fn entry(owner: WorkerId, ts_secs: i64, value: Value, clock: VectorClock) -> MemoryEntry {
        MemoryEntry {
            value,
            clock,
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            owner,
            ttl_seconds: None,
        }
    }

    fn concurrent_pair(a_value: Value, b_value: Value) -> (MemoryEntry, MemoryEntry) {
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        let mut c1 = VectorClock::new();
        c1.increment(w1);
        let mut c2 = VectorClock::new();
        c2.increment(w2);
        (entry(w1, 100, a_value, c1), entry(w2, 200, b_value, c2))
    }

    #[test]
    fn test_dominant_entry_wins_without_resolver() {
        let w1 = WorkerId::new();
        let mut older = VectorClock::new();
        older.increment(w1);
        let mut newer = older.clone();
        newer.increment(w1);

        let registry = ResolverRegistry::with_builtins();
        let resolution = registry.resolve(
            Some("map"),
            vec![
                entry(w1, 100, serde_json::json!({"a": 1}), older),
                entry(w1, 200, serde_json::json!({"a": 2}), newer),
            ],
        );

        assert_eq!(resolution.strategy, "dominated");
        assert_eq!(resolution.entry.value, serde_json::json!({"a": 2}));
        assert_eq!(resolution.discarded.len(), 1);
    }

    #[test]
    fn test_shallow_merge_newest_field_wins() {
        let (a, b) = concurrent_pair(
            serde_json::json!({"a": 1, "shared": "old"}),
            serde_json::json!({"b": 2, "shared": "new"}),
        );

        let registry = ResolverRegistry::with_builtins();
        let forward = registry.resolve(Some("map"), vec![a.clone(), b.clone()]);
        let reverse = registry.resolve(Some("map"), vec![b, a]);

        let expected = serde_json::json!({"a": 1, "b": 2, "shared": "new"});
        assert_eq!(forward.entry.value, expected);
        // Commutative: argument order is irrelevant.
        assert_eq!(reverse.entry.value, expected);
        assert_eq!(forward.strategy, "shallow-merge");
        assert_eq!(forward.discarded.len(), 1);
    }

    #[test]
    fn test_union_deduplicates_and_orders() {
        let (a, b) = concurrent_pair(serde_json::json!([1, 2]), serde_json::json!([2, 3]));

        let registry = ResolverRegistry::with_builtins();
        let forward = registry.resolve(Some("set"), vec![a.clone(), b.clone()]);
        let reverse = registry.resolve(Some("set"), vec![b, a]);

        assert_eq!(forward.entry.value, serde_json::json!([1, 2, 3]));
        assert_eq!(reverse.entry.value, forward.entry.value);
    }

    #[test]
    fn test_max_resolver() {
        let (a, b) = concurrent_pair(serde_json::json!(7), serde_json::json!(3));

        let registry = ResolverRegistry::with_builtins();
        let resolution = registry.resolve(Some("counter"), vec![a, b]);
        assert_eq!(resolution.entry.value, serde_json::json!(7.0));
    }

    #[test]
    fn test_lww_fallback_and_idempotence() {
        let (a, b) = concurrent_pair(serde_json::json!("first"), serde_json::json!("second"));

        let registry = ResolverRegistry::with_builtins();
        let once = registry.resolve(None, vec![a.clone(), b.clone()]);
        // b has the later timestamp.
        assert_eq!(once.entry.value, serde_json::json!("second"));

        // Re-resolving the winner against an original input is stable.
        let twice = registry.resolve(None, vec![once.entry.clone(), a]);
        assert_eq!(twice.entry.value, serde_json::json!("second"));
    }
}
