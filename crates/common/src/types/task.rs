use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Priority levels for task scheduling and queue ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Numeric rank for descending sorts (higher = more urgent).
    pub fn rank(&self) -> i32 {
        match self {
            Self::High => 2,
            Self::Normal => 1,
            Self::Low => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// What a task demands of the worker that runs it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Capability tags the worker must advertise (subset match).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Capacity units this task consumes while running.
    pub complexity: u32,
    #[serde(default)]
    pub priority: TaskPriority,
    pub task_type: String,
    /// Preferred workers, stable-sorted to the front of the candidate list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affinity: Vec<WorkerId>,
    /// Workers removed from the candidate list outright.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anti_affinity: Vec<WorkerId>,
}

impl TaskRequirements {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            capabilities: BTreeSet::new(),
            complexity: 1,
            priority: TaskPriority::Normal,
            task_type: task_type.into(),
            affinity: Vec::new(),
            anti_affinity: Vec::new(),
        }
    }

    pub fn with_capabilities<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        capabilities: I,
    ) -> Self {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}
