//! Quality goals for goal-tracked tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// How a metric is compared against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// The metric must be `>= threshold` (scores, coverage).
    #[default]
    AtLeast,
    /// The metric must be `<= threshold` (error counts, latency).
    AtMost,
}

/// A single success criterion.
///
/// Accepts either a bare number (`"coverage": 0.8`, meaning at least) or
/// the full form `{"threshold": 0, "comparison": "at_most"}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "CriterionRepr")]
pub struct Criterion {
    pub threshold: f64,
    pub comparison: Comparison,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CriterionRepr {
    Threshold(f64),
    Full {
        threshold: f64,
        #[serde(default)]
        comparison: Comparison,
    },
}

impl From<CriterionRepr> for Criterion {
    fn from(repr: CriterionRepr) -> Self {
        match repr {
            CriterionRepr::Threshold(threshold) => Criterion::at_least(threshold),
            CriterionRepr::Full {
                threshold,
                comparison,
            } => Criterion {
                threshold,
                comparison,
            },
        }
    }
}

impl Criterion {
    pub fn at_least(threshold: f64) -> Self {
        Self {
            threshold,
            comparison: Comparison::AtLeast,
        }
    }

    pub fn at_most(threshold: f64) -> Self {
        Self {
            threshold,
            comparison: Comparison::AtMost,
        }
    }

    /// Signed distance from the threshold; non-negative means satisfied.
    pub fn margin(&self, actual: f64) -> f64 {
        match self.comparison {
            Comparison::AtLeast => actual - self.threshold,
            Comparison::AtMost => self.threshold - actual,
        }
    }

    pub fn is_met(&self, actual: f64) -> bool {
        !actual.is_nan() && self.margin(actual) >= 0.0
    }
}

/// Iteration budget used when neither the goal nor the config sets one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Consecutive passing iterations required by default.
pub const DEFAULT_CONVERGENCE_WINDOW: u32 = 2;

/// A measurable quality goal that a task iterates toward.
///
/// `max_iterations` and `convergence_window` may be omitted; the
/// orchestrator then fills them from the `[convergence]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    #[serde(alias = "successCriteria")]
    pub success_criteria: BTreeMap<String, Criterion>,
    #[serde(
        default,
        alias = "maxIterations",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_iterations: Option<u32>,
    #[serde(
        default,
        alias = "convergenceWindow",
        skip_serializing_if = "Option::is_none"
    )]
    pub convergence_window: Option<u32>,
}

impl Goal {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            success_criteria: BTreeMap::new(),
            max_iterations: None,
            convergence_window: None,
        }
    }

    pub fn criterion(mut self, metric: &str, criterion: Criterion) -> Self {
        self.success_criteria.insert(metric.to_string(), criterion);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_convergence_window(mut self, window: u32) -> Self {
        self.convergence_window = Some(window);
        self
    }

    /// Fill unset limits from configuration.
    pub fn apply_defaults(&mut self, max_iterations: u32, convergence_window: u32) {
        self.max_iterations.get_or_insert(max_iterations);
        self.convergence_window.get_or_insert(convergence_window);
    }

    pub fn iteration_budget(&self) -> u32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    pub fn window(&self) -> u32 {
        self.convergence_window
            .unwrap_or(DEFAULT_CONVERGENCE_WINDOW)
            .min(self.iteration_budget())
    }

    pub fn validate(&self) -> Result<()> {
        if self.success_criteria.is_empty() {
            return Err(Error::Validation(format!(
                "Goal {} has no success criteria",
                self.id
            )));
        }
        let max = self.iteration_budget();
        if max == 0 {
            return Err(Error::Validation(format!(
                "Goal {} must allow at least one iteration",
                self.id
            )));
        }
        if let Some(window) = self.convergence_window {
            if window == 0 || window > max {
                return Err(Error::Validation(format!(
                    "Goal {} convergence window {} must be within 1..={}",
                    self.id, window, max
                )));
            }
        }
        Ok(())
    }
}
