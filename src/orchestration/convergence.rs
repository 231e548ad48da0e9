//! Convergence controller for goal-tracked tasks.
//!
//! Drives repeated execution of one task until its goal's success criteria
//! hold for `convergence_window` consecutive iterations, the iteration budget
//! runs out, or the aggregate score stops improving.
//!
//! State machine: `Initializing -> Iterating -> {Converged | Exhausted | Diverging}`.
//! Between iterations the controller synthesizes [`Feedback`] naming each
//! failed criterion and its shortfall, which the next iteration receives.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::goal::{Comparison, Goal};
use crate::error::{Error, Result};
use crate::orchestration::executor::ExecutionResult;
use crate::{mlog_debug, mlog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Initializing,
    Iterating,
    Converged,
    Exhausted,
    Diverging,
}

impl ConvergenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConvergenceState::Converged | ConvergenceState::Exhausted | ConvergenceState::Diverging
        )
    }
}

impl fmt::Display for ConvergenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConvergenceState::Initializing => "initializing",
            ConvergenceState::Iterating => "iterating",
            ConvergenceState::Converged => "converged",
            ConvergenceState::Exhausted => "exhausted",
            ConvergenceState::Diverging => "diverging",
        };
        write!(f, "{}", s)
    }
}

/// One criterion that did not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionFailure {
    pub metric: String,
    pub threshold: f64,
    pub comparison: Comparison,
    /// `None` when the metric was not reported.
    pub actual: Option<f64>,
    /// Distance to the threshold, when the metric was reported.
    pub shortfall: Option<f64>,
}

/// Structured feedback injected into the next iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub iteration: u32,
    pub failures: Vec<CriterionFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Feedback {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.error.is_none()
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Iteration {} did not meet the goal:", self.iteration)?;
        if let Some(error) = &self.error {
            writeln!(f, "- execution failed: {}", error)?;
        }
        for failure in &self.failures {
            let op = match failure.comparison {
                Comparison::AtLeast => ">=",
                Comparison::AtMost => "<=",
            };
            match (failure.actual, failure.shortfall) {
                (Some(actual), Some(shortfall)) => writeln!(
                    f,
                    "- {}: got {}, need {} {} (short by {})",
                    failure.metric, actual, op, failure.threshold, shortfall
                )?,
                _ => writeln!(
                    f,
                    "- {}: not reported, need {} {}",
                    failure.metric, op, failure.threshold
                )?,
            }
        }
        Ok(())
    }
}

/// Record of one finished iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub metrics: BTreeMap<String, f64>,
    pub passed: bool,
    /// Mean margin over all criteria; higher is better.
    pub score: f64,
    pub feedback: Option<Feedback>,
}

/// Score every criterion of `goal` against one execution result.
///
/// A missing metric counts as missing the threshold by
/// `max(|threshold|, 1)` so that reporting nothing never scores better than
/// reporting a poor value.
pub fn evaluate(goal: &Goal, iteration: u32, result: &ExecutionResult) -> IterationResult {
    let mut failures = Vec::new();
    let mut total = 0.0;

    for (metric, criterion) in &goal.success_criteria {
        match result.metrics.get(metric).copied().filter(|v| !v.is_nan()) {
            Some(actual) => {
                let margin = criterion.margin(actual);
                total += margin;
                if margin < 0.0 {
                    failures.push(CriterionFailure {
                        metric: metric.clone(),
                        threshold: criterion.threshold,
                        comparison: criterion.comparison,
                        actual: Some(actual),
                        shortfall: Some(-margin),
                    });
                }
            }
            None => {
                total -= criterion.threshold.abs().max(1.0);
                failures.push(CriterionFailure {
                    metric: metric.clone(),
                    threshold: criterion.threshold,
                    comparison: criterion.comparison,
                    actual: None,
                    shortfall: None,
                });
            }
        }
    }

    let error = if result.success {
        None
    } else {
        Some(
            result
                .error
                .clone()
                .unwrap_or_else(|| "execution reported failure".to_string()),
        )
    };
    let passed = failures.is_empty() && error.is_none();
    let criteria = goal.success_criteria.len().max(1) as f64;

    IterationResult {
        iteration,
        metrics: result.metrics.clone(),
        passed,
        score: total / criteria,
        feedback: (!passed).then(|| Feedback {
            iteration,
            failures,
            error,
        }),
    }
}

/// Runs one iteration of the underlying task.
#[async_trait]
pub trait IterationRunner: Send {
    /// `feedback` is `None` on the first iteration. An `Err` aborts the whole
    /// convergence run.
    async fn run_iteration(
        &mut self,
        iteration: u32,
        feedback: Option<&Feedback>,
    ) -> Result<ExecutionResult>;
}

#[derive(Debug, Clone)]
pub struct ConvergenceOutcome {
    pub goal_id: String,
    pub state: ConvergenceState,
    pub iterations: u32,
    /// Score of the last iteration.
    pub score: Option<f64>,
    pub history: Vec<IterationResult>,
    pub last_result: Option<ExecutionResult>,
}

impl ConvergenceOutcome {
    pub fn converged(&self) -> bool {
        self.state == ConvergenceState::Converged
    }

    pub fn last_feedback(&self) -> Option<&Feedback> {
        self.history.last().and_then(|h| h.feedback.as_ref())
    }

    /// `Ok` only when converged; the other terminal states become their
    /// escalation errors.
    pub fn into_result(self) -> Result<Self> {
        match self.state {
            ConvergenceState::Converged => Ok(self),
            ConvergenceState::Diverging => Err(Error::ConvergenceDiverging {
                goal: self.goal_id,
                iterations: self.iterations,
            }),
            _ => Err(Error::ConvergenceExhausted {
                goal: self.goal_id,
                iterations: self.iterations,
            }),
        }
    }
}

pub struct ConvergenceController {
    goal: Goal,
    divergence_window: Option<usize>,
    state: ConvergenceState,
    history: Vec<IterationResult>,
    last_result: Option<ExecutionResult>,
}

impl ConvergenceController {
    pub fn new(goal: Goal) -> Result<Self> {
        goal.validate()?;
        Ok(Self {
            goal,
            divergence_window: None,
            state: ConvergenceState::Initializing,
            history: Vec::new(),
            last_result: None,
        })
    }

    /// Stop early once the last `window` scores each failed to beat their
    /// predecessor. `None` or `Some(0)` disables the check.
    pub fn with_divergence_window(mut self, window: Option<usize>) -> Self {
        self.divergence_window = window.filter(|w| *w > 0);
        self
    }

    pub fn state(&self) -> ConvergenceState {
        self.state
    }

    pub fn history(&self) -> &[IterationResult] {
        &self.history
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    fn passing_streak(&self) -> u32 {
        self.history.iter().rev().take_while(|h| h.passed).count() as u32
    }

    fn is_diverging(&self) -> bool {
        let Some(window) = self.divergence_window else {
            return false;
        };
        if self.history.len() <= window {
            return false;
        }
        let recent = &self.history[self.history.len() - window - 1..];
        recent.windows(2).all(|pair| pair[1].score <= pair[0].score)
    }

    /// Feed one execution result into the state machine.
    pub fn record(&mut self, result: ExecutionResult) -> ConvergenceState {
        if self.state.is_terminal() {
            return self.state;
        }
        let iteration = self.history.len() as u32 + 1;
        let evaluated = evaluate(&self.goal, iteration, &result);
        let passed = evaluated.passed;
        mlog_debug!(
            "Goal {} iteration {}: passed={} score={:.3}",
            self.goal.id,
            iteration,
            passed,
            evaluated.score
        );
        self.history.push(evaluated);
        self.last_result = Some(result);

        self.state = if passed && self.passing_streak() >= self.goal.window() {
            ConvergenceState::Converged
        } else if iteration >= self.goal.iteration_budget() {
            ConvergenceState::Exhausted
        } else if !passed && self.is_diverging() {
            ConvergenceState::Diverging
        } else {
            ConvergenceState::Iterating
        };

        match self.state {
            ConvergenceState::Exhausted => mlog_warn!(
                "Goal {} exhausted after {} iterations; escalating",
                self.goal.id,
                iteration
            ),
            ConvergenceState::Diverging => mlog_warn!(
                "Goal {} stopped improving after {} iterations; escalating",
                self.goal.id,
                iteration
            ),
            _ => {}
        }
        self.state
    }

    /// Drive `runner` until a terminal state.
    pub async fn run<R>(mut self, runner: &mut R) -> Result<ConvergenceOutcome>
    where
        R: IterationRunner + ?Sized,
    {
        self.state = ConvergenceState::Iterating;
        while !self.state.is_terminal() {
            let iteration = self.history.len() as u32 + 1;
            let feedback = self.history.last().and_then(|h| h.feedback.clone());
            let result = runner.run_iteration(iteration, feedback.as_ref()).await?;
            self.record(result);
        }
        Ok(self.into_outcome())
    }

    fn into_outcome(self) -> ConvergenceOutcome {
        ConvergenceOutcome {
            goal_id: self.goal.id,
            state: self.state,
            iterations: self.history.len() as u32,
            score: self.history.last().map(|h| h.score),
            history: self.history,
            last_result: self.last_result,
        }
    }
}
