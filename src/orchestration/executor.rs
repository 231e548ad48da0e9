//! Task execution step.
//!
//! The orchestrator treats execution as opaque: it hands a task, its
//! workspace and optional convergence feedback to a [`TaskExecutor`] and gets
//! an [`ExecutionResult`] back. [`ExecutorSet`] picks the executor for a task
//! kind; [`CommandExecutor`] runs an external command inside the workspace.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Task, TaskKind};
use crate::error::{Error, Result};
use crate::orchestration::convergence::Feedback;
use crate::orchestration::registry::WorkerId;
use crate::orchestration::workspace::Workspace;
use crate::mlog_debug;

/// Something a task produced besides code changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Outcome of one execution step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(summary: &str) -> Self {
        Self {
            success: true,
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Everything an executor needs for one run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    pub workspace: Workspace,
    pub worker: WorkerId,
    /// 1-based; always 1 for tasks without a goal.
    pub iteration: u32,
    pub feedback: Option<Feedback>,
    /// Cancelled when the task is cancelled or times out.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task. `Ok` with `success: false` is an ordinary task failure;
    /// `Err` is reserved for infrastructure problems.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;
}

/// Executor lookup by task kind, with a default for kinds not overridden.
#[derive(Clone)]
pub struct ExecutorSet {
    default: Arc<dyn TaskExecutor>,
    overrides: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorSet {
    pub fn new(default: Arc<dyn TaskExecutor>) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) -> Self {
        self.overrides.insert(kind, executor);
        self
    }

    pub fn for_kind(&self, kind: TaskKind) -> Arc<dyn TaskExecutor> {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[derive(Serialize)]
struct StdinPayload<'a> {
    task: &'a Task,
    worker: &'a WorkerId,
    iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a Feedback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback_text: Option<String>,
}

/// Runs an external command in the task's workspace.
///
/// The task (and convergence feedback, if any) is written to stdin as JSON,
/// and `MAESTRO_TASK_ID`, `MAESTRO_ITERATION` and `MAESTRO_WORKSPACE` are set.
/// The last stdout line that parses as an [`ExecutionResult`] is the result;
/// without one, the exit status decides success and stdout is the summary.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Build from a command line such as `claude -p`, resolving the program
    /// on `PATH`.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("Executor command is empty".to_string()))?;
        let resolved = which::which(program).map_err(|_| {
            Error::Validation(format!("Executor command not found on PATH: {}", program))
        })?;
        Ok(Self {
            program: resolved,
            args: parts.map(String::from).collect(),
        })
    }

    pub fn with_program(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Interpret the process output.
    pub fn parse_output(stdout: &str, stderr: &str, exit_ok: bool) -> ExecutionResult {
        if let Some(result) = stdout
            .lines()
            .rev()
            .filter(|line| line.trim_start().starts_with('{'))
            .find_map(|line| serde_json::from_str::<ExecutionResult>(line.trim()).ok())
        {
            return result;
        }

        if exit_ok {
            ExecutionResult::success(stdout.trim())
        } else {
            let error = if stderr.trim().is_empty() {
                "command exited with a failure status".to_string()
            } else {
                stderr.trim().to_string()
            };
            ExecutionResult {
                success: false,
                summary: stdout.trim().to_string(),
                error: Some(error),
                ..Default::default()
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        mlog_debug!(
            "CommandExecutor::execute task={} iteration={} cwd={}",
            request.task.id,
            request.iteration,
            request.workspace.path.display()
        );
        let payload = serde_json::to_vec(&StdinPayload {
            task: &request.task,
            worker: &request.worker,
            iteration: request.iteration,
            feedback: request.feedback.as_ref(),
            feedback_text: request.feedback.as_ref().map(|f| f.to_string()),
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace.path)
            .env("MAESTRO_TASK_ID", request.task.id.as_str())
            .env("MAESTRO_ITERATION", request.iteration.to_string())
            .env("MAESTRO_WORKSPACE", &request.workspace.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Fed from its own task so a command that writes before it reads
        // cannot fill its output pipes while we block on its input.
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The command may exit without reading its input.
                if let Err(e) = stdin.write_all(&payload).await {
                    mlog_debug!("Executor stdin not consumed: {}", e);
                }
            })
        });

        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = request.cancel.cancelled() => {
                if let Some(feeder) = &feeder {
                    feeder.abort();
                }
                return Err(Error::Cancelled(format!("task {} cancelled", request.task.id)));
            }
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(Self::parse_output(&stdout, &stderr, output.status.success()))
    }
}
