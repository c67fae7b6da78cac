//! Pluggable task executors keyed by capability tag.
//!
//! The scheduler never interprets task payloads or results: it hands the
//! [`Task`] to whichever [`TaskExecutor`] is registered for the task's
//! capability and records what comes back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::models::task::Task;
use crate::{AppError, Result};

/// Boxed future returned by executors.
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;

/// Runs the domain logic behind one capability tag.
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` and return its opaque result.
    ///
    /// # Errors
    ///
    /// Any error marks the task failed; it never stops the scheduler.
    fn execute<'a>(&'a self, task: &'a Task) -> ExecFuture<'a>;
}

/// Adapter turning an async closure into an executor.
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    /// Wrap `func`.
    #[must_use]
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn execute<'a>(&'a self, task: &'a Task) -> ExecFuture<'a> {
        Box::pin((self.func)(task.clone()))
    }
}

/// Runs an external command per task.
///
/// The task payload is written to the child's stdin as JSON. Stdout is
/// parsed as JSON, falling back to a plain string. A non-zero exit status
/// fails the task with the child's stderr.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Build an executor from a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the command line is empty.
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_owned);
        let program = parts
            .next()
            .ok_or_else(|| AppError::Config("executor command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute<'a>(&'a self, task: &'a Task) -> ExecFuture<'a> {
        Box::pin(async move {
            let input = serde_json::to_vec(&task.payload)?;
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .env("CONTEXT_RELAY_TASK_ID", &task.id)
                .env("CONTEXT_RELAY_CAPABILITY", &task.capability)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| {
                    AppError::Execution(format!("failed to spawn {}: {err}", self.program))
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                // Commands that ignore stdin may close it before we finish.
                if let Err(err) = stdin.write_all(&input).await {
                    if err.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(err.into());
                    }
                }
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AppError::Execution(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!(task_id = %task.id, bytes = output.stdout.len(), "command executor finished");
            Ok(serde_json::from_str(stdout.trim())
                .unwrap_or_else(|_| serde_json::Value::String(stdout.trim().to_owned())))
        })
    }
}

/// Capability tag to executor lookup, with an optional fallback.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
    default: Option<Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `capability`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, capability: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(capability.into(), executor);
        self
    }

    /// Register an executor used when no capability-specific one exists.
    #[must_use]
    pub fn with_default(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.default = Some(executor);
        self
    }

    /// Build a registry of [`CommandExecutor`]s from `[executors]` config.
    ///
    /// The key `default` registers the fallback executor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any command line is empty.
    pub fn from_commands(commands: &HashMap<String, String>) -> Result<Self> {
        let mut registry = Self::new();
        for (capability, command) in commands {
            let executor: Arc<dyn TaskExecutor> =
                Arc::new(CommandExecutor::from_command_line(command)?);
            if capability == "default" {
                registry = registry.with_default(executor);
            } else {
                registry = registry.with(capability.clone(), executor);
            }
        }
        Ok(registry)
    }

    /// Executor for `capability`, or the fallback.
    #[must_use]
    pub fn resolve(&self, capability: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors
            .get(capability)
            .or(self.default.as_ref())
            .cloned()
    }

    /// Capability tags with a dedicated executor.
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.executors.keys().cloned().collect();
        tags.sort();
        tags
    }
}
