// Task polling
// Finds the latest task of an action and reports its state

use reqwest::Method;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::dispatch::{classify, ActionDispatcher, ActionRoute};
use crate::error::{ClientError, Result};
use crate::http_client::read_json;

/// Remote task state. Only `Complete` and `Cancelled` are terminal;
/// anything unrecognized is treated as still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    InProgress,
    Complete,
    Cancelling,
    Cancelled,
    Other(String),
}

impl TaskState {
    pub fn parse(s: &str) -> Self {
        match s {
            "NOT_STARTED" => TaskState::NotStarted,
            "IN_PROGRESS" => TaskState::InProgress,
            "COMPLETE" => TaskState::Complete,
            "CANCELLING" => TaskState::Cancelling,
            "CANCELLED" => TaskState::Cancelled,
            other => TaskState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskState::NotStarted => "NOT_STARTED",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Complete => "COMPLETE",
            TaskState::Cancelling => "CANCELLING",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a terminal task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

/// Full detail of one task
#[derive(Debug, Clone)]
pub struct TaskDetail {
    pub task_id: String,
    pub task_state: TaskState,
    /// Raw `task` object, including `result` and messages
    pub raw: Value,
}

impl TaskDetail {
    pub fn from_value(task: Value) -> Result<Self> {
        let task_id = task
            .get("taskId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let task_state = task
            .get("taskState")
            .and_then(Value::as_str)
            .map(TaskState::parse)
            .ok_or_else(|| ClientError::Api {
                status: 200,
                message: "task detail has no taskState".to_string(),
            })?;

        Ok(Self {
            task_id,
            task_state,
            raw: task,
        })
    }

    /// Outcome of a terminal task; `None` while it is still running.
    /// A completed task without `result.successful` counts as failed.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.task_state {
            TaskState::Cancelled => Some(TaskOutcome::Cancelled),
            TaskState::Complete => {
                let result = self.raw.get("result");
                let successful = result
                    .and_then(|r| r.get("successful"))
                    .and_then(Value::as_bool);
                let dump = result
                    .and_then(|r| r.get("failureDumpAvailable"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                Some(match successful {
                    Some(true) if dump => TaskOutcome::CompletedWithErrors,
                    Some(true) => TaskOutcome::Success,
                    _ => TaskOutcome::Failed,
                })
            }
            _ => None,
        }
    }
}

/// Id of the latest task: the last entry in server order
pub fn latest_task_id(tasks: &[Value]) -> Option<String> {
    tasks
        .last()
        .and_then(|t| t.get("taskId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Stateless poller; callers own the loop and its timing
#[derive(Clone)]
pub struct TaskPoller {
    dispatcher: ActionDispatcher,
}

impl TaskPoller {
    pub fn new(dispatcher: ActionDispatcher) -> Self {
        Self { dispatcher }
    }

    /// All tasks recorded for an action, in server order
    pub async fn list_tasks(&self, action_id: &str) -> Result<Vec<Value>> {
        let route = classify(action_id)?;
        let body = self.fetch(&route, &route.tasks_path()).await?;

        Ok(body
            .get("tasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Detail of the latest task of an action
    pub async fn poll(&self, action_id: &str) -> Result<TaskDetail> {
        let route = classify(action_id)?;
        let tasks = self.list_tasks(action_id).await?;
        let task_id =
            latest_task_id(&tasks).ok_or_else(|| ClientError::NoTasks(action_id.to_string()))?;

        let body = self.fetch(&route, &route.task_path(&task_id)).await?;
        let task = body.get("task").cloned().ok_or_else(|| ClientError::Polling {
            action_id: action_id.to_string(),
            reason: "response has no task object".to_string(),
        })?;

        let detail = TaskDetail::from_value(task)?;
        tracing::debug!(
            action = %route,
            task_id = %detail.task_id,
            state = %detail.task_state,
            "Polled task"
        );
        Ok(detail)
    }

    /// `poll(action_id).task_state`
    pub async fn status(&self, action_id: &str) -> Result<TaskState> {
        Ok(self.poll(action_id).await?.task_state)
    }

    async fn fetch(&self, route: &ActionRoute, path: &str) -> Result<Value> {
        let polling = |e: ClientError| match e {
            ClientError::Transport { .. } | ClientError::Api { .. } => ClientError::Polling {
                action_id: route.action_id.clone(),
                reason: e.to_string(),
            },
            other => other,
        };

        let http = self.dispatcher.http();
        let builder = http
            .request(Method::GET, path)
            .await?
            .header("Accept", "application/json");
        let response = http.request_no_retry(builder).await.map_err(polling)?;
        read_json(response).await.map_err(polling)
    }
}

/// Caller-side polling policy
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Poll until the latest task reaches a terminal state.
/// Individual poll failures are logged and retried on the next tick;
/// authentication and input errors end the wait. Dropping the future
/// cancels the wait without touching the remote task.
pub async fn wait_for_completion(
    poller: &TaskPoller,
    action_id: &str,
    options: WaitOptions,
) -> Result<TaskDetail> {
    let started = tokio::time::Instant::now();
    let mut last_state: Option<TaskState> = None;

    loop {
        match poller.poll(action_id).await {
            Ok(detail) if detail.task_state.is_terminal() => {
                tracing::info!(
                    action_id = action_id,
                    task_id = %detail.task_id,
                    state = %detail.task_state,
                    outcome = ?detail.outcome(),
                    "Task finished"
                );
                return Ok(detail);
            }
            Ok(detail) => {
                if last_state.as_ref() != Some(&detail.task_state) {
                    tracing::info!(action_id = action_id, state = %detail.task_state, "Task running");
                    last_state = Some(detail.task_state);
                }
            }
            Err(e @ ClientError::Polling { .. }) => {
                tracing::warn!("Poll failed, will retry: {}", e);
            }
            Err(e) => return Err(e),
        }

        if started.elapsed() + options.interval > options.timeout {
            return Err(ClientError::PollTimeout {
                action_id: action_id.to_string(),
                waited_secs: started.elapsed().as_secs(),
            });
        }

        tokio::time::sleep(options.interval).await;
    }
}
