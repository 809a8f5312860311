//! Records held by the service. The client only sees them as responses and
//! refers to them by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::descriptor::Size;
use super::ids::{ClientId, ExecutionId, InstanceId, SessionId};
use crate::error::TaskFailure;

/// Task definition registration, keyed by `(name, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub module: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Request body of `upsert_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistration {
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub module: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TaskRegistration {
    pub fn from_descriptor(descriptor: &super::TaskDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            function_name: descriptor.function_name.clone(),
            module: descriptor.module.clone(),
            parameters: Some(descriptor.parameters_json()),
            metadata: Some(task_metadata(descriptor.max_parallel, descriptor.size)),
        }
    }
}

pub fn task_metadata(max_parallel: usize, size: Size) -> Value {
    serde_json::json!({ "max_parallel": max_parallel, "size": size })
}

/// Request body of `upsert_instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub instance_id: InstanceId,
    pub session_id: SessionId,
    pub task_name: String,
    pub task_version: String,
    #[serde(default)]
    pub inputs: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Completed => f.write_str("completed"),
            OutcomeStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Terminal outcome of an instance, reported by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

impl TaskOutcome {
    pub fn completed(result: Value) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: TaskFailure) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    pub logged_at: DateTime<Utc>,
}

/// Instance as stored by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub session_id: SessionId,
    pub task_name: String,
    pub task_version: String,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub outcome: Option<TaskOutcome>,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// One server-side attempt to run an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub instance_id: InstanceId,
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Item of an execution subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub progress: f64,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl From<&ExecutionRecord> for ExecutionUpdate {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id.clone(),
            status: record.status,
            progress: record.progress,
            status_message: record.status_message.clone(),
            error: record.error.clone(),
        }
    }
}

/// Item of an instance subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub instance_id: InstanceId,
    pub progress: f64,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub outcome: Option<OutcomeStatus>,
}

impl From<&InstanceRecord> for InstanceUpdate {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.id.clone(),
            progress: record.progress,
            status_message: record.status_message.clone(),
            outcome: record.outcome.as_ref().map(|o| o.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&ExecutionStatus::Killed).unwrap(), "\"killed\"");
        assert_eq!(serde_json::to_string(&OutcomeStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&LogLevel::Warning).unwrap(), "\"warning\"");
    }

    #[test]
    fn only_running_is_active() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Killed.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
    }

    #[test]
    fn failed_outcome_carries_error_envelope() {
        let outcome = TaskOutcome::failed(TaskFailure::new("ValueError", "bad"));
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"]["error_type"], "ValueError");
        assert_eq!(v["error"]["message"], "bad");
    }
}
