//! Error taxonomy for the task layer.
//!
//! Every fallible operation in the crate returns [`TaskError`]. The enum is
//! `Clone` because a terminal error stored on a [`TaskFuture`](crate::future::TaskFuture)
//! is handed to every observer that asks for the result.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("max instances reached for task '{task}' (limit={limit})")]
    MaxInstancesReached { task: String, limit: usize },

    #[error("no active session on this thread")]
    SessionNotFound,

    #[error("session error: {0}")]
    Session(String),

    #[error("invalid task definition: {0}")]
    Definition(String),

    #[error("task instance {instance_id} was cancelled")]
    Cancelled { instance_id: String },

    #[error("task instance {0} has already been started")]
    AlreadyStarted(String),

    #[error("timed out after {0:?} waiting for result")]
    Timeout(Duration),

    #[error("{0}")]
    Usage(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("instance {instance_id} already has an active execution {active_execution_id}")]
    ExecutionConflict {
        instance_id: String,
        active_execution_id: String,
    },

    #[error("instance {instance_id} does not belong to session {session_id}")]
    SessionOwnership {
        session_id: String,
        instance_id: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid task inputs: {0}")]
    Input(String),

    #[error(transparent)]
    Failed(TaskFailure),
}

impl TaskError {
    /// Short, stable name of the error class. Used as `error_type` when the
    /// error is reported to the service.
    pub fn kind(&self) -> &str {
        match self {
            TaskError::MaxInstancesReached { .. } => "MaxInstancesReached",
            TaskError::SessionNotFound => "SessionNotFound",
            TaskError::Session(_) => "SessionError",
            TaskError::Definition(_) => "TaskDefinitionError",
            TaskError::Cancelled { .. } => "TaskCancelled",
            TaskError::AlreadyStarted(_) => "TaskError",
            TaskError::Timeout(_) => "TimeoutError",
            TaskError::Usage(_) => "TypeError",
            TaskError::Backend(_) => "BackendError",
            TaskError::ExecutionConflict { .. } => "ExecutionConflictError",
            TaskError::SessionOwnership { .. } => "SessionOwnershipError",
            TaskError::NotFound(_) => "NotFound",
            TaskError::Configuration(_) => "ConfigurationError",
            TaskError::Manifest(_) => "ManifestError",
            TaskError::Input(_) => "InputError",
            TaskError::Failed(failure) => failure.error_type(),
        }
    }

    /// Converts the error into the envelope sent to the service.
    pub fn to_failure(&self) -> TaskFailure {
        match self {
            TaskError::Failed(failure) => failure.clone(),
            other => TaskFailure::new(other.kind(), other.to_string()),
        }
    }

    pub(crate) fn backend(err: impl fmt::Display) -> Self {
        TaskError::Backend(err.to_string())
    }
}

/// A failure raised by user task code.
///
/// `error_type` and `message` travel over the wire. The original error value
/// is kept in-process so callers can recover it with [`TaskFailure::downcast_ref`].
#[derive(Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    error_type: String,
    message: String,
    #[serde(skip)]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TaskFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an arbitrary error, naming it after its Rust type.
    pub fn from_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let source: Arc<dyn std::error::Error + Send + Sync> = Arc::new(err);
        // A TaskFailure returned by user code keeps its own name.
        if let Some(inner) = source.downcast_ref::<TaskFailure>() {
            return inner.clone();
        }
        Self {
            error_type: short_type_name::<E>().to_string(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref().and_then(|s| s.downcast_ref::<E>())
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("error_type", &self.error_type)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for TaskFailure {}

impl PartialEq for TaskFailure {
    fn eq(&self, other: &Self) -> bool {
        self.error_type == other.error_type && self.message == other.message
    }
}

impl From<TaskFailure> for TaskError {
    fn from(failure: TaskFailure) -> Self {
        TaskError::Failed(failure)
    }
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
