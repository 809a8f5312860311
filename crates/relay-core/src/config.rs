//! Settings loaded from the process environment.
//!
//! Keys are written in dotted form (`service.api_url`) and looked up as
//! upper-case variables with dots replaced by underscores (`SERVICE_API_URL`).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TaskError;

pub const DEFAULT_LOCAL_WORKERS: usize = 4;

/// Which execution backend new task instances use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

impl FromStr for BackendKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => Err(TaskError::Configuration(format!(
                "task.backend must be 'local' or 'remote', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub api_url: Option<String>,
    pub access_token: Option<String>,
    pub organization_id: Option<String>,
}

impl ServiceSettings {
    /// True when both the URL and the credential are present.
    pub fn is_configured(&self) -> bool {
        self.api_url.is_some() && self.access_token.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub instance_id: Option<String>,
    pub function_name: Option<String>,
    pub manifest_path: Option<PathBuf>,
    pub collection_name: Option<String>,
    pub backend: BackendKind,
    pub mock_remote_logging: bool,
    pub local_workers: usize,
    pub force_start: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            function_name: None,
            manifest_path: None,
            collection_name: None,
            backend: BackendKind::Local,
            mock_remote_logging: false,
            local_workers: DEFAULT_LOCAL_WORKERS,
            force_start: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service: ServiceSettings,
    pub task: TaskSettings,
    /// Root of the filesystem fallback for collections.
    pub collections_base_path: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self, TaskError> {
        Self::from_lookup(|key| env::var(env_var_name(key)).ok())
    }

    /// Builds settings from an arbitrary lookup keyed by dotted names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TaskError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let service = ServiceSettings {
            api_url: get("service.api_url").map(|u| u.trim_end_matches('/').to_string()),
            access_token: get("service.access_token"),
            organization_id: get("service.organization_id"),
        };

        let backend = match get("task.backend") {
            Some(v) => v.parse()?,
            None => BackendKind::Local,
        };

        let local_workers = match get("task.local_workers") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    TaskError::Configuration(format!(
                        "task.local_workers must be a positive integer, got '{v}'"
                    ))
                })?,
            None => DEFAULT_LOCAL_WORKERS,
        };

        let task = TaskSettings {
            instance_id: get("task.instance_id"),
            function_name: get("task.function_name"),
            manifest_path: get("task.manifest_path").map(PathBuf::from),
            collection_name: get("task.collection_name"),
            backend,
            mock_remote_logging: parse_flag("task.mock_remote_logging", get("task.mock_remote_logging"))?,
            local_workers,
            force_start: parse_flag("task.force_start", get("task.force_start"))?,
        };

        Ok(Self {
            service,
            task,
            collections_base_path: get("collections.base_path").map(PathBuf::from),
        })
    }

    /// True when this process was launched to run exactly one instance.
    pub fn is_runner(&self) -> bool {
        self.task.instance_id.is_some()
    }
}

/// `service.api_url` -> `SERVICE_API_URL`
pub fn env_var_name(key: &str) -> String {
    key.replace('.', "_").to_ascii_uppercase()
}

fn parse_flag(key: &str, value: Option<String>) -> Result<bool, TaskError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TaskError::Configuration(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}
