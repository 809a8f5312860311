//! Immutable description of a task definition: identity, parameter schema and
//! execution hints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TaskError;

/// Resource hint for the remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    #[default]
    Small,
    Medium,
    Large,
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Size::Small => "small",
            Size::Medium => "medium",
            Size::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for Size {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Size::Small),
            "medium" => Ok(Size::Medium),
            "large" => Ok(Size::Large),
            other => Err(TaskError::Definition(format!(
                "size must be small, medium or large, got '{other}'"
            ))),
        }
    }
}

/// One formal parameter of a task function.
///
/// `annotation` is the textual form of the declared type. `default` is the
/// compact JSON text of the default value, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub annotation: String,
    pub default: Option<String>,
}

impl Parameter {
    pub fn required(name: impl Into<String>, annotation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotation: annotation.into(),
            default: None,
        }
    }

    pub fn with_default(
        name: impl Into<String>,
        annotation: impl Into<String>,
        default_json: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            annotation: annotation.into(),
            default: Some(default_json.into()),
        }
    }

    pub fn default_value(&self) -> Result<Option<serde_json::Value>, TaskError> {
        self.default
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| {
                TaskError::Definition(format!("default of parameter '{}': {e}", self.name))
            })
    }
}

/// Everything known about a task definition except the callable itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub version: String,
    pub function_name: String,
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    pub parameters: Vec<Parameter>,
    pub max_parallel: usize,
    pub size: Size,
    pub expects_control: bool,
}

impl TaskDescriptor {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parameter schema as sent with `upsert_task`, in declaration order.
    pub fn parameters_json(&self) -> serde_json::Value {
        self.parameters
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "annotation": p.annotation,
                    "default": p.default,
                })
            })
            .collect()
    }
}
