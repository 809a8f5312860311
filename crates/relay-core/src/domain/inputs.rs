//! Call arguments for a task: positional values plus keyword values, all JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::descriptor::Parameter;
use crate::error::TaskError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInputs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Interprets a JSON document fetched from the service: an object becomes
    /// keyword arguments, an array positional ones, `null` means no inputs.
    /// An object of exactly `{"args": [...], "kwargs": {...}}` is read as-is.
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Array(args) => Ok(Self::positional(args)),
            Value::Object(map) if is_envelope(&map) => serde_json::from_value(Value::Object(map))
                .map_err(|e| TaskError::Input(e.to_string())),
            Value::Object(kwargs) => Ok(Self {
                args: Vec::new(),
                kwargs,
            }),
            other => Err(TaskError::Input(format!(
                "inputs must be an object, an array or null, got {other}"
            ))),
        }
    }

    /// JSON document registered with the service for this call.
    pub fn to_value(&self) -> Value {
        if self.args.is_empty() {
            Value::Object(self.kwargs.clone())
        } else {
            serde_json::json!({ "args": self.args, "kwargs": self.kwargs })
        }
    }

    /// Binds the inputs to a parameter list, producing one value per name.
    ///
    /// Positional values fill parameters in declaration order, keywords fill
    /// by name and declared defaults fill whatever is left. With an empty
    /// parameter list the schema is open: keywords pass through unchanged and
    /// positional values are rejected.
    pub fn bind(&self, parameters: &[Parameter]) -> Result<Map<String, Value>, TaskError> {
        if parameters.is_empty() {
            if !self.args.is_empty() {
                return Err(TaskError::Input(format!(
                    "task declares no parameters but got {} positional argument(s)",
                    self.args.len()
                )));
            }
            return Ok(self.kwargs.clone());
        }

        if self.args.len() > parameters.len() {
            return Err(TaskError::Input(format!(
                "takes {} positional argument(s) but {} were given",
                parameters.len(),
                self.args.len()
            )));
        }

        let mut bound = Map::new();
        for (param, value) in parameters.iter().zip(&self.args) {
            bound.insert(param.name.clone(), value.clone());
        }

        for (name, value) in &self.kwargs {
            if !parameters.iter().any(|p| &p.name == name) {
                return Err(TaskError::Input(format!("unexpected keyword argument '{name}'")));
            }
            if bound.contains_key(name) {
                return Err(TaskError::Input(format!("multiple values for argument '{name}'")));
            }
            bound.insert(name.clone(), value.clone());
        }

        for param in parameters {
            if bound.contains_key(&param.name) {
                continue;
            }
            match param.default_value()? {
                Some(default) => {
                    bound.insert(param.name.clone(), default);
                }
                None => {
                    return Err(TaskError::Input(format!(
                        "missing required argument '{}'",
                        param.name
                    )));
                }
            }
        }

        Ok(bound)
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map.keys().all(|k| k == "args" || k == "kwargs")
        && map.get("args").is_none_or(Value::is_array)
        && map.get("kwargs").is_none_or(Value::is_object)
}
