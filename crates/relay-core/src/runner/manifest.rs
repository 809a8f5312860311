//! Task manifest - collection ごとのタスク一覧（TOML）
//!
//! ```toml
//! [[collections]]
//! name = "math"
//!
//! [[collections.tasks]]
//! function_name = "add"
//! source_file = "tasks/math.rs"
//! decorated_function = "add"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub collections: Vec<CollectionManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// サービス上のタスクの識別名
    pub function_name: String,
    pub source_file: String,
    /// TaskRegistry に登録された symbol
    pub decorated_function: String,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, TaskError> {
        let text = fs::read_to_string(path).map_err(|e| {
            TaskError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
            .map_err(|e| TaskError::Manifest(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, TaskError> {
        toml::from_str(text).map_err(|e| TaskError::Manifest(e.to_string()))
    }

    /// 関数名でタスクを探す
    ///
    /// collection を指定しない場合、複数の collection に同じ関数名があると曖昧としてエラー。
    pub fn find_task(
        &self,
        collection: Option<&str>,
        function_name: &str,
    ) -> Result<&TaskEntry, TaskError> {
        if let Some(name) = collection {
            let collection = self
                .collections
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| TaskError::Manifest(format!("collection '{name}' is not in the manifest")))?;
            return collection
                .tasks
                .iter()
                .find(|t| t.function_name == function_name)
                .ok_or_else(|| {
                    TaskError::Manifest(format!(
                        "task '{function_name}' is not in collection '{name}'"
                    ))
                });
        }

        let mut matches = self
            .collections
            .iter()
            .flat_map(|c| c.tasks.iter().map(move |t| (c.name.as_str(), t)))
            .filter(|(_, t)| t.function_name == function_name);
        match (matches.next(), matches.next()) {
            (Some((_, entry)), None) => Ok(entry),
            (None, _) => Err(TaskError::Manifest(format!(
                "task '{function_name}' is not in the manifest"
            ))),
            (Some((first, _)), Some((second, _))) => Err(TaskError::Manifest(format!(
                "task '{function_name}' appears in collections '{first}' and '{second}'; \
                 set task.collection_name"
            ))),
        }
    }
}
