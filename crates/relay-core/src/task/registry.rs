//! TaskRegistry - decorated symbol → TaskDefinition
//!
//! runner はマニフェストの `decorated_function` をここで引く
//! （Rust では実行時にソースファイルを import できないので、バイナリに登録しておく）。
//!
//! # 学習ポイント
//! - HashMap での所有と `Clone` な定義の受け渡し
//! - thiserror の enum を crate 全体のエラーに `From` で流す

use std::collections::HashMap;

use super::definition::TaskDefinition;
use crate::error::TaskError;

/// RegistryError は TaskRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("task symbol '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no task registered under symbol '{0}'")]
    NotRegistered(String),
}

impl From<RegistryError> for TaskError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(_) => TaskError::Definition(err.to_string()),
            RegistryError::NotRegistered(_) => TaskError::Manifest(err.to_string()),
        }
    }
}

/// TaskRegistry は TaskDefinition を symbol で管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register_task(add)?;                  // symbol = function_name
/// registry.register("tasks::add_v2", add_v2)?;   // symbol を明示
///
/// let add = registry.resolve("add")?;
/// ```
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDefinition>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        symbol: impl Into<String>,
        definition: TaskDefinition,
    ) -> Result<(), RegistryError> {
        let symbol = symbol.into();
        if self.tasks.contains_key(&symbol) {
            return Err(RegistryError::AlreadyRegistered(symbol));
        }
        self.tasks.insert(symbol, definition);
        Ok(())
    }

    /// 関数名を symbol として登録する
    pub fn register_task(&mut self, definition: TaskDefinition) -> Result<(), RegistryError> {
        let symbol = definition.descriptor().function_name.clone();
        self.register(symbol, definition)
    }

    pub fn get(&self, symbol: &str) -> Option<&TaskDefinition> {
        self.tasks.get(symbol)
    }

    pub fn resolve(&self, symbol: &str) -> Result<&TaskDefinition, RegistryError> {
        self.get(symbol)
            .ok_or_else(|| RegistryError::NotRegistered(symbol.to_string()))
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tasks.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
