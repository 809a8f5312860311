//! Task - 定義・Session・instance の同期 API
//!
//! # モジュール構成
//! - **definition**: TaskDefinition と builder、直接呼び出し
//! - **session**: スレッドごとの現在の Session と instance の索引
//! - **instance**: 1 回の実行（上限確認、backend への依頼、停止）
//! - **registry**: runner が symbol から定義を引くための表

pub mod definition;
pub mod instance;
pub mod registry;
pub mod session;

pub use definition::{TaskBuilder, TaskDefinition, TaskFn, task};
pub use instance::{InstanceStatus, TaskInstance};
pub use registry::{RegistryError, TaskRegistry};
pub use session::{Session, SessionBuilder, SessionGuard};
