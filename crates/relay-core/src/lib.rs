//! relay-core
//!
//! リモートのタスクサービスと協調して task を実行するクライアント側の実行基盤。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, descriptor, inputs, version, records, payload）
//! - **ports**: 抽象化レイヤー（TaskService, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskService は開発・テスト用、HttpTaskService は本番用）
//! - **event_loop**: 同期コードから async を呼ぶためのループスレッド
//! - **client**: TaskService の同期ラッパー
//! - **future**: 実行結果を待つための Future
//! - **control**: task に渡す Control と handler（local / mock / remote）
//! - **task**: TaskDefinition, Session, TaskInstance, TaskRegistry
//! - **backend**: 実行 backend（local プール / remote）
//! - **runner**: サービスから起動されるプロセスの本体とマニフェスト
//! - **config**: 環境変数からの設定
//! - **error**: エラー型

pub mod backend;
pub mod client;
pub mod config;
pub mod control;
pub mod domain;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod impls;
pub mod ports;
pub mod runner;
pub mod task;

pub use backend::{ExecutionBackend, LocalBackend, RemoteBackend};
pub use client::ServiceClient;
pub use config::Settings;
pub use control::{Control, ControlHandler};
pub use domain::{InstanceId, SessionId, TaskInputs};
pub use error::{TaskError, TaskFailure};
pub use future::{FutureStatus, TaskFuture};
pub use runner::{RunReport, Runner, RunnerExit};
pub use task::{Session, TaskDefinition, TaskInstance, TaskRegistry, task};
