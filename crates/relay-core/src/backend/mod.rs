//! ExecutionBackend - ラップされたタスク関数を実際に動かす層
//!
//! # 実装
//! - **LocalBackend**: プロセス内のワーカープール
//! - **RemoteBackend**: 計算はローカル、入力・進捗・結果・conflict はサービス経由
//!
//! # backend の選び方（TaskInstance 構築時）
//! 1. Session に注入された backend
//! 2. `set_default_backend` で設定されたもの
//! 3. 設定 `task.backend`（`local` / `remote`）から作った共有 backend
//! 4. 共有の LocalBackend

pub mod local;
pub mod remote;

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::config::{BackendKind, Settings};
use crate::control::{Control, ControlHandler};
use crate::domain::{InstanceId, SessionId, TaskDescriptor, TaskInputs};
use crate::error::TaskError;
use crate::future::TaskFuture;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// backend が呼ぶ関数。Control の注入と引数の束縛は済んでいる
pub type Target = Box<dyn FnOnce(TaskInputs) -> Result<Value, TaskError> + Send + 'static>;

/// 1 回の start に対する実行依頼
pub struct ExecutionRequest {
    pub instance_id: InstanceId,
    pub session_id: SessionId,
    pub task: Arc<TaskDescriptor>,
    pub control: Control,
    pub inputs: TaskInputs,
    pub future: TaskFuture<Value>,
    /// 既存の execution を kill してでも始める（RemoteBackend のみ意味を持つ）
    pub force: bool,
    pub target: Target,
}

/// ExecutionBackend はタスクの実行と future の更新を担う
///
/// # Thread Safety
/// - 複数の Session / スレッドから共有されるので `Send + Sync`
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `request.target` を実行するよう手配し、終わったら `request.future` を更新する
    ///
    /// 同期的なエラー（shutdown 済み、conflict など）は `Err` で返す。
    fn execute(&self, request: ExecutionRequest) -> Result<(), TaskError>;

    /// ベストエフォートのキャンセル。該当する instance があれば true
    fn cancel_instance(&self, instance_id: &InstanceId, session_id: Option<&SessionId>) -> bool;

    fn start(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn shutdown(&self, wait: bool);

    /// この backend で動く Control に使ってほしい handler
    fn control_handler(&self) -> Option<Arc<dyn ControlHandler>> {
        None
    }
}

static DEFAULT_BACKEND: RwLock<Option<Arc<dyn ExecutionBackend>>> = RwLock::new(None);
static CONFIGURED_BACKEND: Mutex<Option<Arc<dyn ExecutionBackend>>> = Mutex::new(None);

/// 以後作られる TaskInstance の backend を固定する。`None` で設定に戻す
pub fn set_default_backend(backend: Option<Arc<dyn ExecutionBackend>>) {
    let mut current = DEFAULT_BACKEND.write().unwrap_or_else(|e| e.into_inner());
    *current = backend;
}

/// Session の上書きがないときに使う backend
pub fn default_backend() -> Result<Arc<dyn ExecutionBackend>, TaskError> {
    if let Some(backend) = DEFAULT_BACKEND
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
    {
        return Ok(backend);
    }

    let mut configured = CONFIGURED_BACKEND.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(backend) = configured.as_ref() {
        return Ok(backend.clone());
    }
    let backend = backend_from_settings(&Settings::from_env()?)?;
    debug!(backend = backend.name(), "default backend created from settings");
    *configured = Some(backend.clone());
    Ok(backend)
}

pub fn backend_from_settings(settings: &Settings) -> Result<Arc<dyn ExecutionBackend>, TaskError> {
    match settings.task.backend {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(settings.task.local_workers)?)),
        BackendKind::Remote => Ok(Arc::new(RemoteBackend::from_settings(settings)?)),
    }
}
