//! Control - 実行中のタスクに渡されるコンテキスト
//!
//! progress / status / log を handler に転送し、協調的な停止フラグ
//! `should_stop` を持つ。TaskInstance が所有し、ユーザー関数には参照で渡る。
//!
//! # モジュール構成
//! - **handler**: ControlHandler trait と Local / Mock 実装、プロセス共有の current handler
//! - **remote**: サービスに転送する RemoteHandler

pub mod handler;
pub mod remote;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::domain::{InstanceId, LogLevel, SessionId, TaskDescriptor};
use crate::error::TaskError;

pub use handler::{ControlHandler, LocalHandler, MockHandler, current_handler, set_handler};
pub use remote::RemoteHandler;

/// ControlScope は handler が転送先を決めるための識別情報
#[derive(Debug, Clone)]
pub struct ControlScope {
    pub instance_id: InstanceId,
    /// 直接呼び出しでは None
    pub session_id: Option<SessionId>,
    pub task: Arc<TaskDescriptor>,
}

impl ControlScope {
    pub fn task_name(&self) -> &str {
        &self.task.name
    }
}

struct Inner {
    scope: ControlScope,
    should_stop: AtomicBool,
    /// f64 のビット列
    progress: AtomicU64,
    status: Mutex<String>,
    handler: Arc<dyn ControlHandler>,
}

/// Control は 1 つの TaskInstance に紐付く
///
/// `Clone` は同じ Control を共有する（停止フラグも共有）。
///
/// # 使用例
/// ```ignore
/// fn countdown(tc: &Control, args: Args) -> Result<String, Infallible> {
///     for i in 0..args.steps {
///         if tc.should_stop() {
///             return Ok("stopped".into());
///         }
///         tc.update_progress(i as f64 * 100.0 / args.steps as f64, None)?;
///     }
///     Ok("done".into())
/// }
/// ```
#[derive(Clone)]
pub struct Control {
    inner: Arc<Inner>,
}

impl Control {
    pub fn new(scope: ControlScope, handler: Arc<dyn ControlHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                should_stop: AtomicBool::new(false),
                progress: AtomicU64::new(0f64.to_bits()),
                status: Mutex::new(String::new()),
                handler,
            }),
        }
    }

    pub fn scope(&self) -> &ControlScope {
        &self.inner.scope
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.scope.instance_id
    }

    pub fn task_name(&self) -> &str {
        self.inner.scope.task_name()
    }

    pub fn handler(&self) -> &Arc<dyn ControlHandler> {
        &self.inner.handler
    }

    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.inner.progress.load(Ordering::Acquire))
    }

    pub fn status(&self) -> String {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), TaskError> {
        self.log_with(level, message, Map::new())
    }

    pub fn log_with(
        &self,
        level: LogLevel,
        message: &str,
        extra: Map<String, Value>,
    ) -> Result<(), TaskError> {
        self.inner
            .handler
            .log(&self.inner.scope, level, message, &extra)
    }

    pub fn info(&self, message: &str) -> Result<(), TaskError> {
        self.log(LogLevel::Info, message)
    }

    /// progress は [0, 100] を想定するがクランプはしない
    pub fn update_progress(&self, progress: f64, status: Option<&str>) -> Result<(), TaskError> {
        self.inner
            .progress
            .store(progress.to_bits(), Ordering::Release);
        if let Some(status) = status {
            self.set_status(status);
        }
        self.inner
            .handler
            .update_progress(&self.inner.scope, progress, status)
    }

    pub fn update_status(&self, status: &str) -> Result<(), TaskError> {
        self.set_status(status);
        self.inner.handler.update_status(&self.inner.scope, status)
    }

    /// `should_stop` を立てる（false に戻す手段はない）
    ///
    /// handler への通知は最初の 1 回だけ。
    pub fn request_stop(&self) -> Result<(), TaskError> {
        if self.inner.should_stop.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.handler.request_stop(&self.inner.scope)
    }

    fn set_status(&self, status: &str) {
        let mut current = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
        current.clear();
        current.push_str(status);
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("instance_id", self.instance_id())
            .field("task", &self.task_name())
            .field("handler", &self.inner.handler.name())
            .field("should_stop", &self.should_stop())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! テスト用の記録する handler

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Log(LogLevel, String),
        Progress(f64, Option<String>),
        Status(String),
        Stop,
    }

    #[derive(Default)]
    pub struct RecordingHandler {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingHandler {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ControlHandler for RecordingHandler {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn log(
            &self,
            _scope: &ControlScope,
            level: LogLevel,
            message: &str,
            _extra: &Map<String, Value>,
        ) -> Result<(), TaskError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Log(level, message.to_string()));
            Ok(())
        }

        fn update_progress(
            &self,
            _scope: &ControlScope,
            progress: f64,
            status: Option<&str>,
        ) -> Result<(), TaskError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Progress(progress, status.map(str::to_string)));
            Ok(())
        }

        fn update_status(&self, _scope: &ControlScope, status: &str) -> Result<(), TaskError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Status(status.to_string()));
            Ok(())
        }

        fn request_stop(&self, _scope: &ControlScope) -> Result<(), TaskError> {
            self.calls.lock().unwrap().push(Call::Stop);
            Ok(())
        }
    }

    pub fn descriptor(name: &str) -> Arc<TaskDescriptor> {
        Arc::new(TaskDescriptor {
            name: name.to_string(),
            version: "1".to_string(),
            function_name: name.to_string(),
            module: "tests".to_string(),
            doc: None,
            parameters: Vec::new(),
            max_parallel: 1,
            size: Default::default(),
            expects_control: true,
        })
    }

    pub fn scope(name: &str) -> ControlScope {
        ControlScope {
            instance_id: InstanceId::compose("session-t", name, 1),
            session_id: Some(SessionId::from_string("session-t")),
            task: descriptor(name),
        }
    }
}
