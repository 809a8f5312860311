//! ControlHandler - Control の操作をどこに流すかの strategy
//!
//! # 実装
//! - **LocalHandler**: tracing に出すだけ。失敗しない
//! - **MockHandler**: 標準出力に JSON 行で出す（手動テスト用）。失敗はログして握りつぶす
//! - **RemoteHandler**: サービスに転送する（`control::remote`）。失敗は呼び出し側に返す
//!
//! プロセス共有の current handler は `set_handler` で差し替える。
//! Control は構築時点の handler を保持するので、差し替えはその後に作られた
//! Control にだけ効く。

use std::io::Write;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, trace, warn};

use super::ControlScope;
use crate::domain::LogLevel;
use crate::error::TaskError;

/// ControlHandler は Control の 4 操作を受け取る
///
/// # Thread Safety
/// - ユーザー関数はワーカースレッドで動くので `Send + Sync` を要求
pub trait ControlHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn log(
        &self,
        scope: &ControlScope,
        level: LogLevel,
        message: &str,
        extra: &Map<String, Value>,
    ) -> Result<(), TaskError>;

    fn update_progress(
        &self,
        scope: &ControlScope,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), TaskError>;

    fn update_status(&self, scope: &ControlScope, status: &str) -> Result<(), TaskError>;

    fn request_stop(&self, scope: &ControlScope) -> Result<(), TaskError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHandler;

impl ControlHandler for LocalHandler {
    fn name(&self) -> &'static str {
        "local"
    }

    fn log(
        &self,
        scope: &ControlScope,
        level: LogLevel,
        message: &str,
        extra: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        let instance_id = scope.instance_id.as_str();
        let task = scope.task_name();
        let extra = if extra.is_empty() {
            String::new()
        } else {
            Value::Object(extra.clone()).to_string()
        };
        // tracing のレベルは静的に決まるので分岐する
        match level {
            LogLevel::Trace => trace!(instance_id, task, extra = extra.as_str(), "{message}"),
            LogLevel::Debug => debug!(instance_id, task, extra = extra.as_str(), "{message}"),
            LogLevel::Info => info!(instance_id, task, extra = extra.as_str(), "{message}"),
            LogLevel::Warning => warn!(instance_id, task, extra = extra.as_str(), "{message}"),
            LogLevel::Error => error!(instance_id, task, extra = extra.as_str(), "{message}"),
        }
        Ok(())
    }

    fn update_progress(
        &self,
        scope: &ControlScope,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), TaskError> {
        debug!(
            instance_id = scope.instance_id.as_str(),
            task = scope.task_name(),
            progress,
            status = status.unwrap_or_default(),
            "progress"
        );
        Ok(())
    }

    fn update_status(&self, scope: &ControlScope, status: &str) -> Result<(), TaskError> {
        debug!(
            instance_id = scope.instance_id.as_str(),
            task = scope.task_name(),
            status,
            "status"
        );
        Ok(())
    }

    fn request_stop(&self, scope: &ControlScope) -> Result<(), TaskError> {
        debug!(
            instance_id = scope.instance_id.as_str(),
            task = scope.task_name(),
            "stop requested"
        );
        Ok(())
    }
}

/// MockHandler は 1 操作 1 行の JSON を標準出力に書く
#[derive(Debug, Default, Clone, Copy)]
pub struct MockHandler;

impl MockHandler {
    /// 出力する行（テストから見えるように分けてある）
    pub fn render(scope: &ControlScope, event: &str, mut fields: Map<String, Value>) -> String {
        fields.insert("event".into(), json!(event));
        fields.insert("instance_id".into(), json!(scope.instance_id));
        fields.insert("task".into(), json!(scope.task_name()));
        fields.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        Value::Object(fields).to_string()
    }

    fn emit(&self, line: String) -> Result<(), TaskError> {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
            warn!(error = %e, "mock control handler could not write to stdout");
        }
        Ok(())
    }
}

impl ControlHandler for MockHandler {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn log(
        &self,
        scope: &ControlScope,
        level: LogLevel,
        message: &str,
        extra: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        let mut fields = Map::new();
        fields.insert("level".into(), json!(level));
        fields.insert("message".into(), json!(message));
        if !extra.is_empty() {
            fields.insert("extra".into(), Value::Object(extra.clone()));
        }
        self.emit(Self::render(scope, "log", fields))
    }

    fn update_progress(
        &self,
        scope: &ControlScope,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), TaskError> {
        let mut fields = Map::new();
        fields.insert("progress".into(), json!(progress));
        if let Some(status) = status {
            fields.insert("status".into(), json!(status));
        }
        self.emit(Self::render(scope, "progress", fields))
    }

    fn update_status(&self, scope: &ControlScope, status: &str) -> Result<(), TaskError> {
        let mut fields = Map::new();
        fields.insert("status".into(), json!(status));
        self.emit(Self::render(scope, "status", fields))
    }

    fn request_stop(&self, scope: &ControlScope) -> Result<(), TaskError> {
        self.emit(Self::render(scope, "stop", Map::new()))
    }
}

static CURRENT_HANDLER: RwLock<Option<Arc<dyn ControlHandler>>> = RwLock::new(None);

/// プロセス共有の handler を差し替える。`None` で LocalHandler に戻す
pub fn set_handler(handler: Option<Arc<dyn ControlHandler>>) {
    let mut current = CURRENT_HANDLER.write().unwrap_or_else(|e| e.into_inner());
    *current = handler;
}

/// 現在の handler（未設定なら LocalHandler）
pub fn current_handler() -> Arc<dyn ControlHandler> {
    CURRENT_HANDLER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(|| Arc::new(LocalHandler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::scope;

    #[test]
    fn local_handler_never_fails() {
        let s = scope("work");
        let h = LocalHandler;
        let mut extra = Map::new();
        extra.insert("rows".into(), json!(3));
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
        ] {
            assert!(h.log(&s, level, "msg", &extra).is_ok());
        }
        assert!(h.update_progress(&s, 10.0, Some("x")).is_ok());
        assert!(h.update_status(&s, "x").is_ok());
        assert!(h.request_stop(&s).is_ok());
    }

    #[test]
    fn mock_lines_are_structured_json() {
        let s = scope("work");
        let mut fields = Map::new();
        fields.insert("progress".into(), json!(25.0));
        let line = MockHandler::render(&s, "progress", fields);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "progress");
        assert_eq!(parsed["task"], "work");
        assert_eq!(parsed["instance_id"], s.instance_id.as_str());
        assert_eq!(parsed["progress"], 25.0);
    }

    #[test]
    fn mock_handler_swallows_output_errors() {
        let s = scope("work");
        assert!(MockHandler.update_status(&s, "ok").is_ok());
    }

    #[test]
    fn current_handler_defaults_to_local_and_can_be_swapped() {
        // グローバル状態を触るテストはこの 1 本にまとめる
        assert_eq!(current_handler().name(), "local");
        set_handler(Some(Arc::new(MockHandler)));
        assert_eq!(current_handler().name(), "mock");
        set_handler(None);
        assert_eq!(current_handler().name(), "local");
    }
}
