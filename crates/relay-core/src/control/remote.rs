//! RemoteHandler - Control の操作をタスクサービスに転送する handler
//!
//! # 動作
//! - 構築時に ping し、届かなければ失敗する（LocalHandler に黙って落とさない）
//! - 最初の操作の前に task 定義（`(name, version)`）と instance を upsert する。
//!   登録済みのものはキャッシュして再送しない
//! - execution が紐付いている instance の progress は `report_progress`、
//!   それ以外は `update_instance_progress` に流す
//! - 失敗は呼び出し側（ユーザー関数）に返す

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use super::{ControlHandler, ControlScope};
use crate::client::ServiceClient;
use crate::config::ServiceSettings;
use crate::domain::{
    ExecutionId, InstanceId, InstanceRegistration, LogLevel, LogRecord, SessionId,
    TaskRegistration,
};
use crate::error::TaskError;
use crate::impls::HttpTaskService;

pub struct RemoteHandler {
    client: ServiceClient,
    /// session を持たない Control（直接呼び出し）用
    fallback_session: SessionId,
    registered_tasks: Mutex<HashSet<(String, String)>>,
    registered_instances: Mutex<HashSet<InstanceId>>,
    executions: Mutex<HashMap<InstanceId, ExecutionId>>,
}

impl RemoteHandler {
    /// サービスに ping して到達できれば handler を作る
    pub fn connect(client: ServiceClient) -> Result<Self, TaskError> {
        client
            .ping()
            .map_err(|e| TaskError::backend(format!("remote service is unreachable: {e}")))?;
        Ok(Self {
            client,
            fallback_session: SessionId::from_ulid(ulid::Ulid::new()),
            registered_tasks: Mutex::new(HashSet::new()),
            registered_instances: Mutex::new(HashSet::new()),
            executions: Mutex::new(HashMap::new()),
        })
    }

    /// 設定から HTTP クライアントを作って接続する。資格情報がなければ失敗
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self, TaskError> {
        let service = HttpTaskService::from_settings(settings)?;
        Self::connect(ServiceClient::shared(Arc::new(service)))
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// task 定義と instance を登録する（登録済みなら何もしない）
    ///
    /// `inputs` は instance の初回登録時にだけ送られる。
    pub fn register(&self, scope: &ControlScope, inputs: Option<Value>) -> Result<(), TaskError> {
        let task_key = (scope.task.name.clone(), scope.task.version.clone());
        let task_known = self
            .registered_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&task_key);
        if !task_known {
            self.client
                .upsert_task(TaskRegistration::from_descriptor(&scope.task))?;
            debug!(task = %task_key.0, version = %task_key.1, "task registered");
            self.registered_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task_key);
        }

        let instance_known = self
            .registered_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&scope.instance_id);
        if !instance_known {
            self.client.upsert_instance(InstanceRegistration {
                instance_id: scope.instance_id.clone(),
                session_id: self.session_of(scope),
                task_name: scope.task.name.clone(),
                task_version: scope.task.version.clone(),
                inputs,
            })?;
            debug!(instance_id = %scope.instance_id, "instance registered");
            self.registered_instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(scope.instance_id.clone());
        }
        Ok(())
    }

    /// 以後この instance の progress を execution に流す
    pub fn bind_execution(&self, instance_id: &InstanceId, execution_id: &ExecutionId) {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id.clone(), execution_id.clone());
    }

    pub fn unbind_execution(&self, instance_id: &InstanceId) -> Option<ExecutionId> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id)
    }

    pub fn bound_execution(&self, instance_id: &InstanceId) -> Option<ExecutionId> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .cloned()
    }

    /// scope の session → instance id の session 部分 → fallback の順
    pub fn session_of(&self, scope: &ControlScope) -> SessionId {
        scope
            .session_id
            .clone()
            .or_else(|| scope.instance_id.session_part().map(SessionId::from))
            .unwrap_or_else(|| self.fallback_session.clone())
    }
}

impl ControlHandler for RemoteHandler {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn log(
        &self,
        scope: &ControlScope,
        level: LogLevel,
        message: &str,
        extra: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        self.register(scope, None)?;
        self.client.append_log(
            &scope.instance_id,
            LogRecord {
                level,
                message: message.to_string(),
                extra: extra.clone(),
                logged_at: Utc::now(),
            },
        )
    }

    fn update_progress(
        &self,
        scope: &ControlScope,
        progress: f64,
        status: Option<&str>,
    ) -> Result<(), TaskError> {
        self.register(scope, None)?;
        match self.bound_execution(&scope.instance_id) {
            Some(execution_id) => self.client.report_progress(&execution_id, progress, status),
            None => self
                .client
                .update_instance_progress(&scope.instance_id, Some(progress), status),
        }
    }

    fn update_status(&self, scope: &ControlScope, status: &str) -> Result<(), TaskError> {
        self.register(scope, None)?;
        self.client
            .update_instance_progress(&scope.instance_id, None, Some(status))
    }

    fn request_stop(&self, scope: &ControlScope) -> Result<(), TaskError> {
        // execution の kill は backend の cancel_instance が行う
        debug!(instance_id = %scope.instance_id, "stop requested");
        Ok(())
    }
}
