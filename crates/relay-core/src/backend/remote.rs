//! RemoteBackend - 計算はローカル、調整はサービスで行う backend
//!
//! # 動作
//! 1. task 定義と instance を upsert（RemoteHandler のキャッシュ経由で 1 回だけ）
//! 2. `start_execution` で execution を作る。稼働中のものがあれば conflict
//!    （`force` なら既存を kill して作り直す）
//! 3. ユーザー関数は内部の LocalBackend で動かす
//! 4. 終わったら `complete_execution` / `fail_execution` を送る
//!
//! runner として起動されたプロセス（`task.instance_id` あり）では、引数は
//! サービスから取得したもので置き換え、結果は instance の outcome としても報告する。

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, error, warn};

use super::{ExecutionBackend, ExecutionRequest, LocalBackend};
use crate::client::ServiceClient;
use crate::config::{DEFAULT_LOCAL_WORKERS, Settings};
use crate::control::{ControlHandler, RemoteHandler};
use crate::domain::{ClientId, ExecutionId, InstanceId, SessionId, TaskInputs, TaskOutcome};
use crate::error::{TaskError, TaskFailure};

type Executions = Arc<Mutex<HashMap<InstanceId, (ExecutionId, SessionId)>>>;

fn lock_executions(
    executions: &Executions,
) -> MutexGuard<'_, HashMap<InstanceId, (ExecutionId, SessionId)>> {
    executions.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct RemoteBackend {
    client: ServiceClient,
    handler: Arc<RemoteHandler>,
    local: LocalBackend,
    client_id: ClientId,
    runner_instance: Option<InstanceId>,
    force_start: bool,
    executions: Executions,
    sessions: Mutex<HashSet<SessionId>>,
}

impl RemoteBackend {
    pub fn new(handler: Arc<RemoteHandler>, workers: usize) -> Result<Self, TaskError> {
        Ok(Self {
            client: handler.client().clone(),
            handler,
            local: LocalBackend::new(workers)?,
            client_id: ClientId::from_ulid(ulid::Ulid::new()),
            runner_instance: None,
            force_start: false,
            executions: Arc::new(Mutex::new(HashMap::new())),
            sessions: Mutex::new(HashSet::new()),
        })
    }

    /// 設定から作る。資格情報がない、またはサービスに届かなければ失敗
    pub fn from_settings(settings: &Settings) -> Result<Self, TaskError> {
        let handler = RemoteHandler::from_settings(&settings.service)?;
        let workers = if settings.task.local_workers == 0 {
            DEFAULT_LOCAL_WORKERS
        } else {
            settings.task.local_workers
        };
        Ok(Self::new(Arc::new(handler), workers)?
            .with_force_start(settings.task.force_start)
            .with_runner_instance(settings.task.instance_id.as_deref().map(InstanceId::from)))
    }

    /// すべての start を `force=true` で行う
    pub fn with_force_start(mut self, force_start: bool) -> Self {
        self.force_start = force_start;
        self
    }

    /// runner モード: 入力の取得と outcome の報告をこの instance に対して行う
    pub fn with_runner_instance(mut self, instance_id: Option<InstanceId>) -> Self {
        self.runner_instance = instance_id;
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn handler(&self) -> &Arc<RemoteHandler> {
        &self.handler
    }

    /// instance に紐付いている稼働中の execution
    pub fn execution_of(&self, instance_id: &InstanceId) -> Option<ExecutionId> {
        lock_executions(&self.executions)
            .get(instance_id)
            .map(|(execution_id, _)| execution_id.clone())
    }
}

impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn execute(&self, request: ExecutionRequest) -> Result<(), TaskError> {
        let scope = request.control.scope().clone();
        // runner モードではサービス側の入力が正。ローカルの引数で上書きしない
        let registered_inputs = match &self.runner_instance {
            Some(_) => None,
            None => Some(request.inputs.to_value()),
        };
        self.handler.register(&scope, registered_inputs)?;

        let force = request.force || self.force_start;
        let execution = self.client.start_execution(
            &request.instance_id,
            &request.session_id,
            &self.client_id,
            force,
        )?;
        debug!(
            execution_id = %execution.id,
            instance_id = %request.instance_id,
            force,
            "execution started"
        );

        let instance_id = request.instance_id.clone();
        let session_id = request.session_id.clone();
        self.handler.bind_execution(&instance_id, &execution.id);
        lock_executions(&self.executions).insert(
            instance_id.clone(),
            (execution.id.clone(), session_id.clone()),
        );
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.clone());

        let target = request.target;
        let client = self.client.clone();
        let handler = self.handler.clone();
        let executions = self.executions.clone();
        let runner_instance = self.runner_instance.clone();
        let execution_id = execution.id.clone();
        let wrapped_instance = instance_id.clone();

        let wrapped = Box::new(move |inputs: TaskInputs| {
            let inputs = match &runner_instance {
                Some(runner_id) => fetch_inputs(&client, runner_id),
                None => Ok(inputs),
            };
            // panic しても execution の記録と unbind は必ず行う
            let outcome = inputs.and_then(|inputs| {
                panic::catch_unwind(AssertUnwindSafe(move || target(inputs))).unwrap_or_else(
                    |payload| {
                        warn!(execution_id = %execution_id, "task panicked");
                        Err(TaskFailure::new("Panic", panic_message(payload.as_ref())).into())
                    },
                )
            });

            let reported = match &outcome {
                Ok(value) => client
                    .complete_execution(&execution_id, value.clone())
                    .map(|_| ()),
                Err(e) => client
                    .fail_execution(&execution_id, &e.to_string())
                    .map(|_| ()),
            };
            if let Err(e) = reported {
                warn!(execution_id = %execution_id, error = %e, "failed to record execution result");
            }

            if let Some(runner_id) = &runner_instance {
                let task_outcome = match &outcome {
                    Ok(value) => TaskOutcome::completed(value.clone()),
                    Err(e) => TaskOutcome::failed(e.to_failure()),
                };
                if let Err(e) = client.report_task_outcome(runner_id, task_outcome) {
                    error!(instance_id = %runner_id, error = %e, "failed to report outcome");
                }
            }

            handler.unbind_execution(&wrapped_instance);
            lock_executions(&executions).remove(&wrapped_instance);
            outcome
        });

        let local_request = ExecutionRequest {
            instance_id: request.instance_id,
            session_id: request.session_id,
            task: request.task,
            control: request.control,
            inputs: request.inputs,
            future: request.future,
            force,
            target: wrapped,
        };
        if let Err(e) = self.local.execute(local_request) {
            if let Err(stop_error) =
                self.client
                    .force_stop_execution(&execution.id, &session_id, "local dispatch failed")
            {
                warn!(execution_id = %execution.id, error = %stop_error, "failed to stop execution");
            }
            self.handler.unbind_execution(&instance_id);
            lock_executions(&self.executions).remove(&instance_id);
            return Err(e);
        }
        Ok(())
    }

    fn cancel_instance(&self, instance_id: &InstanceId, session_id: Option<&SessionId>) -> bool {
        let found_locally = self.local.cancel_instance(instance_id, session_id);

        let active = lock_executions(&self.executions).get(instance_id).cloned();
        let Some((execution_id, owner)) = active else {
            return found_locally;
        };
        let session = session_id.unwrap_or(&owner);
        match self
            .client
            .force_stop_execution(&execution_id, session, "stopped by client")
        {
            Ok(record) => {
                debug!(execution_id = %execution_id, status = %record.status, "execution force-stopped");
            }
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "force stop failed");
            }
        }
        true
    }

    fn start(&self) -> Result<(), TaskError> {
        self.local.start()
    }

    fn shutdown(&self, wait: bool) {
        self.local.shutdown(wait);
        let sessions: Vec<SessionId> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for session_id in sessions {
            match self.client.disconnect_client(&self.client_id, &session_id) {
                Ok(0) => {}
                Ok(killed) => {
                    debug!(session_id = %session_id, killed, "client disconnected");
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "disconnect failed");
                }
            }
        }
    }

    fn control_handler(&self) -> Option<Arc<dyn ControlHandler>> {
        let handler: Arc<dyn ControlHandler> = self.handler.clone();
        Some(handler)
    }
}

/// サービスに登録された入力を取得する。未登録なら空の入力
fn fetch_inputs(client: &ServiceClient, instance_id: &InstanceId) -> Result<TaskInputs, TaskError> {
    match client.fetch_task_inputs(instance_id)? {
        Some(value) => TaskInputs::from_value(value),
        None => Ok(TaskInputs::new()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// `execute` に渡す前に conflict を調べたい呼び出し側のためのヘルパー
pub fn active_execution(
    client: &ServiceClient,
    instance_id: &InstanceId,
) -> Result<Option<ExecutionId>, TaskError> {
    client.check_execution_conflict(instance_id)
}
