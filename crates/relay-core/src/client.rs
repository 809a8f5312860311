//! ServiceClient - TaskService の同期ラッパー
//!
//! すべての呼び出しは EventLoopThread 経由でループスレッド上の async 操作として
//! 実行され、呼び出し側のスレッドは結果が返るまでブロックする。
//! RemoteHandler / RemoteBackend / runner はこの型だけを使う。

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{
    ClientId, ExecutionId, ExecutionRecord, ExecutionUpdate, InstanceId, InstanceRecord,
    InstanceRegistration, InstanceUpdate, LogRecord, SessionId, TaskOutcome, TaskRecord,
    TaskRegistration,
};
use crate::error::TaskError;
use crate::event_loop::EventLoopThread;
use crate::ports::{Subscription, TaskService};

#[derive(Clone)]
pub struct ServiceClient {
    service: Arc<dyn TaskService>,
    bridge: Arc<EventLoopThread>,
}

impl ServiceClient {
    pub fn new(service: Arc<dyn TaskService>, bridge: Arc<EventLoopThread>) -> Self {
        Self { service, bridge }
    }

    /// プロセス共有のブリッジを使う
    pub fn shared(service: Arc<dyn TaskService>) -> Self {
        Self::new(service, EventLoopThread::shared())
    }

    pub fn service(&self) -> &Arc<dyn TaskService> {
        &self.service
    }

    pub fn ping(&self) -> Result<(), TaskError> {
        let svc = self.service.clone();
        self.bridge.call(async move { svc.ping().await })
    }

    pub fn upsert_task(&self, registration: TaskRegistration) -> Result<TaskRecord, TaskError> {
        let svc = self.service.clone();
        self.bridge
            .call(async move { svc.upsert_task(registration).await })
    }

    pub fn upsert_instance(
        &self,
        registration: InstanceRegistration,
    ) -> Result<InstanceRecord, TaskError> {
        let svc = self.service.clone();
        self.bridge
            .call(async move { svc.upsert_instance(registration).await })
    }

    pub fn start_execution(
        &self,
        instance_id: &InstanceId,
        session_id: &SessionId,
        client_id: &ClientId,
        force: bool,
    ) -> Result<ExecutionRecord, TaskError> {
        let svc = self.service.clone();
        let (instance_id, session_id, client_id) =
            (instance_id.clone(), session_id.clone(), client_id.clone());
        self.bridge.call(async move {
            svc.start_execution(&instance_id, &session_id, &client_id, force)
                .await
        })
    }

    pub fn check_execution_conflict(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<ExecutionId>, TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.check_execution_conflict(&instance_id).await })
    }

    pub fn force_stop_execution(
        &self,
        execution_id: &ExecutionId,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        let svc = self.service.clone();
        let (execution_id, session_id, reason) =
            (execution_id.clone(), session_id.clone(), reason.to_string());
        self.bridge.call(async move {
            svc.force_stop_execution(&execution_id, &session_id, &reason)
                .await
        })
    }

    pub fn report_progress(
        &self,
        execution_id: &ExecutionId,
        progress: f64,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let svc = self.service.clone();
        let execution_id = execution_id.clone();
        let status_message = status_message.map(str::to_string);
        self.bridge.call(async move {
            svc.report_progress(&execution_id, progress, status_message.as_deref())
                .await
        })
    }

    pub fn complete_execution(
        &self,
        execution_id: &ExecutionId,
        result: Value,
    ) -> Result<ExecutionRecord, TaskError> {
        let svc = self.service.clone();
        let execution_id = execution_id.clone();
        self.bridge
            .call(async move { svc.complete_execution(&execution_id, result).await })
    }

    pub fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        error: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        let svc = self.service.clone();
        let (execution_id, error) = (execution_id.clone(), error.to_string());
        self.bridge
            .call(async move { svc.fail_execution(&execution_id, &error).await })
    }

    pub fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, TaskError> {
        let svc = self.service.clone();
        let execution_id = execution_id.clone();
        self.bridge
            .call(async move { svc.get_execution(&execution_id).await })
    }

    pub fn validate_session_ownership(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
    ) -> Result<bool, TaskError> {
        let svc = self.service.clone();
        let (session_id, instance_id) = (session_id.clone(), instance_id.clone());
        self.bridge.call(async move {
            svc.validate_session_ownership(&session_id, &instance_id)
                .await
        })
    }

    pub fn disconnect_client(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
    ) -> Result<usize, TaskError> {
        let svc = self.service.clone();
        let (client_id, session_id) = (client_id.clone(), session_id.clone());
        self.bridge
            .call(async move { svc.disconnect_client(&client_id, &session_id).await })
    }

    pub fn fetch_task_inputs(&self, instance_id: &InstanceId) -> Result<Option<Value>, TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.fetch_task_inputs(&instance_id).await })
    }

    pub fn report_task_outcome(
        &self,
        instance_id: &InstanceId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.report_task_outcome(&instance_id, outcome).await })
    }

    pub fn append_log(&self, instance_id: &InstanceId, record: LogRecord) -> Result<(), TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.append_log(&instance_id, record).await })
    }

    pub fn update_instance_progress(
        &self,
        instance_id: &InstanceId,
        progress: Option<f64>,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        let status_message = status_message.map(str::to_string);
        self.bridge.call(async move {
            svc.update_instance_progress(&instance_id, progress, status_message.as_deref())
                .await
        })
    }

    pub fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>, TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.get_instance(&instance_id).await })
    }

    /// 返った Subscription は同期的にイテレートできる
    pub fn subscribe_to_execution_updates(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Subscription<ExecutionUpdate>, TaskError> {
        let svc = self.service.clone();
        let execution_id = execution_id.clone();
        self.bridge
            .call(async move { svc.execution_updates(&execution_id).await })
    }

    pub fn subscribe_to_instance_updates(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Subscription<InstanceUpdate>, TaskError> {
        let svc = self.service.clone();
        let instance_id = instance_id.clone();
        self.bridge
            .call(async move { svc.instance_updates(&instance_id).await })
    }
}
