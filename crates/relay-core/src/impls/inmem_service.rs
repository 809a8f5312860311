//! InMemoryTaskService - 開発・テスト用のプロセス内タスクサービス
//!
//! # 学習ポイント
//! - Mutex で守った HashMap 群による状態機械（await 中はロックを持たない）
//! - `tokio::sync::broadcast` で更新を配り、購読ごとに mpsc へ転送
//! - conflict / force-start / ownership のセマンティクスはここで決まる
//!
//! # 状態
//! - tasks: `(name, version)` → TaskRecord
//! - instances: instance id → InstanceRecord
//! - executions: execution id → ExecutionRecord
//! - active: instance id → running の execution id（instance ごとに高々 1 つ）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use ulid::Ulid;

use crate::domain::{
    ClientId, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionUpdate, InstanceId,
    InstanceRecord, InstanceRegistration, InstanceUpdate, LogRecord, SessionId, TaskOutcome,
    TaskRecord, TaskRegistration,
};
use crate::error::TaskError;
use crate::ports::{Clock, IdGenerator, Subscription, SystemClock, TaskService, UlidGenerator};

const UPDATE_BUFFER: usize = 64;

#[derive(Default)]
struct State {
    tasks: HashMap<(String, String), TaskRecord>,
    instances: HashMap<InstanceId, InstanceRecord>,
    executions: HashMap<ExecutionId, ExecutionRecord>,
    active: HashMap<InstanceId, ExecutionId>,
}

impl State {
    fn instance(&self, instance_id: &InstanceId) -> Result<&InstanceRecord, TaskError> {
        self.instances
            .get(instance_id)
            .ok_or_else(|| TaskError::NotFound(format!("instance {instance_id}")))
    }

    fn instance_mut(&mut self, instance_id: &InstanceId) -> Result<&mut InstanceRecord, TaskError> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| TaskError::NotFound(format!("instance {instance_id}")))
    }

    fn execution_mut(
        &mut self,
        execution_id: &ExecutionId,
    ) -> Result<&mut ExecutionRecord, TaskError> {
        self.executions
            .get_mut(execution_id)
            .ok_or_else(|| TaskError::NotFound(format!("execution {execution_id}")))
    }

    /// running の execution を終端状態にして active から外す
    fn finish(
        &mut self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        now: chrono::DateTime<chrono::Utc>,
        apply: impl FnOnce(&mut ExecutionRecord),
    ) -> Result<ExecutionRecord, TaskError> {
        let record = self.execution_mut(execution_id)?;
        if record.status.is_terminal() {
            return Err(TaskError::backend(format!(
                "execution {execution_id} is already {}",
                record.status
            )));
        }
        record.status = status;
        record.completed_at = Some(now);
        apply(record);
        let record = record.clone();
        if self.active.get(&record.instance_id) == Some(execution_id) {
            self.active.remove(&record.instance_id);
        }
        Ok(record)
    }
}

/// InMemoryTaskService は TaskService の完全な in-process 実装
///
/// # 使用例
/// ```ignore
/// let service = Arc::new(InMemoryTaskService::new());
/// let client = ServiceClient::shared(service.clone());
/// ```
pub struct InMemoryTaskService {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    reachable: AtomicBool,
    execution_tx: broadcast::Sender<ExecutionUpdate>,
    instance_tx: broadcast::Sender<InstanceUpdate>,
}

impl InMemoryTaskService {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (execution_tx, _) = broadcast::channel(UPDATE_BUFFER);
        let (instance_tx, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            state: Mutex::new(State::default()),
            ids: UlidGenerator::new(clock.clone()),
            clock,
            reachable: AtomicBool::new(true),
            execution_tx,
            instance_tx,
        }
    }

    /// false にするとすべての操作が BackendError になる（接続断のシミュレーション）
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn executions_of(&self, instance_id: &InstanceId) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = self
            .lock()
            .executions
            .values()
            .filter(|e| &e.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        records
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<(), TaskError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TaskError::backend("connection refused"))
        }
    }

    fn publish_execution(&self, record: &ExecutionRecord) {
        // 購読者がいなくてもエラーにしない
        let _ = self.execution_tx.send(ExecutionUpdate::from(record));
    }

    fn publish_instance(&self, record: &InstanceRecord) {
        let _ = self.instance_tx.send(InstanceUpdate::from(record));
    }
}

impl Default for InMemoryTaskService {
    fn default() -> Self {
        Self::new()
    }
}

fn check_owner(
    record_session: &SessionId,
    session_id: &SessionId,
    instance_id: &InstanceId,
) -> Result<(), TaskError> {
    if record_session != session_id {
        return Err(TaskError::SessionOwnership {
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl TaskService for InMemoryTaskService {
    async fn ping(&self) -> Result<(), TaskError> {
        self.check_reachable()
    }

    async fn upsert_task(&self, registration: TaskRegistration) -> Result<TaskRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let key = (registration.name.clone(), registration.version.clone());
        let record = state.tasks.entry(key).or_insert_with(|| TaskRecord {
            id: format!("task-{}", Ulid::new()),
            name: registration.name,
            version: registration.version,
            function_name: registration.function_name,
            module: registration.module,
            parameters: registration.parameters.unwrap_or(Value::Null),
            metadata: registration.metadata.unwrap_or(Value::Null),
            created_at: now,
        });
        Ok(record.clone())
    }

    async fn upsert_instance(
        &self,
        registration: InstanceRegistration,
    ) -> Result<InstanceRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let mut state = self.lock();
        let task_key = (
            registration.task_name.clone(),
            registration.task_version.clone(),
        );
        if !state.tasks.contains_key(&task_key) {
            return Err(TaskError::NotFound(format!(
                "task {} version {}",
                task_key.0, task_key.1
            )));
        }

        if let Some(existing) = state.instances.get_mut(&registration.instance_id) {
            check_owner(
                &existing.session_id,
                &registration.session_id,
                &registration.instance_id,
            )?;
            if registration.inputs.is_some() {
                existing.inputs = registration.inputs;
            }
            return Ok(existing.clone());
        }

        let record = InstanceRecord {
            id: registration.instance_id.clone(),
            session_id: registration.session_id,
            task_name: registration.task_name,
            task_version: registration.task_version,
            inputs: registration.inputs,
            progress: 0.0,
            status_message: None,
            outcome: None,
            logs: Vec::new(),
            created_at: now,
        };
        state
            .instances
            .insert(registration.instance_id, record.clone());
        Ok(record)
    }

    async fn start_execution(
        &self,
        instance_id: &InstanceId,
        session_id: &SessionId,
        client_id: &ClientId,
        force: bool,
    ) -> Result<ExecutionRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let (killed, record) = {
            let mut state = self.lock();
            let instance = state.instance(instance_id)?;
            check_owner(&instance.session_id, session_id, instance_id)?;

            let mut killed = None;
            if let Some(active_id) = state.active.get(instance_id).cloned() {
                if !force {
                    return Err(TaskError::ExecutionConflict {
                        instance_id: instance_id.to_string(),
                        active_execution_id: active_id.to_string(),
                    });
                }
                let message = format!("killed: superseded by a forced start from {client_id}");
                killed = Some(state.finish(&active_id, ExecutionStatus::Killed, now, |r| {
                    r.error = Some(message);
                })?);
            }

            let record = ExecutionRecord {
                id: self.ids.generate_execution_id(),
                instance_id: instance_id.clone(),
                session_id: session_id.clone(),
                client_id: client_id.clone(),
                status: ExecutionStatus::Running,
                progress: 0.0,
                status_message: None,
                started_at: now,
                completed_at: None,
                error: None,
                result: None,
            };
            state.executions.insert(record.id.clone(), record.clone());
            state.active.insert(instance_id.clone(), record.id.clone());
            (killed, record)
        };

        if let Some(killed) = &killed {
            info!(execution_id = %killed.id, instance_id = %instance_id, "execution killed by forced start");
            self.publish_execution(killed);
        }
        debug!(execution_id = %record.id, instance_id = %instance_id, "execution started");
        self.publish_execution(&record);
        Ok(record)
    }

    async fn check_execution_conflict(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<ExecutionId>, TaskError> {
        self.check_reachable()?;
        Ok(self.lock().active.get(instance_id).cloned())
    }

    async fn force_stop_execution(
        &self,
        execution_id: &ExecutionId,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let record = {
            let mut state = self.lock();
            let current = state.execution_mut(execution_id)?.clone();
            check_owner(&current.session_id, session_id, &current.instance_id)?;
            if current.status.is_terminal() {
                return Ok(current);
            }
            state.finish(execution_id, ExecutionStatus::Killed, now, |r| {
                r.error = Some(reason.to_string());
            })?
        };
        self.publish_execution(&record);
        Ok(record)
    }

    async fn report_progress(
        &self,
        execution_id: &ExecutionId,
        progress: f64,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        self.check_reachable()?;
        let (execution, instance) = {
            let mut state = self.lock();
            let record = state.execution_mut(execution_id)?;
            if record.status.is_terminal() {
                return Err(TaskError::backend(format!(
                    "execution {execution_id} is already {}",
                    record.status
                )));
            }
            record.progress = progress;
            if let Some(msg) = status_message {
                record.status_message = Some(msg.to_string());
            }
            let execution = record.clone();
            let instance = state.instance_mut(&execution.instance_id)?;
            instance.progress = progress;
            if let Some(msg) = status_message {
                instance.status_message = Some(msg.to_string());
            }
            (execution, instance.clone())
        };
        self.publish_execution(&execution);
        self.publish_instance(&instance);
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: &ExecutionId,
        result: Value,
    ) -> Result<ExecutionRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let record = self
            .lock()
            .finish(execution_id, ExecutionStatus::Completed, now, |r| {
                r.progress = 100.0;
                r.result = Some(result);
            })?;
        self.publish_execution(&record);
        Ok(record)
    }

    async fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        error: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let record = self
            .lock()
            .finish(execution_id, ExecutionStatus::Failed, now, |r| {
                r.error = Some(error.to_string());
            })?;
        self.publish_execution(&record);
        Ok(record)
    }

    async fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, TaskError> {
        self.check_reachable()?;
        Ok(self.lock().executions.get(execution_id).cloned())
    }

    async fn validate_session_ownership(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
    ) -> Result<bool, TaskError> {
        self.check_reachable()?;
        let state = self.lock();
        let Some(instance) = state.instances.get(instance_id) else {
            return Ok(false);
        };
        check_owner(&instance.session_id, session_id, instance_id)?;
        Ok(true)
    }

    async fn disconnect_client(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
    ) -> Result<usize, TaskError> {
        self.check_reachable()?;
        let now = self.clock.now();
        let killed = {
            let mut state = self.lock();
            let targets: Vec<ExecutionId> = state
                .executions
                .values()
                .filter(|e| {
                    &e.client_id == client_id
                        && &e.session_id == session_id
                        && !e.status.is_terminal()
                })
                .map(|e| e.id.clone())
                .collect();
            let mut killed = Vec::with_capacity(targets.len());
            for id in targets {
                killed.push(state.finish(&id, ExecutionStatus::Killed, now, |r| {
                    r.error = Some(format!("killed: client {client_id} disconnected"));
                })?);
            }
            killed
        };
        for record in &killed {
            self.publish_execution(record);
        }
        if !killed.is_empty() {
            info!(client_id = %client_id, count = killed.len(), "client disconnected, executions killed");
        }
        Ok(killed.len())
    }

    async fn fetch_task_inputs(&self, instance_id: &InstanceId) -> Result<Option<Value>, TaskError> {
        self.check_reachable()?;
        Ok(self.lock().instance(instance_id)?.inputs.clone())
    }

    async fn report_task_outcome(
        &self,
        instance_id: &InstanceId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        self.check_reachable()?;
        let record = {
            let mut state = self.lock();
            let instance = state.instance_mut(instance_id)?;
            instance.outcome = Some(outcome);
            instance.clone()
        };
        self.publish_instance(&record);
        Ok(())
    }

    async fn append_log(&self, instance_id: &InstanceId, record: LogRecord) -> Result<(), TaskError> {
        self.check_reachable()?;
        self.lock().instance_mut(instance_id)?.logs.push(record);
        Ok(())
    }

    async fn update_instance_progress(
        &self,
        instance_id: &InstanceId,
        progress: Option<f64>,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        self.check_reachable()?;
        let record = {
            let mut state = self.lock();
            let instance = state.instance_mut(instance_id)?;
            if let Some(progress) = progress {
                instance.progress = progress;
            }
            if let Some(msg) = status_message {
                instance.status_message = Some(msg.to_string());
            }
            instance.clone()
        };
        self.publish_instance(&record);
        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, TaskError> {
        self.check_reachable()?;
        Ok(self.lock().instances.get(instance_id).cloned())
    }

    async fn execution_updates(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Subscription<ExecutionUpdate>, TaskError> {
        self.check_reachable()?;
        // snapshot より先に購読して取りこぼしを防ぐ
        let mut updates = self.execution_tx.subscribe();
        let snapshot = self
            .lock()
            .executions
            .get(execution_id)
            .map(ExecutionUpdate::from)
            .ok_or_else(|| TaskError::NotFound(format!("execution {execution_id}")))?;

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let finished = snapshot.status.is_terminal();
        let _ = tx.try_send(snapshot);
        if finished {
            return Ok(Subscription::new(rx));
        }

        let execution_id = execution_id.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) if update.execution_id == execution_id => {
                        let terminal = update.status.is_terminal();
                        if tx.send(update).await.is_err() || terminal {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn instance_updates(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Subscription<InstanceUpdate>, TaskError> {
        self.check_reachable()?;
        let mut updates = self.instance_tx.subscribe();
        let snapshot = self
            .lock()
            .instances
            .get(instance_id)
            .map(InstanceUpdate::from)
            .ok_or_else(|| TaskError::NotFound(format!("instance {instance_id}")))?;

        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let finished = snapshot.outcome.is_some();
        let _ = tx.try_send(snapshot);
        if finished {
            return Ok(Subscription::new(rx));
        }

        let instance_id = instance_id.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) if update.instance_id == instance_id => {
                        let terminal = update.outcome.is_some();
                        if tx.send(update).await.is_err() || terminal {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutcomeStatus, TaskOutcome};
    use crate::error::TaskFailure;
    use serde_json::json;

    fn session() -> SessionId {
        SessionId::from_string("session-a")
    }

    fn client() -> ClientId {
        ClientId::from_string("client-a")
    }

    fn instance() -> InstanceId {
        InstanceId::compose("session-a", "add", 1)
    }

    async fn seeded() -> InMemoryTaskService {
        let service = InMemoryTaskService::new();
        service
            .upsert_task(TaskRegistration {
                name: "add".into(),
                version: "1".into(),
                function_name: "add".into(),
                module: "demo".into(),
                parameters: None,
                metadata: None,
            })
            .await
            .unwrap();
        service
            .upsert_instance(InstanceRegistration {
                instance_id: instance(),
                session_id: session(),
                task_name: "add".into(),
                task_version: "1".into(),
                inputs: Some(json!({"a": 2, "b": 3})),
            })
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let service = seeded().await;
        let registration = TaskRegistration {
            name: "add".into(),
            version: "1".into(),
            function_name: "add".into(),
            module: "demo".into(),
            parameters: None,
            metadata: None,
        };
        let first = service.upsert_task(registration.clone()).await.unwrap();
        let second = service.upsert_task(registration).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.task_count(), 1);

        let again = InstanceRegistration {
            instance_id: instance(),
            session_id: session(),
            task_name: "add".into(),
            task_version: "1".into(),
            inputs: None,
        };
        service.upsert_instance(again.clone()).await.unwrap();
        let record = service.upsert_instance(again).await.unwrap();
        assert_eq!(service.instance_count(), 1);
        assert_eq!(record.inputs, Some(json!({"a": 2, "b": 3})));
    }

    #[tokio::test]
    async fn instance_requires_a_registered_task() {
        let service = InMemoryTaskService::new();
        let err = service
            .upsert_instance(InstanceRegistration {
                instance_id: instance(),
                session_id: session(),
                task_name: "missing".into(),
                task_version: "1".into(),
                inputs: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn conflicting_start_and_forced_restart() {
        let service = seeded().await;
        let first = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap();
        assert_eq!(
            service.check_execution_conflict(&instance()).await.unwrap(),
            Some(first.id.clone())
        );

        let err = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap_err();
        match err {
            TaskError::ExecutionConflict {
                active_execution_id,
                ..
            } => assert_eq!(active_execution_id, first.id.to_string()),
            other => panic!("expected conflict, got {other:?}"),
        }

        let second = service
            .start_execution(&instance(), &session(), &client(), true)
            .await
            .unwrap();
        assert_eq!(second.status, ExecutionStatus::Running);
        assert_ne!(second.id, first.id);

        let killed = service.get_execution(&first.id).await.unwrap().unwrap();
        assert_eq!(killed.status, ExecutionStatus::Killed);
        assert!(killed.error.unwrap().contains("superseded"));
        assert!(killed.completed_at.is_some());
        assert_eq!(
            service.check_execution_conflict(&instance()).await.unwrap(),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn ownership_is_checked() {
        let service = seeded().await;
        let stranger = SessionId::from_string("session-b");

        assert!(
            service
                .validate_session_ownership(&session(), &instance())
                .await
                .unwrap()
        );
        let err = service
            .validate_session_ownership(&stranger, &instance())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::SessionOwnership { .. }));
        assert!(
            !service
                .validate_session_ownership(&session(), &InstanceId::from("nope"))
                .await
                .unwrap()
        );

        let err = service
            .start_execution(&instance(), &stranger, &client(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::SessionOwnership { .. }));
    }

    #[tokio::test]
    async fn execution_state_machine() {
        let service = seeded().await;
        let exec = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap();
        service
            .report_progress(&exec.id, 50.0, Some("half"))
            .await
            .unwrap();
        let done = service
            .complete_execution(&exec.id, json!(5))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result, Some(json!(5)));
        assert_eq!(service.check_execution_conflict(&instance()).await.unwrap(), None);

        // 終端後の遷移は拒否
        assert!(service.fail_execution(&exec.id, "late").await.is_err());
        assert!(service.report_progress(&exec.id, 60.0, None).await.is_err());

        let instance_record = service.get_instance(&instance()).await.unwrap().unwrap();
        assert_eq!(instance_record.progress, 50.0);
        assert_eq!(instance_record.status_message.as_deref(), Some("half"));
    }

    #[tokio::test]
    async fn force_stop_and_disconnect() {
        let service = seeded().await;
        let exec = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap();
        let stopped = service
            .force_stop_execution(&exec.id, &session(), "user asked")
            .await
            .unwrap();
        assert_eq!(stopped.status, ExecutionStatus::Killed);
        assert_eq!(stopped.error.as_deref(), Some("user asked"));

        let again = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap();
        assert_eq!(service.disconnect_client(&client(), &session()).await.unwrap(), 1);
        let record = service.get_execution(&again.id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Killed);
        assert_eq!(service.disconnect_client(&client(), &session()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inputs_and_outcome_for_the_runner() {
        let service = seeded().await;
        assert_eq!(
            service.fetch_task_inputs(&instance()).await.unwrap(),
            Some(json!({"a": 2, "b": 3}))
        );
        service
            .report_task_outcome(
                &instance(),
                TaskOutcome::failed(TaskFailure::new("ValueError", "bad")),
            )
            .await
            .unwrap();
        let record = service.get_instance(&instance()).await.unwrap().unwrap();
        let outcome = record.outcome.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error.unwrap().error_type(), "ValueError");
    }

    #[tokio::test]
    async fn execution_subscription_ends_at_terminal_status() {
        let service = seeded().await;
        let exec = service
            .start_execution(&instance(), &session(), &client(), false)
            .await
            .unwrap();
        let mut sub = service.execution_updates(&exec.id).await.unwrap();

        service.report_progress(&exec.id, 30.0, None).await.unwrap();
        service.complete_execution(&exec.id, json!(1)).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Running);
        assert_eq!(first.progress, 0.0);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.progress, 30.0);
        let third = sub.recv().await.unwrap();
        assert_eq!(third.status, ExecutionStatus::Completed);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn instance_subscription_ends_with_outcome() {
        let service = seeded().await;
        let mut sub = service.instance_updates(&instance()).await.unwrap();
        service
            .update_instance_progress(&instance(), Some(20.0), Some("busy"))
            .await
            .unwrap();
        service
            .report_task_outcome(&instance(), TaskOutcome::completed(json!(5)))
            .await
            .unwrap();

        assert_eq!(sub.recv().await.unwrap().progress, 0.0);
        let busy = sub.recv().await.unwrap();
        assert_eq!(busy.status_message.as_deref(), Some("busy"));
        assert_eq!(
            sub.recv().await.unwrap().outcome,
            Some(OutcomeStatus::Completed)
        );
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_service_fails_every_call() {
        let service = seeded().await;
        service.set_reachable(false);
        assert!(matches!(service.ping().await, Err(TaskError::Backend(_))));
        assert!(service.fetch_task_inputs(&instance()).await.is_err());
    }
}
