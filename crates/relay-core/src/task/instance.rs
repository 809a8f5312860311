//! TaskInstance - Session の中での 1 回の実行
//!
//! # ライフサイクル
//! - 構築: backend と handler を決め、Control を作り、Session に登録
//! - `start`: 1 回だけ。Session の上限を確認してから future を作り、backend に渡す
//! - `stop`: `should_stop` を立て、backend にキャンセルを依頼
//!
//! # 解決順序
//! - backend: Session の注入 → `set_default_backend` → 設定 `task.backend` → LocalBackend
//! - handler: Session の注入 → backend の推奨（RemoteBackend なら RemoteHandler）→ current handler

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::definition::TaskDefinition;
use super::session::{Session, WeakSession};
use crate::backend::{ExecutionBackend, ExecutionRequest, default_backend};
use crate::control::{Control, ControlScope, current_handler};
use crate::domain::{InstanceId, SessionId, TaskInputs};
use crate::error::TaskError;
use crate::future::{FutureStatus, TaskFuture};

/// instance から見た状態。future ができるまでは pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

impl From<FutureStatus> for InstanceStatus {
    /// future の pending は「start 済みだが backend がまだ走らせていない」
    fn from(status: FutureStatus) -> Self {
        match status {
            FutureStatus::Pending => InstanceStatus::Starting,
            FutureStatus::Running => InstanceStatus::Running,
            FutureStatus::Completed => InstanceStatus::Completed,
            FutureStatus::Failed => InstanceStatus::Failed,
            FutureStatus::Cancelled => InstanceStatus::Cancelled,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct InstanceInner {
    id: InstanceId,
    definition: TaskDefinition,
    session: WeakSession,
    session_id: SessionId,
    control: Control,
    backend: Arc<dyn ExecutionBackend>,
    started: AtomicBool,
    future: Mutex<Option<TaskFuture<Value>>>,
}

/// TaskInstance は TaskDefinition の 1 回分の実行
///
/// `Clone` は同じ instance を共有する（Session の索引もこれを持つ）。
#[derive(Clone)]
pub struct TaskInstance {
    inner: Arc<InstanceInner>,
}

impl TaskInstance {
    pub(crate) fn new(
        definition: TaskDefinition,
        session: &Session,
        instance_id: InstanceId,
    ) -> Result<Self, TaskError> {
        let backend = match session.backend() {
            Some(backend) => backend.clone(),
            None => default_backend()?,
        };
        let handler = session
            .handler()
            .cloned()
            .or_else(|| backend.control_handler())
            .unwrap_or_else(current_handler);

        let control = Control::new(
            ControlScope {
                instance_id: instance_id.clone(),
                session_id: Some(session.id().clone()),
                task: definition.descriptor().clone(),
            },
            handler,
        );
        let instance = Self {
            inner: Arc::new(InstanceInner {
                id: instance_id,
                definition,
                session: session.downgrade(),
                session_id: session.id().clone(),
                control,
                backend,
                started: AtomicBool::new(false),
                future: Mutex::new(None),
            }),
        };
        session.add_instance(&instance);
        debug!(
            instance_id = %instance.inner.id,
            backend = instance.inner.backend.name(),
            handler = instance.inner.control.handler().name(),
            "task instance created"
        );
        Ok(instance)
    }

    pub fn id(&self) -> &InstanceId {
        &self.inner.id
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.inner.definition
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Session がまだ生きていれば返す
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade()
    }

    pub fn control(&self) -> &Control {
        &self.inner.control
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.inner.backend
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// start 前は None
    pub fn future(&self) -> Option<TaskFuture<Value>> {
        self.slot().clone()
    }

    pub fn status(&self) -> InstanceStatus {
        match self.future() {
            Some(future) => future.status().into(),
            None => InstanceStatus::Pending,
        }
    }

    pub fn start(&self, inputs: TaskInputs) -> Result<TaskFuture<Value>, TaskError> {
        self.start_with(inputs, false)
    }

    /// 稼働中の execution があっても kill して始める（RemoteBackend）
    pub fn start_forced(&self, inputs: TaskInputs) -> Result<TaskFuture<Value>, TaskError> {
        self.start_with(inputs, true)
    }

    fn start_with(&self, inputs: TaskInputs, force: bool) -> Result<TaskFuture<Value>, TaskError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TaskError::AlreadyStarted(self.inner.id.to_string()));
        }
        if self.inner.control.should_stop() {
            return Err(TaskError::Cancelled {
                instance_id: self.inner.id.to_string(),
            });
        }
        let Some(session) = self.session() else {
            self.inner.started.store(false, Ordering::Release);
            return Err(TaskError::Session(format!(
                "session {} of instance {} no longer exists",
                self.inner.session_id, self.inner.id
            )));
        };

        let definition = &self.inner.definition;
        let reserved = session.reserve(definition.name(), definition.max_parallel(), || {
            let future = TaskFuture::new(self.inner.id.as_str());
            *self.slot() = Some(future.clone());
            future
        });
        let future = match reserved {
            Ok(future) => future,
            Err(e) => {
                // 上限に当たっただけなので、後でもう一度 start できる
                self.inner.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let task = definition.clone();
        let control = self.inner.control.clone();
        let request = ExecutionRequest {
            instance_id: self.inner.id.clone(),
            session_id: self.inner.session_id.clone(),
            task: definition.descriptor().clone(),
            control: self.inner.control.clone(),
            inputs,
            future: future.clone(),
            force,
            target: Box::new(move |inputs| task.invoke(&control, &inputs)),
        };
        if let Err(e) = self.inner.backend.execute(request) {
            future.set_error(e.clone());
            session.remove_instance(self);
            debug!(instance_id = %self.inner.id, error = %e, "backend refused the instance");
            return Err(e);
        }
        Ok(future)
    }

    /// 協調的な停止を依頼する。backend が instance を見つけたら true
    pub fn stop(&self) -> Result<bool, TaskError> {
        self.inner.control.request_stop()?;
        Ok(self
            .inner
            .backend
            .cancel_instance(&self.inner.id, Some(&self.inner.session_id)))
    }

    /// future の結果を待つ。start 前は Usage エラー
    pub fn result(&self, timeout: Option<Duration>) -> Result<Value, TaskError> {
        let future = self.future().ok_or_else(|| {
            TaskError::Usage(format!("task instance {} has not been started", self.inner.id))
        })?;
        future.result(timeout)
    }

    pub fn result_as<O: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<O, TaskError> {
        let value = self.result(timeout)?;
        serde_json::from_value(value).map_err(|e| {
            TaskError::Input(format!("result of instance {}: {e}", self.inner.id))
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<TaskFuture<Value>>> {
        self.inner.future.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInstance")
            .field("id", &self.inner.id)
            .field("task", &self.inner.definition.name())
            .field("backend", &self.inner.backend.name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::control::testing::{Call, RecordingHandler};
    use crate::task::definition::task;
    use serde::Deserialize;
    use serde_json::json;
    use std::convert::Infallible;
    use std::thread;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn session() -> Session {
        Session::builder()
            .name("tests")
            .backend(Arc::new(LocalBackend::new(4).unwrap()))
            .build()
    }

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn add() -> TaskDefinition {
        TaskDefinition::builder("add")
            .param::<i64>("a")
            .param::<i64>("b")
            .build(|args: AddArgs| Ok::<_, Infallible>(args.a + args.b))
            .unwrap()
    }

    fn sleeper(name: &str, millis: u64, max_parallel: usize) -> TaskDefinition {
        TaskDefinition::builder(name)
            .max_parallel(max_parallel)
            .build(move |_: ()| {
                thread::sleep(Duration::from_millis(millis));
                Ok::<_, Infallible>("slept")
            })
            .unwrap()
    }

    /// 100 回まわり、停止を見たら "stopped" を返す
    fn looping() -> TaskDefinition {
        TaskDefinition::builder("loop")
            .build_with_control(|tc: &Control, _: ()| {
                for _ in 0..100 {
                    if tc.should_stop() {
                        return Ok::<_, Infallible>("stopped");
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Ok("done")
            })
            .unwrap()
    }

    #[test]
    fn instance_requires_a_session() {
        let err = add().instance().unwrap_err();
        assert!(matches!(err, TaskError::SessionNotFound));
    }

    #[test]
    fn local_success_leaves_nothing_running() {
        let session = session();
        let _guard = session.enter().unwrap();
        let add = add();

        assert_eq!(
            add.call(TaskInputs::positional(vec![json!(2), json!(3)]))
                .unwrap(),
            json!(5)
        );
        assert_eq!(session.running_count("add"), 0);

        let instance = add.instance().unwrap();
        assert_eq!(instance.status(), InstanceStatus::Pending);
        let future = instance
            .start(TaskInputs::new().kwarg("a", 2).kwarg("b", 3))
            .unwrap();
        assert_eq!(future.result(WAIT).unwrap(), json!(5));
        assert_eq!(instance.status(), InstanceStatus::Completed);
        assert_eq!(instance.result_as::<i64>(None).unwrap(), 5);
        assert_eq!(session.running_count("add"), 0);
        // 終わった instance も参照できる
        assert_eq!(session.instances("add").len(), 1);
    }

    #[test]
    fn stop_is_observed_by_the_running_task() {
        let session = session();
        let _guard = session.enter().unwrap();

        let instance = looping().instance().unwrap();
        let future = instance.start(TaskInputs::new()).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert!(instance.stop().unwrap());

        assert_eq!(future.result(WAIT).unwrap(), json!("stopped"));
        assert!(instance.control().should_stop());
        assert_eq!(future.status(), FutureStatus::Completed);
    }

    #[test]
    fn max_parallel_is_enforced_per_session() {
        let session = session();
        let _guard = session.enter().unwrap();
        let slow = sleeper("slow", 100, 1);

        let first = slow.instance().unwrap();
        let future = first.start(TaskInputs::new()).unwrap();
        let second = slow.instance().unwrap();
        let err = second.start(TaskInputs::new()).unwrap_err();
        assert!(matches!(err, TaskError::MaxInstancesReached { limit: 1, .. }));
        assert!(second.future().is_none());

        future.result(WAIT).unwrap();
        let third = slow.instance().unwrap();
        assert_eq!(
            third.start(TaskInputs::new()).unwrap().result(WAIT).unwrap(),
            json!("slept")
        );
        // 上限で断られた instance は後で start できる
        assert!(second.start(TaskInputs::new()).is_ok());
    }

    #[test]
    fn k_parallel_starts_succeed_and_the_next_one_fails() {
        let session = session();
        let _guard = session.enter().unwrap();
        let slow = sleeper("pair", 200, 2);

        let futures: Vec<_> = (0..2)
            .map(|_| slow.instance().unwrap().start(TaskInputs::new()).unwrap())
            .collect();
        assert_eq!(session.running_count("pair"), 2);
        let err = slow
            .instance()
            .unwrap()
            .start(TaskInputs::new())
            .unwrap_err();
        assert!(matches!(err, TaskError::MaxInstancesReached { limit: 2, .. }));
        assert!(matches!(
            slow.call(TaskInputs::new()),
            Err(TaskError::Usage(_))
        ));
        for future in futures {
            future.result(WAIT).unwrap();
        }
    }

    #[test]
    fn start_is_allowed_once() {
        let session = session();
        let _guard = session.enter().unwrap();
        let instance = add().instance().unwrap();
        let inputs = TaskInputs::new().kwarg("a", 1).kwarg("b", 1);
        instance.start(inputs.clone()).unwrap();
        assert!(matches!(
            instance.start(inputs),
            Err(TaskError::AlreadyStarted(_))
        ));
        assert_eq!(instance.result(WAIT).unwrap(), json!(2));
    }

    #[test]
    fn stopped_instances_cannot_start() {
        let session = session();
        let _guard = session.enter().unwrap();
        let instance = looping().instance().unwrap();
        assert!(!instance.stop().unwrap());
        assert!(matches!(
            instance.start(TaskInputs::new()),
            Err(TaskError::Cancelled { .. })
        ));
        assert_eq!(instance.status(), InstanceStatus::Pending);
    }

    #[test]
    fn backend_refusal_fails_the_future_and_deregisters() {
        let backend = Arc::new(LocalBackend::new(1).unwrap());
        let session = Session::builder().backend(backend.clone()).build();
        backend.shutdown(true);

        let instance = add().instance_in(&session).unwrap();
        let err = instance
            .start(TaskInputs::new().kwarg("a", 1).kwarg("b", 2))
            .unwrap_err();
        assert!(matches!(err, TaskError::Backend(_)));
        assert_eq!(instance.status(), InstanceStatus::Failed);
        assert!(session.instances("add").is_empty());
        assert_eq!(session.running_count("add"), 0);
    }

    #[test]
    fn user_failures_surface_on_the_future() {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        struct ValueError(String);

        let session = session();
        let bad = task("bad", |_: ()| Err::<(), _>(ValueError("bad".into()))).unwrap();
        let instance = bad.instance_in(&session).unwrap();
        let err = instance
            .start(TaskInputs::new())
            .unwrap()
            .result(WAIT)
            .unwrap_err();
        assert_eq!(err.kind(), "ValueError");
        assert_eq!(instance.status(), InstanceStatus::Failed);
    }

    #[test]
    fn session_handler_is_injected_into_the_control() {
        let handler = Arc::new(RecordingHandler::default());
        let session = Session::builder()
            .backend(Arc::new(LocalBackend::new(1).unwrap()))
            .handler(handler.clone())
            .build();
        let report = TaskDefinition::builder("report")
            .build_with_control(|tc: &Control, _: ()| {
                tc.update_progress(50.0, Some("half"))?;
                Ok::<_, TaskError>(tc.progress())
            })
            .unwrap();

        let instance = report.instance_in(&session).unwrap();
        let value = instance.start(TaskInputs::new()).unwrap().result(WAIT).unwrap();
        assert_eq!(value, json!(50.0));
        assert_eq!(
            handler.calls(),
            vec![Call::Progress(50.0, Some("half".into()))]
        );
        assert_eq!(instance.control().scope().session_id.as_ref(), Some(session.id()));
    }

    #[test]
    fn finished_instances_can_be_evicted() {
        let session = session();
        let add = add();
        for i in 0..3 {
            add.instance_in(&session)
                .unwrap()
                .start(TaskInputs::new().kwarg("a", i).kwarg("b", 0))
                .unwrap()
                .result(WAIT)
                .unwrap();
        }
        let pending = add.instance_in(&session).unwrap();

        assert_eq!(session.evict_finished(), 3);
        let left = session.instances("add");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), pending.id());
        assert_eq!(session.instance(pending.id()).unwrap().id(), pending.id());
    }

    #[test]
    fn timed_out_result_leaves_the_state_alone() {
        let session = session();
        let slow = sleeper("slow", 150, 1);
        let instance = slow.instance_in(&session).unwrap();
        let future = instance.start(TaskInputs::new()).unwrap();

        let err = future.result(Some(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));
        assert!(!future.done());
        assert_eq!(future.result(WAIT).unwrap(), json!("slept"));
    }
}
