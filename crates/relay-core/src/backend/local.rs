//! LocalBackend - プロセス内のワーカープールで動かす backend
//!
//! # 実装詳細
//! - 専用の tokio multi-thread runtime を持ち、ユーザー関数は `spawn_blocking` で実行
//! - 同時実行数は `Semaphore(workers)` で制限
//! - instance id → (WorkHandle, Control, future) の表を Mutex で持つ
//! - permit 待ちの間に cancel されたものは実行せずに cancelled にする
//!
//! # 学習ポイント
//! - `tokio::select!` で permit 取得とキャンセル通知を競わせる
//! - `Semaphore::close` で shutdown 後の permit 待ちを一斉に失敗させる
//! - 投入と shutdown は registry のロックで直列化する（ロック中に触れる Future は `set_running` だけ）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use super::{ExecutionBackend, ExecutionRequest};
use crate::control::Control;
use crate::domain::{InstanceId, SessionId};
use crate::error::{TaskError, TaskFailure};
use crate::future::TaskFuture;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// WorkHandle は 1 件の投入に対するスケジューリング上のハンドル
///
/// 実行開始前（permit 待ち）だけ cancel が効く。
#[derive(Debug, Default)]
struct WorkHandle {
    state: AtomicU8,
    notify: Notify,
}

impl WorkHandle {
    /// 開始前なら cancelled にして true
    fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.notify.notify_one();
        }
        cancelled
    }

    /// 実行を開始できれば true（直前に cancel されていれば false）
    fn begin(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn cancelled(&self) {
        loop {
            if self.state.load(Ordering::Acquire) == CANCELLED {
                return;
            }
            self.notify.notified().await;
        }
    }
}

struct Entry {
    work: Arc<WorkHandle>,
    control: Control,
    future: TaskFuture<Value>,
}

type Registry = Arc<Mutex<HashMap<InstanceId, Entry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<InstanceId, Entry>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

fn shutdown_error() -> TaskError {
    TaskError::backend("local backend has been shut down")
}

/// LocalBackend は固定サイズのワーカープール
///
/// # 使用例
/// ```ignore
/// let backend = Arc::new(LocalBackend::new(4)?);
/// let session = Session::builder().backend(backend.clone()).build();
/// ```
pub struct LocalBackend {
    workers: usize,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    permits: Arc<Semaphore>,
    registry: Registry,
    shut_down: AtomicBool,
}

impl LocalBackend {
    pub fn new(workers: usize) -> Result<Self, TaskError> {
        if workers == 0 {
            return Err(TaskError::Configuration(
                "local backend needs at least one worker".into(),
            ));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("relay-local")
            .enable_all()
            .build()
            .map_err(|e| TaskError::backend(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            workers,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            permits: Arc::new(Semaphore::new(workers)),
            registry: Arc::new(Mutex::new(HashMap::new())),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// まだ終わっていない投入の数
    pub fn in_flight(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn execute(&self, request: ExecutionRequest) -> Result<(), TaskError> {
        let ExecutionRequest {
            instance_id,
            control,
            inputs,
            future,
            target,
            ..
        } = request;

        let work = Arc::new(WorkHandle::default());
        // shutdown と同じロックの下で状態を確認し、spawn まで済ませる
        let mut registry = lock(&self.registry);
        if self.is_shut_down() {
            return Err(shutdown_error());
        }
        if registry.contains_key(&instance_id) {
            return Err(TaskError::backend(format!(
                "instance {instance_id} is already scheduled"
            )));
        }
        registry.insert(
            instance_id.clone(),
            Entry {
                work: work.clone(),
                control,
                future: future.clone(),
            },
        );
        future.set_running();

        let permits = self.permits.clone();
        let shared = self.registry.clone();
        self.handle.spawn(async move {
            let registry = shared;
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit,
                _ = work.cancelled() => {
                    debug!(instance_id = %instance_id, "cancelled before dispatch");
                    lock(&registry).remove(&instance_id);
                    future.cancel();
                    return;
                }
            };
            let Ok(permit) = permit else {
                // semaphore が閉じられた = shutdown
                lock(&registry).remove(&instance_id);
                future.set_error(shutdown_error());
                return;
            };
            if !work.begin() {
                lock(&registry).remove(&instance_id);
                future.cancel();
                return;
            }

            let outcome = tokio::task::spawn_blocking(move || target(inputs)).await;
            drop(permit);

            // 完了を観測した呼び出し側がすぐ同じ instance を再投入できるよう、先に表から外す
            lock(&registry).remove(&instance_id);
            match outcome {
                Ok(Ok(value)) => {
                    debug!(instance_id = %instance_id, "task completed");
                    future.set_result(value);
                }
                Ok(Err(error)) => {
                    debug!(instance_id = %instance_id, error = %error, "task failed");
                    future.set_error(error);
                }
                Err(join_error) => {
                    warn!(instance_id = %instance_id, error = %join_error, "task panicked");
                    future.set_error(TaskFailure::new("Panic", join_error.to_string()).into());
                }
            }
        });
        Ok(())
    }

    fn cancel_instance(&self, instance_id: &InstanceId, _session_id: Option<&SessionId>) -> bool {
        let (control, work) = {
            let registry = lock(&self.registry);
            let Some(entry) = registry.get(instance_id) else {
                return false;
            };
            (entry.control.clone(), entry.work.clone())
        };
        if let Err(e) = control.request_stop() {
            warn!(instance_id = %instance_id, error = %e, "stop notification failed");
        }
        if work.cancel() {
            debug!(instance_id = %instance_id, "queued work cancelled");
        }
        true
    }

    fn start(&self) -> Result<(), TaskError> {
        if self.is_shut_down() {
            return Err(shutdown_error());
        }
        Ok(())
    }

    fn shutdown(&self, wait: bool) {
        let pending: Vec<TaskFuture<Value>> = {
            let registry = lock(&self.registry);
            if self.shut_down.swap(true, Ordering::AcqRel) {
                return;
            }
            // permit 待ちのものはすべて shutdown エラーになる
            self.permits.close();
            registry.values().map(|e| e.future.clone()).collect()
        };
        if wait {
            for future in &pending {
                let _ = future.result(None);
            }
        } else {
            for future in &pending {
                future.set_error(shutdown_error());
            }
        }

        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            runtime.shutdown_background();
        }
        info!(workers = self.workers, wait, "local backend shut down");
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        // async コンテキストで Runtime を drop すると panic するので明示的に手放す
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::scope;
    use crate::control::{Control, LocalHandler};
    use crate::domain::TaskInputs;
    use crate::future::FutureStatus;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn request(
        name: &str,
        target: impl FnOnce(TaskInputs) -> Result<Value, TaskError> + Send + 'static,
    ) -> (ExecutionRequest, TaskFuture<Value>, Control) {
        let scope = scope(name);
        let control = Control::new(scope.clone(), Arc::new(LocalHandler));
        let future = TaskFuture::new(scope.instance_id.as_str());
        let request = ExecutionRequest {
            instance_id: scope.instance_id.clone(),
            session_id: scope.session_id.clone().unwrap(),
            task: scope.task.clone(),
            control: control.clone(),
            inputs: TaskInputs::new(),
            future: future.clone(),
            force: false,
            target: Box::new(target),
        };
        (request, future, control)
    }

    #[test]
    fn runs_and_completes_the_future() {
        let backend = LocalBackend::new(2).unwrap();
        let (req, future, _) = request("add", |_| Ok(json!(5)));
        backend.execute(req).unwrap();
        assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), json!(5));
        assert_eq!(future.status(), FutureStatus::Completed);
        backend.shutdown(true);
    }

    #[test]
    fn errors_are_stored_on_the_future() {
        let backend = LocalBackend::new(1).unwrap();
        let (req, future, _) = request("bad", |_| {
            Err(TaskFailure::new("ValueError", "bad").into())
        });
        backend.execute(req).unwrap();
        let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.kind(), "ValueError");
        backend.shutdown(true);
    }

    #[test]
    fn panics_become_failures() {
        let backend = LocalBackend::new(1).unwrap();
        let (req, future, _) = request("boom", |_| panic!("boom"));
        backend.execute(req).unwrap();
        let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.kind(), "Panic");
        backend.shutdown(true);
    }

    #[test]
    fn future_is_running_once_submitted() {
        let backend = LocalBackend::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (req, future, _) = request("gated", move |_| {
            let _ = gate_rx.recv();
            Ok(Value::Null)
        });
        backend.execute(req).unwrap();
        assert_eq!(future.status(), FutureStatus::Running);
        gate_tx.send(()).unwrap();
        future.result(Some(Duration::from_secs(5))).unwrap();
        backend.shutdown(true);
    }

    #[test]
    fn cancel_sets_the_stop_flag_of_running_work() {
        let backend = LocalBackend::new(1).unwrap();
        let (req, future, control) = request("loop", |_| Ok(Value::Null));
        let observer = control.clone();
        let req = ExecutionRequest {
            target: Box::new(move |_| {
                while !observer.should_stop() {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(json!("stopped"))
            }),
            ..req
        };
        backend.execute(req).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(backend.cancel_instance(control.instance_id(), None));
        assert!(control.should_stop());
        // 実行中のものは協調的に終わる
        assert_eq!(
            future.result(Some(Duration::from_secs(5))).unwrap(),
            json!("stopped")
        );
        assert!(!backend.cancel_instance(control.instance_id(), None));
        backend.shutdown(true);
    }

    #[test]
    fn queued_work_is_cancelled_before_dispatch() {
        let backend = LocalBackend::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (blocker, blocker_future, _) = request("blocker", move |_| {
            let _ = gate_rx.recv();
            Ok(Value::Null)
        });
        backend.execute(blocker).unwrap();
        thread::sleep(Duration::from_millis(30));

        let mut queued_scope = scope("queued");
        queued_scope.instance_id = InstanceId::compose("session-t", "queued", 2);
        let control = Control::new(queued_scope.clone(), Arc::new(LocalHandler));
        let future = TaskFuture::new(queued_scope.instance_id.as_str());
        backend
            .execute(ExecutionRequest {
                instance_id: queued_scope.instance_id.clone(),
                session_id: SessionId::from_string("session-t"),
                task: queued_scope.task.clone(),
                control: control.clone(),
                inputs: TaskInputs::new(),
                future: future.clone(),
                force: false,
                target: Box::new(|_| Ok(json!("ran"))),
            })
            .unwrap();

        assert!(backend.cancel_instance(&queued_scope.instance_id, None));
        let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, TaskError::Cancelled { .. }));
        assert!(control.should_stop());

        gate_tx.send(()).unwrap();
        blocker_future.result(Some(Duration::from_secs(5))).unwrap();
        backend.shutdown(true);
    }

    #[test]
    fn shutdown_refuses_new_work_and_fails_queued_work() {
        let backend = LocalBackend::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (blocker, blocker_future, _) = request("blocker", move |_| {
            let _ = gate_rx.recv();
            Ok(Value::Null)
        });
        backend.execute(blocker).unwrap();
        thread::sleep(Duration::from_millis(30));

        let mut queued_scope = scope("queued");
        queued_scope.instance_id = InstanceId::compose("session-t", "queued", 2);
        let queued_future = TaskFuture::new(queued_scope.instance_id.as_str());
        backend
            .execute(ExecutionRequest {
                instance_id: queued_scope.instance_id.clone(),
                session_id: SessionId::from_string("session-t"),
                task: queued_scope.task.clone(),
                control: Control::new(queued_scope, Arc::new(LocalHandler)),
                inputs: TaskInputs::new(),
                future: queued_future.clone(),
                force: false,
                target: Box::new(|_| Ok(json!("ran"))),
            })
            .unwrap();

        backend.shutdown(false);
        gate_tx.send(()).unwrap();

        let err = queued_future
            .result(Some(Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(err, TaskError::Backend(_)));
        assert!(blocker_future.done());

        let (late, _, _) = request("late", |_| Ok(Value::Null));
        assert!(matches!(backend.execute(late), Err(TaskError::Backend(_))));
        assert!(backend.start().is_err());
    }

    #[test]
    fn work_submitted_while_shutting_down_always_finishes() {
        let backend = Arc::new(LocalBackend::new(2).unwrap());
        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let backend = backend.clone();
                thread::spawn(move || {
                    let mut accepted = Vec::new();
                    for i in 0..50 {
                        let (req, future, _) = request(&format!("racer-{t}-{i}"), |_| Ok(json!(1)));
                        if backend.execute(req).is_ok() {
                            accepted.push(future);
                        }
                    }
                    accepted
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(2));
        backend.shutdown(false);

        for submitter in submitters {
            for future in submitter.join().unwrap() {
                let _ = future.result(Some(Duration::from_secs(5)));
                assert!(future.done(), "{} never finished", future.instance_id());
            }
        }
    }
}
