//! TaskFuture - 1 回だけ値が決まる結果ホルダー
//!
//! # 状態遷移
//! - pending → running / cancelled / failed
//! - running → completed / failed / cancelled
//! - 終端状態（completed / failed / cancelled）からは遷移しない
//!
//! # 学習ポイント
//! - Mutex + Condvar による blocking wait（timeout 付き）
//! - 遷移は Mutex で直列化し、done callback はロックの外で呼ぶ
//! - cancel は状態を変えるだけで、実行中のユーザー関数は止めない
//!   （停止は Control の should_stop による協調的なもの）

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FutureStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl FutureStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FutureStatus::Completed | FutureStatus::Failed | FutureStatus::Cancelled
        )
    }
}

impl fmt::Display for FutureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FutureStatus::Pending => "pending",
            FutureStatus::Running => "running",
            FutureStatus::Completed => "completed",
            FutureStatus::Failed => "failed",
            FutureStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send + 'static>;

struct State<T> {
    status: FutureStatus,
    value: Option<T>,
    error: Option<TaskError>,
    callbacks: Vec<DoneCallback<T>>,
}

struct Shared<T> {
    instance_id: String,
    state: Mutex<State<T>>,
    done: Condvar,
}

/// TaskFuture は TaskInstance の結果
///
/// `Clone` は同じ結果を共有するハンドルを作る。すべての観測者は同じ終端状態を見る。
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance_id: instance_id.into(),
                state: Mutex::new(State {
                    status: FutureStatus::Pending,
                    value: None,
                    error: None,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn status(&self) -> FutureStatus {
        self.lock().status
    }

    pub fn done(&self) -> bool {
        self.status().is_terminal()
    }

    /// failed のときだけ保存されたエラーを返す
    pub fn error(&self) -> Option<TaskError> {
        self.lock().error.clone()
    }

    /// 終端状態になるまで待って結果を返す
    ///
    /// - completed → 値
    /// - failed → 保存されたエラー（型はそのまま）
    /// - cancelled → `TaskError::Cancelled`
    /// - timeout → `TaskError::Timeout`（状態は変えない）
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        let mut state = self.lock();
        match timeout {
            None => {
                while !state.status.is_terminal() {
                    state = self
                        .shared
                        .done
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while !state.status.is_terminal() {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TaskError::Timeout(limit));
                    }
                    let (next, _) = self
                        .shared
                        .done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
            }
        }

        match state.status {
            FutureStatus::Completed => state
                .value
                .clone()
                .ok_or_else(|| TaskError::backend("completed future has no value")),
            FutureStatus::Failed => Err(state
                .error
                .clone()
                .unwrap_or_else(|| TaskError::backend("failed future has no error"))),
            _ => Err(TaskError::Cancelled {
                instance_id: self.shared.instance_id.clone(),
            }),
        }
    }

    /// 終端でなければ cancelled にする。呼び出し後に cancelled なら true
    ///
    /// 既に cancelled の場合も true を返す。
    pub fn cancel(&self) -> bool {
        self.transition(FutureStatus::Cancelled, |state| {
            !state.status.is_terminal()
        });
        self.status() == FutureStatus::Cancelled
    }

    /// pending → running。それ以外の状態からは何もしない
    pub fn set_running(&self) -> bool {
        self.transition(FutureStatus::Running, |state| {
            state.status == FutureStatus::Pending
        })
    }

    /// running → completed。running 以外では警告を出して何もしない
    pub fn set_result(&self, value: T) -> bool {
        let mut value = Some(value);
        let applied = self.transition(FutureStatus::Completed, |state| {
            if state.status != FutureStatus::Running {
                return false;
            }
            state.value = value.take();
            true
        });
        if !applied {
            warn!(
                instance_id = %self.shared.instance_id,
                status = %self.status(),
                "ignoring result for a future that is not running"
            );
        }
        applied
    }

    /// pending / running → failed
    pub fn set_error(&self, error: TaskError) -> bool {
        let mut error = Some(error);
        let applied = self.transition(FutureStatus::Failed, |state| {
            if state.status.is_terminal() {
                return false;
            }
            state.error = error.take();
            true
        });
        if !applied {
            warn!(
                instance_id = %self.shared.instance_id,
                status = %self.status(),
                "ignoring error for a future that is already done"
            );
        }
        applied
    }

    /// 終端遷移の時に一度だけ `callback` を呼ぶ。既に終端ならすぐ呼ぶ
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(&TaskFuture<T>) + Send + 'static,
    {
        let mut state = self.lock();
        if state.status.is_terminal() {
            drop(state);
            callback(self);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    fn transition<G>(&self, to: FutureStatus, guard: G) -> bool
    where
        G: FnOnce(&mut State<T>) -> bool,
    {
        let callbacks = {
            let mut state = self.lock();
            if !guard(&mut state) {
                return false;
            }
            state.status = to;
            if !to.is_terminal() {
                return true;
            }
            self.shared.done.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(self);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .shared
            .state
            .lock()
            .map(|s| s.status)
            .unwrap_or_else(|e| e.into_inner().status);
        f.debug_struct("TaskFuture")
            .field("instance_id", &self.shared.instance_id)
            .field("status", &status)
            .finish()
    }
}
