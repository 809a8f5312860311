//! EventLoopThread - 同期コードから async 処理を待つためのブリッジ
//!
//! 専用の OS スレッドで current_thread の tokio runtime を動かし、
//! 呼び出し側のスレッドからは future を投げて結果を待つだけにする。
//! SDK の公開 API を同期のまま保ちつつ、TaskService は async で書ける。
//!
//! # 学習ポイント
//! - `std::thread` + `tokio::runtime::Builder::new_current_thread`
//! - `Handle::spawn` による別スレッドの runtime への投入
//! - 結果の受け渡しは `std::sync::mpsc`（tokio の外のスレッドでもブロックできる）

use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TaskError;

struct LoopThread {
    handle: Handle,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

/// EventLoopThread は 1 本のループスレッドを持つ
///
/// # 使用例
/// ```ignore
/// let bridge = EventLoopThread::new("relay-loop");
/// let value = bridge.await_future(async { 40 + 2 })?;
/// ```
pub struct EventLoopThread {
    name: String,
    inner: Mutex<Option<LoopThread>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(None),
        }
    }

    /// プロセス共有のブリッジ（初回利用時に作成）
    pub fn shared() -> Arc<EventLoopThread> {
        static SHARED: OnceLock<Arc<EventLoopThread>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(EventLoopThread::new("relay-event-loop")))
            .clone()
    }

    /// ループスレッドを起動する。起動済みなら何もしない
    pub fn start(&self) -> Result<(), TaskError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.as_ref().is_some_and(|l| !l.thread.is_finished()) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                // stop() か EventLoopThread の drop まで回し続ける
                let _ = runtime.block_on(shutdown_rx);
            })
            .map_err(|e| TaskError::backend(format!("failed to spawn event loop thread: {e}")))?;

        let handle = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(TaskError::backend(format!("failed to build event loop: {e}")));
            }
            Err(_) => return Err(TaskError::backend("event loop thread exited during startup")),
        };

        debug!(name = %self.name, "event loop started");
        *inner = Some(LoopThread {
            handle,
            shutdown: shutdown_tx,
            thread_id: thread.thread().id(),
            thread,
        });
        Ok(())
    }

    /// ループの停止を要求する。停止済みなら何もしない
    pub fn stop(&self) {
        let taken = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(lt) = taken else {
            return;
        };
        let _ = lt.shutdown.send(());
        // ループスレッド自身からの stop では join しない
        if thread::current().id() != lt.thread_id {
            let _ = lt.thread.join();
        }
        debug!(name = %self.name, "event loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|l| !l.thread.is_finished())
    }

    /// future をループスレッドに投入する。呼び出し側のスレッドでは実行しない
    pub fn schedule<F>(&self, future: F) -> Result<Scheduled<F::Output>, TaskError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.start()?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let lt = inner
            .as_ref()
            .ok_or_else(|| TaskError::backend("event loop is not running"))?;

        let (tx, rx) = std_mpsc::sync_channel(1);
        lt.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        Ok(Scheduled {
            rx,
            loop_thread: lt.thread_id,
        })
    }

    /// `schedule(future)?.wait()` と同じ
    pub fn await_future<F>(&self, future: F) -> Result<F::Output, TaskError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.schedule(future)?.wait()
    }

    /// `Result` を返す future 用。エラーを平坦化する
    pub fn call<T, F>(&self, future: F) -> Result<T, TaskError>
    where
        F: Future<Output = Result<T, TaskError>> + Send + 'static,
        T: Send + 'static,
    {
        self.await_future(future)?
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scheduled は投入済みの future の結果を待つハンドル
#[derive(Debug)]
pub struct Scheduled<T> {
    rx: std_mpsc::Receiver<T>,
    loop_thread: ThreadId,
}

impl<T> Scheduled<T> {
    pub fn wait(self) -> Result<T, TaskError> {
        self.check_thread()?;
        self.rx.recv().map_err(|_| dropped())
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        self.check_thread()?;
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            std_mpsc::RecvTimeoutError::Timeout => TaskError::Timeout(timeout),
            std_mpsc::RecvTimeoutError::Disconnected => dropped(),
        })
    }

    fn check_thread(&self) -> Result<(), TaskError> {
        // ループスレッド上で待つと自分自身を待つことになる
        if thread::current().id() == self.loop_thread {
            return Err(TaskError::Usage(
                "cannot wait for a scheduled operation on the event loop thread".into(),
            ));
        }
        Ok(())
    }
}

fn dropped() -> TaskError {
    TaskError::backend("event loop stopped before the operation completed")
}
