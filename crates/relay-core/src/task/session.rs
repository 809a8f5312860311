//! Session - TaskInstance をまとめるスコープ
//!
//! # 動作
//! - スレッドごとに「現在の Session」を 1 つ持つ（thread_local）
//! - `enter` で現在の Session になり、`exit` で直前の Session に戻る
//!   （同じ Session の再 enter は不可、別の Session のネストは可）
//! - instance は作られた時点で登録され、終わった後も参照できる
//!   （`evict_finished` を呼んだときだけ取り除く）
//! - handler / backend を注入すると、その Session の instance はそれを使う
//!
//! # Thread Safety
//! - `tasks` は Session 内部の Mutex で守る
//! - ロック順序は Session → instance の future スロット → Future

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use super::instance::TaskInstance;
use crate::backend::ExecutionBackend;
use crate::control::ControlHandler;
use crate::domain::{InstanceId, SessionId};
use crate::error::TaskError;
use crate::future::TaskFuture;
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

thread_local! {
    static CURRENT: RefCell<Option<Session>> = const { RefCell::new(None) };
}

pub(crate) struct SessionInner {
    id: SessionId,
    name: String,
    handler: Option<Arc<dyn ControlHandler>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    ids: UlidGenerator<SystemClock>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    active: bool,
    previous: Option<Session>,
    tasks: HashMap<String, HashMap<InstanceId, TaskInstance>>,
}

/// Session はスレッドに束縛されるスコープ
///
/// `Clone` は同じ Session を共有する。
///
/// # 使用例
/// ```ignore
/// let session = Session::new("import");
/// let _guard = session.enter()?;
/// let future = add.instance()?.start(TaskInputs::new().arg(2).arg(3))?;
/// assert_eq!(future.result(None)?, json!(5));
/// // _guard の drop で exit
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder().name(name).build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// このスレッドの現在の Session
    pub fn current() -> Option<Session> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handler(&self) -> Option<&Arc<dyn ControlHandler>> {
        self.inner.handler.as_ref()
    }

    pub fn backend(&self) -> Option<&Arc<dyn ExecutionBackend>> {
        self.inner.backend.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// 現在の Session になる。drop で `exit` する guard を返す
    pub fn enter(&self) -> Result<SessionGuard, TaskError> {
        let mut state = self.lock();
        if state.active {
            return Err(TaskError::Session(format!(
                "session {} is already active",
                self.inner.id
            )));
        }
        state.previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        state.active = true;
        debug!(session_id = %self.inner.id, name = %self.inner.name, "session entered");
        Ok(SessionGuard {
            session: self.clone(),
            exited: false,
        })
    }

    /// 直前の Session に戻す。このスレッドの現在の Session でなければエラー
    pub fn exit(&self) -> Result<(), TaskError> {
        let is_current = CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(&s.inner, &self.inner))
        });
        let mut state = self.lock();
        if !state.active || !is_current {
            return Err(TaskError::Session(format!(
                "session {} is not the current session",
                self.inner.id
            )));
        }
        let previous = state.previous.take();
        state.active = false;
        drop(state);
        CURRENT.with(|current| current.replace(previous));
        debug!(session_id = %self.inner.id, "session exited");
        Ok(())
    }

    pub fn add_instance(&self, instance: &TaskInstance) {
        self.lock()
            .tasks
            .entry(instance.definition().name().to_string())
            .or_default()
            .insert(instance.id().clone(), instance.clone());
    }

    /// 登録されていれば取り除いて true
    pub fn remove_instance(&self, instance: &TaskInstance) -> bool {
        let mut state = self.lock();
        let name = instance.definition().name();
        let Some(instances) = state.tasks.get_mut(name) else {
            return false;
        };
        let removed = instances.remove(instance.id()).is_some();
        if instances.is_empty() {
            state.tasks.remove(name);
        }
        removed
    }

    /// future があり、まだ終端でない instance の数
    pub fn running_count(&self, task_name: &str) -> usize {
        running_in(&self.lock(), task_name)
    }

    pub fn instances(&self, task_name: &str) -> Vec<TaskInstance> {
        self.lock()
            .tasks
            .get(task_name)
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instance(&self, instance_id: &InstanceId) -> Option<TaskInstance> {
        self.lock()
            .tasks
            .values()
            .find_map(|instances| instances.get(instance_id).cloned())
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// future が終端になった instance を取り除き、その数を返す
    pub fn evict_finished(&self) -> usize {
        let mut state = self.lock();
        let mut evicted = 0;
        state.tasks.retain(|_, instances| {
            let before = instances.len();
            instances.retain(|_, instance| !instance.status().is_terminal());
            evicted += before - instances.len();
            !instances.is_empty()
        });
        evicted
    }

    pub(crate) fn next_instance_id(&self, task_name: &str) -> InstanceId {
        self.inner.ids.generate_instance_id(&self.inner.id, task_name)
    }

    /// 上限を確認してから `create` で future を作る（確認と作成は同じロックの下）
    pub(crate) fn reserve<F>(
        &self,
        task_name: &str,
        limit: usize,
        create: F,
    ) -> Result<TaskFuture<Value>, TaskError>
    where
        F: FnOnce() -> TaskFuture<Value>,
    {
        let state = self.lock();
        if running_in(&state, task_name) >= limit {
            return Err(TaskError::MaxInstancesReached {
                task: task_name.to_string(),
                limit,
            });
        }
        Ok(create())
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn running_in(state: &SessionState, task_name: &str) -> usize {
    state
        .tasks
        .get(task_name)
        .map(|instances| {
            instances
                .values()
                .filter(|instance| instance.future().is_some_and(|f| !f.done()))
                .count()
        })
        .unwrap_or(0)
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("handler", &self.inner.handler.as_ref().map(|h| h.name()))
            .field("backend", &self.inner.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

/// instance から Session への弱参照（循環参照を避ける）
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

/// drop で `exit` する
#[must_use = "dropping the guard exits the session immediately"]
pub struct SessionGuard {
    session: Session,
    exited: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// 明示的に exit してエラーを受け取る
    pub fn exit(mut self) -> Result<(), TaskError> {
        self.exited = true;
        self.session.exit()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.exited || !self.session.is_active() {
            return;
        }
        if let Err(e) = self.session.exit() {
            warn!(session_id = %self.session.id(), error = %e, "session exit failed");
        }
    }
}

#[derive(Default)]
pub struct SessionBuilder {
    id: Option<SessionId>,
    name: Option<String>,
    handler: Option<Arc<dyn ControlHandler>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
}

impl SessionBuilder {
    /// サービスが決めた id を使う（省略時は生成）
    pub fn id(mut self, id: SessionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// この Session の Control に使う handler
    pub fn handler(mut self, handler: Arc<dyn ControlHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// この Session の instance が使う backend
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Session {
        let ids = UlidGenerator::new(SystemClock);
        let id = self.id.unwrap_or_else(|| ids.generate_session_id());
        let name = self.name.unwrap_or_else(|| id.to_string());
        Session {
            inner: Arc::new(SessionInner {
                id,
                name,
                handler: self.handler,
                backend: self.backend,
                ids,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }
}
