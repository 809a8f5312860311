//! TaskDefinition - ユーザー関数と設定をまとめた不変オブジェクト
//!
//! # 作り方
//! - 設定なし: `task("add", add)`
//! - 設定あり: `TaskDefinition::builder("add").max_parallel(2).param::<i64>("a").build(add)`
//! - Control を受け取る関数は `build_with_control` で作る（`expects_control = true`）
//!
//! # 学習ポイント
//! - 型付きの関数 `Fn(I) -> Result<O, E>` を JSON の世界の `TaskFn` に型消去する
//! - 引数の束縛（位置引数 → 名前、デフォルト値）は descriptor の parameter 宣言に従う
//! - `Any` で `TaskError` をそのまま通し、それ以外は `TaskFailure` に包む

use std::any::{Any, type_name};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use super::instance::TaskInstance;
use super::session::Session;
use crate::control::{Control, ControlScope, current_handler};
use crate::domain::{InstanceId, Parameter, Size, TaskDescriptor, TaskInputs, resolve_version};
use crate::error::{TaskError, TaskFailure};

/// 型消去されたタスク関数。引数は parameter 名で束縛済み
pub type TaskFn =
    Arc<dyn Fn(&Control, Map<String, Value>) -> Result<Value, TaskError> + Send + Sync>;

/// TaskDefinition は関数 + descriptor
///
/// `Clone` は同じ定義を共有する。
///
/// # 使用例
/// ```ignore
/// #[derive(Deserialize)]
/// struct AddArgs { a: i64, b: i64 }
///
/// let add = TaskDefinition::builder("add")
///     .param::<i64>("a")
///     .param::<i64>("b")
///     .build(|args: AddArgs| Ok::<_, Infallible>(args.a + args.b))?;
///
/// assert_eq!(add.call(TaskInputs::positional(vec![json!(2), json!(3)]))?, json!(5));
/// ```
#[derive(Clone)]
pub struct TaskDefinition {
    descriptor: Arc<TaskDescriptor>,
    func: TaskFn,
}

impl TaskDefinition {
    pub fn builder(function_name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(function_name)
    }

    pub fn descriptor(&self) -> &Arc<TaskDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> &str {
        &self.descriptor.version
    }

    pub fn max_parallel(&self) -> usize {
        self.descriptor.max_parallel
    }

    pub fn expects_control(&self) -> bool {
        self.descriptor.expects_control
    }

    /// 呼び出し元のスレッドで直接実行する
    ///
    /// `max_parallel > 1` の定義は直接呼べない（`instance()?.start(..)` を使う）。
    /// Session が有効な間の直接呼び出しは Session の管理外になるので警告を出す。
    pub fn call(&self, inputs: TaskInputs) -> Result<Value, TaskError> {
        if self.max_parallel() > 1 {
            return Err(TaskError::Usage(format!(
                "task '{}' has max_parallel={} and cannot be called directly; \
                 use `.instance()?.start(..)` instead",
                self.name(),
                self.max_parallel()
            )));
        }
        if let Some(session) = Session::current() {
            warn!(
                task = %self.name(),
                session_id = %session.id(),
                "direct call bypasses session tracking"
            );
        }

        let scope = ControlScope {
            instance_id: InstanceId::from(
                format!("{}-{}", self.name(), ulid::Ulid::new()).as_str(),
            ),
            session_id: None,
            task: self.descriptor.clone(),
        };
        let control = Control::new(scope, current_handler());
        self.invoke(&control, &inputs)
    }

    /// `call` の結果を型に戻す
    pub fn call_as<O: DeserializeOwned>(&self, inputs: TaskInputs) -> Result<O, TaskError> {
        let value = self.call(inputs)?;
        serde_json::from_value(value)
            .map_err(|e| TaskError::Input(format!("result of '{}': {e}", self.name())))
    }

    /// 引数を束縛して関数を呼ぶ（backend から使われる）
    pub fn invoke(&self, control: &Control, inputs: &TaskInputs) -> Result<Value, TaskError> {
        let bound = inputs.bind(&self.descriptor.parameters)?;
        (self.func)(control, bound)
    }

    /// 現在のスレッドの Session に属する instance を作る
    pub fn instance(&self) -> Result<TaskInstance, TaskError> {
        let session = Session::current().ok_or(TaskError::SessionNotFound)?;
        self.instance_in(&session)
    }

    /// 明示した Session に属する instance を作る
    pub fn instance_in(&self, session: &Session) -> Result<TaskInstance, TaskError> {
        let instance_id = session.next_instance_id(self.name());
        TaskInstance::new(self.clone(), session, instance_id)
    }

    /// サービスが決めた instance id を使う（runner 用）
    pub fn instance_with_id(
        &self,
        session: &Session,
        instance_id: InstanceId,
    ) -> Result<TaskInstance, TaskError> {
        TaskInstance::new(self.clone(), session, instance_id)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("max_parallel", &self.descriptor.max_parallel)
            .field("expects_control", &self.descriptor.expects_control)
            .finish()
    }
}

/// 設定なしで定義を作る
pub fn task<I, O, E, F>(function_name: impl Into<String>, f: F) -> Result<TaskDefinition, TaskError>
where
    I: DeserializeOwned,
    O: Serialize,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
{
    TaskBuilder::new(function_name).build(f)
}

/// 関数名と呼び出し元のモジュールパスを埋めた builder を作る
///
/// ```ignore
/// let add = task_builder!(add).param::<i64>("a").param::<i64>("b").build(add)?;
/// ```
#[macro_export]
macro_rules! task_builder {
    ($function:ident) => {
        $crate::task::TaskDefinition::builder(stringify!($function)).module(module_path!())
    };
}

/// TaskBuilder は TaskDefinition の設定
///
/// 不正な設定（`max_parallel = 0`、重複した parameter 名、シリアライズできない
/// デフォルト値）は `build` の時点で `TaskError::Definition` になる。
#[derive(Debug)]
pub struct TaskBuilder {
    function_name: String,
    name: Option<String>,
    module: String,
    doc: Option<String>,
    version: Option<String>,
    max_parallel: usize,
    size: Size,
    parameters: Vec<Parameter>,
    invalid: Option<TaskError>,
}

impl TaskBuilder {
    fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            name: None,
            module: String::new(),
            doc: None,
            version: None,
            max_parallel: 1,
            size: Size::default(),
            parameters: Vec::new(),
            invalid: None,
        }
    }

    /// 表示名（省略時は関数名）
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// 明示的な version。省略時は `local-xxxxxxxx` を導出する
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    /// 必須の parameter。annotation は `T` の型名
    pub fn param<T: ?Sized>(mut self, name: impl Into<String>) -> Self {
        self.parameters
            .push(Parameter::required(name, type_name::<T>()));
        self
    }

    /// デフォルト値付きの parameter。デフォルトは compact JSON で記録する
    pub fn param_with_default<T: Serialize>(mut self, name: impl Into<String>, default: T) -> Self {
        let name = name.into();
        match serde_json::to_string(&default) {
            Ok(json) => self
                .parameters
                .push(Parameter::with_default(name, type_name::<T>(), json)),
            Err(e) => {
                self.invalid.get_or_insert(TaskError::Definition(format!(
                    "default of parameter '{name}' is not serializable: {e}"
                )));
            }
        }
        self
    }

    /// Control を受け取らない関数で定義を作る
    pub fn build<I, O, E, F>(self, f: F) -> Result<TaskDefinition, TaskError>
    where
        I: DeserializeOwned,
        O: Serialize,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    {
        let task_name = self.display_name();
        let func: TaskFn = Arc::new(move |_control: &Control, args: Map<String, Value>| {
            let input = decode_args::<I>(&task_name, args)?;
            encode_output(&task_name, f(input))
        });
        self.finish(false, func)
    }

    /// 第 1 引数に Control を受け取る関数で定義を作る
    pub fn build_with_control<I, O, E, F>(self, f: F) -> Result<TaskDefinition, TaskError>
    where
        I: DeserializeOwned,
        O: Serialize,
        E: std::error::Error + Send + Sync + 'static,
        F: Fn(&Control, I) -> Result<O, E> + Send + Sync + 'static,
    {
        let task_name = self.display_name();
        let func: TaskFn = Arc::new(move |control: &Control, args: Map<String, Value>| {
            let input = decode_args::<I>(&task_name, args)?;
            encode_output(&task_name, f(control, input))
        });
        self.finish(true, func)
    }

    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.function_name.clone())
    }

    fn finish(self, expects_control: bool, func: TaskFn) -> Result<TaskDefinition, TaskError> {
        if let Some(invalid) = self.invalid {
            return Err(invalid);
        }
        if self.function_name.trim().is_empty() {
            return Err(TaskError::Definition("function name must not be empty".into()));
        }
        // instance id は `{session}:{task}:{counter}` なので task 名に `:` は使えない
        if self.display_name().contains(':') {
            return Err(TaskError::Definition(format!(
                "task name '{}' must not contain ':'",
                self.display_name()
            )));
        }
        if self.max_parallel == 0 {
            return Err(TaskError::Definition(format!(
                "max_parallel of '{}' must be at least 1",
                self.function_name
            )));
        }
        let mut seen = HashSet::new();
        for parameter in &self.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(TaskError::Definition(format!(
                    "parameter '{}' of '{}' is declared twice",
                    parameter.name, self.function_name
                )));
            }
        }

        let name = self.display_name();
        let version = resolve_version(
            self.version.as_deref(),
            &self.function_name,
            &self.module,
            self.doc.as_deref(),
            &self.parameters,
        );
        Ok(TaskDefinition {
            descriptor: Arc::new(TaskDescriptor {
                name,
                version,
                function_name: self.function_name,
                module: self.module,
                doc: self.doc,
                parameters: self.parameters,
                max_parallel: self.max_parallel,
                size: self.size,
                expects_control,
            }),
            func,
        })
    }
}

/// 束縛済みの引数を `I` に戻す。空の引数は `null` としても試す（`()` 用）
fn decode_args<I: DeserializeOwned>(task: &str, args: Map<String, Value>) -> Result<I, TaskError> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Object(args)) {
        Ok(input) => Ok(input),
        Err(_) if empty => serde_json::from_value(Value::Null)
            .map_err(|e| TaskError::Input(format!("arguments of '{task}': {e}"))),
        Err(e) => Err(TaskError::Input(format!("arguments of '{task}': {e}"))),
    }
}

fn encode_output<O, E>(task: &str, output: Result<O, E>) -> Result<Value, TaskError>
where
    O: Serialize,
    E: std::error::Error + Send + Sync + 'static,
{
    let output = output.map_err(into_task_error)?;
    serde_json::to_value(output).map_err(|e| {
        TaskFailure::new("SerializationError", format!("result of '{task}': {e}")).into()
    })
}

fn into_task_error<E>(err: E) -> TaskError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(task_error) = (&err as &dyn Any).downcast_ref::<TaskError>() {
        return task_error.clone();
    }
    TaskFailure::from_error(err).into()
}
