//! Runner - サービスから起動され、1 つの instance を実行するプロセスの本体
//!
//! # 手順
//! 1. 設定を読み、必須の設定（`task.instance_id`）を確認
//! 2. サービスに接続（届かなければ即失敗）
//! 3. `task.function_name` / `task.manifest_path` を確認し、マニフェストから
//!    TaskRegistry の symbol を引く
//! 4. handler を選ぶ: mock 指定なら MockHandler、Control を使うタスクなら
//!    RemoteHandler、それ以外は LocalHandler
//! 5. サービスから入力を取得
//! 6. Session に入り、instance を作って start、結果を待つ
//! 7. outcome を報告。報告できなければ stderr に JSON を書く
//!
//! どの段階で失敗しても、報告できる限り outcome（sentinel の error_type 付き）を報告する。

pub mod manifest;

use std::env;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, LocalBackend};
use crate::client::ServiceClient;
use crate::config::{Settings, env_var_name};
use crate::control::{ControlHandler, LocalHandler, MockHandler, RemoteHandler};
use crate::domain::{InstanceId, OutcomeStatus, TaskInputs, TaskOutcome};
use crate::error::TaskError;
use crate::event_loop::EventLoopThread;
use crate::impls::HttpTaskService;
use crate::ports::TaskService;
use crate::task::{Session, TaskRegistry};

pub use manifest::{CollectionManifest, Manifest, TaskEntry};

/// 設定から TaskService を作る関数
pub type Connector =
    Arc<dyn Fn(&Settings) -> Result<Arc<dyn TaskService>, TaskError> + Send + Sync>;

/// プロセスの終了コード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerExit {
    Completed = 0,
    TaskFailed = 1,
    Configuration = 2,
    Unreachable = 3,
    Manifest = 4,
    Inputs = 5,
    Report = 6,
}

impl RunnerExit {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for RunnerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerExit::Completed => "completed",
            RunnerExit::TaskFailed => "task failed",
            RunnerExit::Configuration => "configuration error",
            RunnerExit::Unreachable => "service unreachable",
            RunnerExit::Manifest => "manifest error",
            RunnerExit::Inputs => "input fetch failed",
            RunnerExit::Report => "outcome report failed",
        };
        f.write_str(s)
    }
}

/// 1 回の run の結果
#[derive(Debug, Clone)]
pub struct RunReport {
    pub instance_id: Option<InstanceId>,
    pub outcome: TaskOutcome,
    pub exit: RunnerExit,
    /// サービスに outcome を報告できたか
    pub reported: bool,
    /// 報告できなかったときに stderr に書いた JSON
    pub envelope: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }
}

struct Failure {
    exit: RunnerExit,
    error: TaskError,
}

fn fail(exit: RunnerExit) -> impl FnOnce(TaskError) -> Failure {
    move |error| Failure { exit, error }
}

pub struct Runner {
    settings: Result<Settings, TaskError>,
    /// 設定を読めなかったときに envelope に載せる instance id
    instance_hint: Option<InstanceId>,
    registry: TaskRegistry,
    connector: Connector,
}

impl Runner {
    /// HTTP で接続する runner
    pub fn new(settings: Settings, registry: TaskRegistry) -> Self {
        Self::with_settings(Ok(settings), None, registry)
    }

    /// 環境変数から設定を読む。読めなくても Runner は作られ、`run` が configuration エラーで終わる
    pub fn from_env(registry: TaskRegistry) -> Self {
        Self::from_lookup(|key| env::var(env_var_name(key)).ok(), registry)
    }

    pub fn from_lookup<F>(lookup: F, registry: TaskRegistry) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let hint = lookup("task.instance_id").filter(|v| !v.trim().is_empty());
        let settings = Settings::from_lookup(&lookup);
        Self::with_settings(settings, hint.as_deref().map(InstanceId::from), registry)
    }

    fn with_settings(
        settings: Result<Settings, TaskError>,
        instance_hint: Option<InstanceId>,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            settings,
            instance_hint,
            registry,
            connector: Arc::new(|settings: &Settings| {
                let service: Arc<dyn TaskService> =
                    Arc::new(HttpTaskService::from_settings(&settings.service)?);
                Ok(service)
            }),
        }
    }

    pub fn with_connector<F>(mut self, connector: F) -> Self
    where
        F: Fn(&Settings) -> Result<Arc<dyn TaskService>, TaskError> + Send + Sync + 'static,
    {
        self.connector = Arc::new(connector);
        self
    }

    pub fn run(&self) -> RunReport {
        let instance_id = match &self.settings {
            Ok(settings) => settings.task.instance_id.as_deref().map(InstanceId::from),
            Err(_) => self.instance_hint.clone(),
        };
        let bridge = Arc::new(EventLoopThread::new("relay-runner"));
        let mut client = None;

        let (mut exit, outcome) = match self.execute(instance_id.as_ref(), &bridge, &mut client) {
            Ok(outcome) => {
                let exit = match outcome.status {
                    OutcomeStatus::Completed => RunnerExit::Completed,
                    OutcomeStatus::Failed => RunnerExit::TaskFailed,
                };
                (exit, outcome)
            }
            Err(Failure { exit, error }) => {
                error!(exit = %exit, error = %error, "runner setup failed");
                (exit, TaskOutcome::failed(error.to_failure()))
            }
        };

        let reported = match (&client, &instance_id) {
            (Some(client), Some(id)) => client.report_task_outcome(id, outcome.clone()),
            _ => Err(TaskError::backend("no service connection to report the outcome")),
        };
        let (reported, envelope) = match reported {
            Ok(()) => (true, None),
            Err(e) => {
                error!(error = %e, "failed to report outcome");
                if matches!(exit, RunnerExit::Completed | RunnerExit::TaskFailed) {
                    exit = RunnerExit::Report;
                }
                (false, Some(write_envelope(instance_id.as_ref(), &outcome, &e)))
            }
        };

        bridge.stop();
        info!(exit = %exit, code = exit.code(), reported, "runner finished");
        RunReport {
            instance_id,
            outcome,
            exit,
            reported,
            envelope,
        }
    }

    fn execute(
        &self,
        instance_id: Option<&InstanceId>,
        bridge: &Arc<EventLoopThread>,
        client_slot: &mut Option<ServiceClient>,
    ) -> Result<TaskOutcome, Failure> {
        let settings = self
            .settings
            .as_ref()
            .map_err(|e| fail(RunnerExit::Configuration)(e.clone()))?;
        let instance_id = instance_id.ok_or_else(|| Failure {
            exit: RunnerExit::Configuration,
            error: TaskError::Configuration("task.instance_id is not set".into()),
        })?;

        let service = (self.connector)(settings).map_err(|e| match e {
            TaskError::Configuration(_) => fail(RunnerExit::Configuration)(e),
            other => fail(RunnerExit::Unreachable)(other),
        })?;
        let client = ServiceClient::new(service, bridge.clone());
        client.ping().map_err(fail(RunnerExit::Unreachable))?;
        *client_slot = Some(client.clone());
        debug!(instance_id = %instance_id, "connected to the task service");

        let function_name = settings.task.function_name.as_deref().ok_or_else(|| Failure {
            exit: RunnerExit::Configuration,
            error: TaskError::Configuration("task.function_name is not set".into()),
        })?;
        let manifest_path = settings.task.manifest_path.as_deref().ok_or_else(|| Failure {
            exit: RunnerExit::Configuration,
            error: TaskError::Configuration("task.manifest_path is not set".into()),
        })?;

        let manifest = Manifest::load(manifest_path).map_err(fail(RunnerExit::Manifest))?;
        let entry = manifest
            .find_task(settings.task.collection_name.as_deref(), function_name)
            .map_err(fail(RunnerExit::Manifest))?;
        let definition = self
            .registry
            .resolve(&entry.decorated_function)
            .map_err(|e| fail(RunnerExit::Manifest)(e.into()))?;

        let handler: Arc<dyn ControlHandler> = if settings.task.mock_remote_logging {
            Arc::new(MockHandler)
        } else if definition.expects_control() {
            Arc::new(RemoteHandler::connect(client.clone()).map_err(fail(RunnerExit::Unreachable))?)
        } else {
            Arc::new(LocalHandler)
        };

        let record = client
            .get_instance(instance_id)
            .map_err(fail(RunnerExit::Inputs))?
            .ok_or_else(|| Failure {
                exit: RunnerExit::Inputs,
                error: TaskError::NotFound(format!("instance {instance_id}")),
            })?;
        let inputs = match client
            .fetch_task_inputs(instance_id)
            .map_err(fail(RunnerExit::Inputs))?
        {
            Some(value) => TaskInputs::from_value(value).map_err(fail(RunnerExit::Inputs))?,
            None => TaskInputs::new(),
        };

        let backend = Arc::new(LocalBackend::new(1).map_err(fail(RunnerExit::Configuration))?);
        let session = Session::builder()
            .id(record.session_id.clone())
            .name(format!("runner {instance_id}"))
            .handler(handler.clone())
            .backend(backend.clone())
            .build();
        info!(
            instance_id = %instance_id,
            task = %definition.name(),
            handler = handler.name(),
            "running task"
        );

        let outcome = {
            let _guard = session.enter().map_err(fail(RunnerExit::Configuration))?;
            let result = definition
                .instance_with_id(&session, instance_id.clone())
                .and_then(|instance| instance.start(inputs))
                .and_then(|future| future.result(None));
            match result {
                Ok(value) => TaskOutcome::completed(value),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "task failed");
                    TaskOutcome::failed(e.to_failure())
                }
            }
        };
        backend.shutdown(true);
        Ok(outcome)
    }
}

/// 最後の手段として outcome を stderr に書く
fn write_envelope(
    instance_id: Option<&InstanceId>,
    outcome: &TaskOutcome,
    reason: &TaskError,
) -> String {
    let envelope = json!({
        "instance_id": instance_id.map(InstanceId::as_str),
        "outcome": outcome,
        "report_error": reason.to_string(),
    })
    .to_string();
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{envelope}");
    envelope
}
