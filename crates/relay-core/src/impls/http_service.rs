//! HttpTaskService - reqwest による TaskService 実装
//!
//! JSON over HTTP。すべてのリクエストに bearer token と（設定されていれば）
//! `X-Organization-Id` を付ける。`inputs` / `result` は JSON 文字列を base64 に
//! したものとして運ぶ。
//!
//! # ステータスコードの対応
//! - 409 → `ExecutionConflict`（本文の `active_execution_id`）
//! - 403 → `SessionOwnership`
//! - 404 → `NotFound`（取得系は `Ok(None)`）
//! - それ以外・接続失敗 → `Backend`
//!
//! サーバープッシュは使わず、購読は `get_execution` / `get_instance` の
//! ポーリングで合成する。受信側が drop されるか、失敗が続いたらポーリングをやめる。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ServiceSettings;
use crate::domain::payload;
use crate::domain::{
    ClientId, ExecutionId, ExecutionRecord, ExecutionUpdate, InstanceId, InstanceRecord,
    InstanceRegistration, InstanceUpdate, LogRecord, OutcomeStatus, SessionId, TaskOutcome,
    TaskRecord, TaskRegistration,
};
use crate::error::{TaskError, TaskFailure};
use crate::ports::{Subscription, TaskService};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_POLL_FAILURES: u32 = 10;
const ORGANIZATION_HEADER: &str = "X-Organization-Id";

/// エラー本文から取れなかった値を補うための呼び出し文脈
#[derive(Debug, Default, Clone, Copy)]
struct ErrorContext<'a> {
    instance_id: Option<&'a str>,
    session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct HttpTaskService {
    client: Client,
    base_url: Url,
    access_token: String,
    organization_id: Option<String>,
    poll_interval: Duration,
}

impl HttpTaskService {
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self, TaskError> {
        let base_url = settings
            .api_url
            .clone()
            .ok_or_else(|| TaskError::Configuration("service.api_url is not set".into()))?;
        let access_token = settings
            .access_token
            .clone()
            .ok_or_else(|| TaskError::Configuration("service.access_token is not set".into()))?;
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                TaskError::Configuration(format!("service.api_url '{base_url}' is not a base URL"))
            })?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TaskError::backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            access_token,
            organization_id: settings.organization_id.clone(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// base URL のパスの後ろにセグメントを足す。各セグメントはエスケープされる
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// 本文がなければ `Ok(None)`。404 は `Err(NotFound)`
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        ctx: ErrorContext<'_>,
    ) -> Result<Option<Value>, TaskError> {
        let path = url.path().to_string();
        let mut builder = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.access_token);
        if let Some(org) = &self.organization_id {
            builder = builder.header(ORGANIZATION_HEADER, org);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TaskError::backend(format!("{method} {path}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TaskError::backend(format!("{method} {path}: {e}")))?;
        debug!(%method, path = %path, status = status.as_u16(), "task service call");

        if !status.is_success() {
            return Err(error_for(status, &text, &path, ctx));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| TaskError::backend(format!("{method} {path}: invalid JSON response: {e}")))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        ctx: ErrorContext<'_>,
        encoded: &[&str],
    ) -> Result<T, TaskError> {
        let path = url.path().to_string();
        let value = self
            .request(method, url, body, ctx)
            .await?
            .ok_or_else(|| TaskError::backend(format!("{path}: empty response")))?;
        parse(decode_fields(value, encoded)?)
    }

    /// 404 を `None` にする取得
    async fn find<T: DeserializeOwned>(
        &self,
        url: Url,
        ctx: ErrorContext<'_>,
        encoded: &[&str],
    ) -> Result<Option<T>, TaskError> {
        match self.fetch(Method::GET, url, None, ctx, encoded).await {
            Ok(v) => Ok(Some(v)),
            Err(TaskError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

const EXECUTION_PAYLOADS: &[&str] = &["/result"];
const INSTANCE_PAYLOADS: &[&str] = &["/inputs", "/outcome/result"];

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, TaskError> {
    serde_json::from_value(value).map_err(|e| TaskError::backend(format!("unexpected response: {e}")))
}

/// JSON pointer が指す base64 文字列をデコードした JSON に置き換える
fn decode_fields(mut value: Value, pointers: &[&str]) -> Result<Value, TaskError> {
    for pointer in pointers {
        if let Some(slot) = value.pointer_mut(pointer)
            && let Value::String(encoded) = slot
        {
            let decoded = payload::decode(encoded)?;
            *slot = decoded;
        }
    }
    Ok(value)
}

fn to_body<T: Serialize>(body: &T) -> Result<Value, TaskError> {
    serde_json::to_value(body).map_err(|e| TaskError::Input(e.to_string()))
}

#[derive(Serialize)]
struct InstanceBody {
    instance_id: InstanceId,
    session_id: SessionId,
    task_name: String,
    task_version: String,
    #[serde(with = "payload::optional")]
    inputs: Option<Value>,
}

#[derive(Serialize)]
struct CompleteBody {
    result: payload::Encoded,
}

#[derive(Serialize)]
struct OutcomeBody {
    status: OutcomeStatus,
    #[serde(with = "payload::optional")]
    result: Option<Value>,
    error: Option<TaskFailure>,
}

#[derive(Deserialize)]
struct InputsBody {
    #[serde(with = "payload::optional", default)]
    inputs: Option<Value>,
}

fn error_for(status: StatusCode, body: &str, path: &str, ctx: ErrorContext<'_>) -> TaskError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let field = |name: &str| parsed.get(name).and_then(Value::as_str).map(str::to_string);
    let message = field("message")
        .or_else(|| field("error"))
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::CONFLICT => TaskError::ExecutionConflict {
            instance_id: field("instance_id")
                .or_else(|| ctx.instance_id.map(str::to_string))
                .unwrap_or_default(),
            active_execution_id: field("active_execution_id").unwrap_or_default(),
        },
        StatusCode::FORBIDDEN => TaskError::SessionOwnership {
            session_id: field("session_id")
                .or_else(|| ctx.session_id.map(str::to_string))
                .unwrap_or_default(),
            instance_id: field("instance_id")
                .or_else(|| ctx.instance_id.map(str::to_string))
                .unwrap_or_default(),
        },
        StatusCode::NOT_FOUND => TaskError::NotFound(if message.is_empty() {
            path.to_string()
        } else {
            message
        }),
        other => TaskError::Backend(format!("HTTP {} from {path}: {message}", other.as_u16())),
    }
}

fn instance_ctx(instance_id: &InstanceId) -> ErrorContext<'_> {
    ErrorContext {
        instance_id: Some(instance_id.as_str()),
        session_id: None,
    }
}

/// 変化したときだけ送る。受信側が drop されたとき、終端に達したとき、
/// 失敗が `MAX_POLL_FAILURES` 回続いたときに止まる
async fn poll_updates<T, F, Fut>(
    tx: mpsc::Sender<T>,
    first: T,
    interval: Duration,
    is_terminal: fn(&T) -> bool,
    mut poll: F,
) where
    T: Clone + PartialEq + Send,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<T>, TaskError>> + Send,
{
    let mut last = first;
    if tx.send(last.clone()).await.is_err() {
        return;
    }
    let mut delay = interval;
    let mut failures = 0;
    while !is_terminal(&last) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tx.closed() => return,
        }
        match poll().await {
            Ok(Some(update)) => {
                failures = 0;
                delay = interval;
                if update != last {
                    if tx.send(update.clone()).await.is_err() {
                        return;
                    }
                    last = update;
                }
            }
            Ok(None) => return,
            Err(e) => {
                failures += 1;
                if failures >= MAX_POLL_FAILURES {
                    warn!(error = %e, failures, "giving up on subscription polling");
                    return;
                }
                delay = (delay * 2).min(MAX_POLL_BACKOFF);
                debug!(error = %e, retry_in = ?delay, "subscription poll failed");
            }
        }
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn ping(&self) -> Result<(), TaskError> {
        self.request(Method::GET, self.endpoint(&["health"]), None, ErrorContext::default())
            .await
            .map(|_| ())
    }

    async fn upsert_task(&self, registration: TaskRegistration) -> Result<TaskRecord, TaskError> {
        let body = to_body(&registration)?;
        let url = self.endpoint(&["v1", "tasks"]);
        self.fetch(Method::PUT, url, Some(body), ErrorContext::default(), &[])
            .await
    }

    async fn upsert_instance(
        &self,
        registration: InstanceRegistration,
    ) -> Result<InstanceRecord, TaskError> {
        let ctx = ErrorContext {
            instance_id: Some(registration.instance_id.as_str()),
            session_id: Some(registration.session_id.as_str()),
        };
        let body = to_body(&InstanceBody {
            instance_id: registration.instance_id.clone(),
            session_id: registration.session_id.clone(),
            task_name: registration.task_name.clone(),
            task_version: registration.task_version.clone(),
            inputs: registration.inputs.clone(),
        })?;
        let url = self.endpoint(&["v1", "instances"]);
        self.fetch(Method::PUT, url, Some(body), ctx, INSTANCE_PAYLOADS)
            .await
    }

    async fn start_execution(
        &self,
        instance_id: &InstanceId,
        session_id: &SessionId,
        client_id: &ClientId,
        force: bool,
    ) -> Result<ExecutionRecord, TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "executions"]);
        let body = json!({ "session_id": session_id, "client_id": client_id, "force": force });
        let ctx = ErrorContext {
            instance_id: Some(instance_id.as_str()),
            session_id: Some(session_id.as_str()),
        };
        self.fetch(Method::POST, url, Some(body), ctx, EXECUTION_PAYLOADS)
            .await
    }

    async fn check_execution_conflict(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<ExecutionId>, TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "active-execution"]);
        let response: Option<Value> = self.find(url, instance_ctx(instance_id), &[]).await?;
        Ok(response
            .as_ref()
            .and_then(|v| v.get("active_execution_id"))
            .and_then(Value::as_str)
            .map(ExecutionId::from))
    }

    async fn force_stop_execution(
        &self,
        execution_id: &ExecutionId,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        let url = self.endpoint(&["v1", "executions", execution_id.as_str(), "kill"]);
        let body = json!({ "session_id": session_id, "reason": reason });
        let ctx = ErrorContext {
            instance_id: None,
            session_id: Some(session_id.as_str()),
        };
        self.fetch(Method::POST, url, Some(body), ctx, EXECUTION_PAYLOADS)
            .await
    }

    async fn report_progress(
        &self,
        execution_id: &ExecutionId,
        progress: f64,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let url = self.endpoint(&["v1", "executions", execution_id.as_str(), "progress"]);
        let body = json!({ "progress": progress, "status_message": status_message });
        self.request(Method::POST, url, Some(body), ErrorContext::default())
            .await
            .map(|_| ())
    }

    async fn complete_execution(
        &self,
        execution_id: &ExecutionId,
        result: Value,
    ) -> Result<ExecutionRecord, TaskError> {
        let url = self.endpoint(&["v1", "executions", execution_id.as_str(), "complete"]);
        let body = to_body(&CompleteBody {
            result: payload::Encoded(result),
        })?;
        self.fetch(
            Method::POST,
            url,
            Some(body),
            ErrorContext::default(),
            EXECUTION_PAYLOADS,
        )
        .await
    }

    async fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        error: &str,
    ) -> Result<ExecutionRecord, TaskError> {
        let url = self.endpoint(&["v1", "executions", execution_id.as_str(), "fail"]);
        let body = json!({ "error": error });
        self.fetch(
            Method::POST,
            url,
            Some(body),
            ErrorContext::default(),
            EXECUTION_PAYLOADS,
        )
        .await
    }

    async fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, TaskError> {
        let url = self.endpoint(&["v1", "executions", execution_id.as_str()]);
        self.find(url, ErrorContext::default(), EXECUTION_PAYLOADS)
            .await
    }

    async fn validate_session_ownership(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
    ) -> Result<bool, TaskError> {
        let url = self.endpoint(&[
            "v1",
            "sessions",
            session_id.as_str(),
            "instances",
            instance_id.as_str(),
            "ownership",
        ]);
        let ctx = ErrorContext {
            instance_id: Some(instance_id.as_str()),
            session_id: Some(session_id.as_str()),
        };
        let response: Option<Value> = self.find(url, ctx, &[]).await?;
        Ok(response
            .as_ref()
            .and_then(|v| v.get("owned"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn disconnect_client(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
    ) -> Result<usize, TaskError> {
        let url = self.endpoint(&["v1", "clients", client_id.as_str(), "disconnect"]);
        let body = json!({ "session_id": session_id });
        let ctx = ErrorContext {
            instance_id: None,
            session_id: Some(session_id.as_str()),
        };
        let response = self.request(Method::POST, url, Some(body), ctx).await?;
        Ok(response
            .as_ref()
            .and_then(|v| v.get("killed"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn fetch_task_inputs(&self, instance_id: &InstanceId) -> Result<Option<Value>, TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "inputs"]);
        let response: InputsBody = self
            .fetch(Method::GET, url, None, instance_ctx(instance_id), &[])
            .await?;
        Ok(response.inputs.filter(|v| !v.is_null()))
    }

    async fn report_task_outcome(
        &self,
        instance_id: &InstanceId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "outcome"]);
        let body = to_body(&OutcomeBody {
            status: outcome.status,
            result: outcome.result,
            error: outcome.error,
        })?;
        self.request(Method::POST, url, Some(body), instance_ctx(instance_id))
            .await
            .map(|_| ())
    }

    async fn append_log(&self, instance_id: &InstanceId, record: LogRecord) -> Result<(), TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "logs"]);
        let body = to_body(&record)?;
        self.request(Method::POST, url, Some(body), instance_ctx(instance_id))
            .await
            .map(|_| ())
    }

    async fn update_instance_progress(
        &self,
        instance_id: &InstanceId,
        progress: Option<f64>,
        status_message: Option<&str>,
    ) -> Result<(), TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str(), "progress"]);
        let body = json!({ "progress": progress, "status_message": status_message });
        self.request(Method::POST, url, Some(body), instance_ctx(instance_id))
            .await
            .map(|_| ())
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, TaskError> {
        let url = self.endpoint(&["v1", "instances", instance_id.as_str()]);
        self.find(url, instance_ctx(instance_id), INSTANCE_PAYLOADS)
            .await
    }

    async fn execution_updates(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Subscription<ExecutionUpdate>, TaskError> {
        let first = self
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(format!("execution {execution_id}")))?;

        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(poll_updates(
            tx,
            ExecutionUpdate::from(&first),
            self.poll_interval,
            |update: &ExecutionUpdate| update.status.is_terminal(),
            move || {
                let service = service.clone();
                let execution_id = execution_id.clone();
                async move {
                    service
                        .get_execution(&execution_id)
                        .await
                        .map(|record| record.as_ref().map(ExecutionUpdate::from))
                }
            },
        ));
        Ok(Subscription::new(rx))
    }

    async fn instance_updates(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Subscription<InstanceUpdate>, TaskError> {
        let first = self
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(format!("instance {instance_id}")))?;

        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();
        let instance_id = instance_id.clone();
        tokio::spawn(poll_updates(
            tx,
            InstanceUpdate::from(&first),
            self.poll_interval,
            |update: &InstanceUpdate| update.outcome.is_some(),
            move || {
                let service = service.clone();
                let instance_id = instance_id.clone();
                async move {
                    service
                        .get_instance(&instance_id)
                        .await
                        .map(|record| record.as_ref().map(InstanceUpdate::from))
                }
            },
        ));
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionStatus;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn settings() -> ServiceSettings {
        ServiceSettings {
            api_url: Some("https://tasks.example/".into()),
            access_token: Some("secret".into()),
            organization_id: Some("org-1".into()),
        }
    }

    #[test]
    fn credentials_are_required() {
        let mut s = settings();
        s.access_token = None;
        assert!(matches!(
            HttpTaskService::from_settings(&s),
            Err(TaskError::Configuration(_))
        ));
        let mut s = settings();
        s.api_url = None;
        assert!(matches!(
            HttpTaskService::from_settings(&s),
            Err(TaskError::Configuration(_))
        ));
    }

    #[test]
    fn endpoints_extend_the_base_path() {
        let svc = HttpTaskService::from_settings(&settings()).unwrap();
        assert_eq!(
            svc.endpoint(&["v1", "tasks"]).as_str(),
            "https://tasks.example/v1/tasks"
        );

        let mut s = settings();
        s.api_url = Some("https://tasks.example/api/".into());
        let svc = HttpTaskService::from_settings(&s).unwrap();
        assert_eq!(
            svc.endpoint(&["v1", "instances", "session-1:add:17"]).as_str(),
            "https://tasks.example/api/v1/instances/session-1:add:17"
        );
        assert_eq!(
            svc.endpoint(&["v1", "instances", "a b/c"]).path(),
            "/api/v1/instances/a%20b%2Fc"
        );
    }

    #[test]
    fn api_url_must_be_a_base_url() {
        let mut s = settings();
        s.api_url = Some("not a url".into());
        assert!(matches!(
            HttpTaskService::from_settings(&s),
            Err(TaskError::Configuration(_))
        ));
    }

    #[test]
    fn conflict_carries_the_active_execution() {
        let err = error_for(
            StatusCode::CONFLICT,
            r#"{"active_execution_id": "exec-9"}"#,
            "/v1/instances/i/executions",
            ErrorContext {
                instance_id: Some("i"),
                session_id: None,
            },
        );
        match err {
            TaskError::ExecutionConflict {
                instance_id,
                active_execution_id,
            } => {
                assert_eq!(instance_id, "i");
                assert_eq!(active_execution_id, "exec-9");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case(StatusCode::FORBIDDEN, "SessionOwnershipError")]
    #[case(StatusCode::NOT_FOUND, "NotFound")]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "BackendError")]
    #[case(StatusCode::UNAUTHORIZED, "BackendError")]
    fn status_codes_map_to_error_classes(#[case] status: StatusCode, #[case] kind: &str) {
        let err = error_for(status, "{}", "/x", ErrorContext::default());
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn payload_fields_are_decoded_in_place() {
        let raw = json!({
            "inputs": payload::encode(&json!({"a": 1})).unwrap(),
            "outcome": { "status": "completed", "result": payload::encode(&json!(5)).unwrap() },
        });
        let decoded = decode_fields(raw, INSTANCE_PAYLOADS).unwrap();
        assert_eq!(decoded["inputs"], json!({"a": 1}));
        assert_eq!(decoded["outcome"]["result"], json!(5));

        let untouched = decode_fields(json!({"result": null}), EXECUTION_PAYLOADS).unwrap();
        assert_eq!(untouched["result"], Value::Null);
    }

    /// テスト用の最小の HTTP サーバーが受け取ったリクエスト
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Value,
    }

    type Route = fn(&str, &str, &Value) -> (u16, Value);

    /// 1 接続 1 リクエストで応答するサーバーを立て、そこを指す service を返す
    async fn serve(route: Route) -> (HttpTaskService, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut stream).await;
                    let (status, body) = route(&request.method, &request.path, &request.body);
                    log.lock().unwrap().push(request);
                    let body = if body.is_null() { String::new() } else { body.to_string() };
                    let reason = StatusCode::from_u16(status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("");
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let mut svc = HttpTaskService::from_settings(&ServiceSettings {
            api_url: Some(format!("http://{addr}/api")),
            access_token: Some("secret".into()),
            organization_id: Some("org-1".into()),
        })
        .unwrap()
        .with_poll_interval(Duration::from_millis(10));
        svc.client = Client::builder().no_proxy().build().unwrap();
        (svc, seen)
    }

    async fn read_request(stream: &mut TcpStream) -> Seen {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the headers ended");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap().split(' ');
        let method = request_line.next().unwrap().to_string();
        let path = request_line.next().unwrap().to_string();
        let headers: HashMap<String, String> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the body ended");
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = serde_json::from_slice(&buf[header_end..header_end + length]).unwrap_or(Value::Null);
        Seen {
            method,
            path,
            headers,
            body,
        }
    }

    fn execution_json(id: &str, status: &str, result: Value) -> Value {
        json!({
            "id": id,
            "instance_id": "s:add:1",
            "session_id": "s",
            "client_id": "c",
            "status": status,
            "started_at": "2026-01-01T00:00:00Z",
            "result": result,
        })
    }

    #[tokio::test]
    async fn requests_carry_credentials_and_base64_payloads() {
        let (svc, seen) = serve(|method, path, body| match (method, path) {
            ("GET", "/api/health") => (200, Value::Null),
            ("POST", "/api/v1/executions/exec-1/complete") => {
                (200, execution_json("exec-1", "completed", body["result"].clone()))
            }
            ("GET", "/api/v1/instances/s:add:1/inputs") => (
                200,
                json!({ "inputs": payload::encode(&json!({"a": 1, "b": 2})).unwrap() }),
            ),
            ("POST", "/api/v1/instances/s:add:1/outcome") => (200, Value::Null),
            _ => (404, json!({ "message": "no route" })),
        })
        .await;
        let instance_id = InstanceId::from("s:add:1");

        svc.ping().await.unwrap();
        let record = svc
            .complete_execution(&ExecutionId::from("exec-1"), json!({"sum": 3}))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.result, Some(json!({"sum": 3})));
        assert_eq!(
            svc.fetch_task_inputs(&instance_id).await.unwrap(),
            Some(json!({"a": 1, "b": 2}))
        );
        svc.report_task_outcome(&instance_id, TaskOutcome::completed(json!(3)))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 4);
        for request in &seen {
            assert_eq!(request.headers["authorization"], "Bearer secret");
            assert_eq!(request.headers["x-organization-id"], "org-1");
        }
        let sent_result = seen[1].body["result"].as_str().unwrap();
        assert_eq!(payload::decode(sent_result).unwrap(), json!({"sum": 3}));
        assert_eq!(seen[3].body["status"], "completed");
        assert_eq!(
            payload::decode(seen[3].body["result"].as_str().unwrap()).unwrap(),
            json!(3)
        );
    }

    #[tokio::test]
    async fn error_statuses_become_typed_errors() {
        let (svc, _seen) = serve(|method, path, _| match (method, path) {
            ("POST", "/api/v1/instances/s:add:1/executions") => {
                (409, json!({ "active_execution_id": "exec-9" }))
            }
            ("POST", "/api/v1/executions/exec-9/kill") => (403, json!({ "message": "not yours" })),
            ("PUT", "/api/v1/tasks") => (500, json!({ "error": "boom" })),
            _ => (404, Value::Null),
        })
        .await;
        let instance_id = InstanceId::from("s:add:1");
        let session_id = SessionId::from_string("intruder");

        match svc
            .start_execution(&instance_id, &session_id, &ClientId::from_string("c"), false)
            .await
        {
            Err(TaskError::ExecutionConflict {
                instance_id,
                active_execution_id,
            }) => {
                assert_eq!(instance_id, "s:add:1");
                assert_eq!(active_execution_id, "exec-9");
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        match svc
            .force_stop_execution(&ExecutionId::from("exec-9"), &session_id, "stop")
            .await
        {
            Err(TaskError::SessionOwnership { session_id, .. }) => {
                assert_eq!(session_id, "intruder");
            }
            other => panic!("expected an ownership error, got {other:?}"),
        }

        assert!(svc.get_instance(&instance_id).await.unwrap().is_none());
        let err = svc
            .upsert_task(TaskRegistration {
                name: "add".into(),
                version: "1".into(),
                function_name: "add".into(),
                module: "demo".into(),
                parameters: None,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BackendError");
        assert!(err.to_string().contains("boom"));
    }

    static EXECUTION_POLLS: AtomicUsize = AtomicUsize::new(0);

    #[tokio::test]
    async fn execution_updates_are_polled_until_terminal() {
        let (svc, _seen) = serve(|_, path, _| match path {
            "/api/v1/executions/exec-2" => {
                let status = match EXECUTION_POLLS.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => "running",
                    _ => "completed",
                };
                (200, execution_json("exec-2", status, Value::Null))
            }
            _ => (404, Value::Null),
        })
        .await;

        let mut updates = svc
            .execution_updates(&ExecutionId::from("exec-2"))
            .await
            .unwrap();
        let mut statuses = Vec::new();
        while let Some(update) = updates.recv().await {
            statuses.push(update.status);
        }
        assert_eq!(
            statuses,
            [ExecutionStatus::Running, ExecutionStatus::Completed]
        );
    }

    #[tokio::test]
    async fn dropping_a_subscription_stops_the_polling() {
        let (svc, seen) = serve(|_, path, _| match path {
            "/api/v1/executions/exec-3" => (200, execution_json("exec-3", "running", Value::Null)),
            _ => (404, Value::Null),
        })
        .await;

        let mut updates = svc
            .execution_updates(&ExecutionId::from("exec-3"))
            .await
            .unwrap();
        assert!(updates.recv().await.is_some());
        drop(updates);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = seen.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.lock().unwrap().len(), after_drop);
    }

    #[tokio::test]
    async fn polling_gives_up_when_the_service_keeps_failing() {
        let (tx, mut rx) = mpsc::channel(4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let poller = tokio::spawn(poll_updates(
            tx,
            0u32,
            Duration::from_millis(1),
            |_: &u32| false,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<u32>, _>(TaskError::backend("down")) }
            },
        ));

        assert_eq!(rx.recv().await, Some(0));
        tokio::time::timeout(Duration::from_secs(10), poller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), MAX_POLL_FAILURES as usize);
        assert_eq!(rx.recv().await, None);
    }
}
