//! TaskService port - リモートのタスクサービスへのインターフェース
//!
//! サービスは task / instance / execution の正本（source of truth）。
//! SDK 側は id とレスポンスを解釈するだけで、クライアント間の整合は取らない。
//!
//! # 実装
//! - **InMemoryTaskService**: プロセス内の完全な実装（開発・テスト用）
//! - **HttpTaskService**: reqwest による JSON over HTTP
//!
//! # エラー
//! - 409 相当 → `TaskError::ExecutionConflict`（active_execution_id 付き）
//! - 403 相当 → `TaskError::SessionOwnership`
//! - 404 相当 → `TaskError::NotFound`（操作によっては `Ok(None)`）
//! - それ以外の通信エラー → `TaskError::Backend`

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::{
    ClientId, ExecutionId, ExecutionRecord, ExecutionUpdate, InstanceId, InstanceRecord,
    InstanceRegistration, InstanceUpdate, LogRecord, SessionId, TaskOutcome, TaskRecord,
    TaskRegistration,
};
use crate::error::TaskError;

/// TaskService はタスク実行レイヤーが使うサービス操作の集合
///
/// # Thread Safety
/// - `Send + Sync` を要求（`Arc<dyn TaskService>` で共有される）
#[async_trait]
pub trait TaskService: Send + Sync {
    /// 到達性の確認。RemoteHandler の構築時に使う
    async fn ping(&self) -> Result<(), TaskError>;

    /// `(name, version)` で冪等に登録
    async fn upsert_task(&self, registration: TaskRegistration) -> Result<TaskRecord, TaskError>;

    /// instance id で冪等に登録
    async fn upsert_instance(
        &self,
        registration: InstanceRegistration,
    ) -> Result<InstanceRecord, TaskError>;

    /// 新しい execution を作成
    ///
    /// running の execution が既にあれば `force=false` は conflict、
    /// `force=true` は既存を killed にしてから作成する。
    async fn start_execution(
        &self,
        instance_id: &InstanceId,
        session_id: &SessionId,
        client_id: &ClientId,
        force: bool,
    ) -> Result<ExecutionRecord, TaskError>;

    async fn check_execution_conflict(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<ExecutionId>, TaskError>;

    async fn force_stop_execution(
        &self,
        execution_id: &ExecutionId,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<ExecutionRecord, TaskError>;

    async fn report_progress(
        &self,
        execution_id: &ExecutionId,
        progress: f64,
        status_message: Option<&str>,
    ) -> Result<(), TaskError>;

    async fn complete_execution(
        &self,
        execution_id: &ExecutionId,
        result: Value,
    ) -> Result<ExecutionRecord, TaskError>;

    async fn fail_execution(
        &self,
        execution_id: &ExecutionId,
        error: &str,
    ) -> Result<ExecutionRecord, TaskError>;

    async fn get_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, TaskError>;

    /// instance が存在しなければ `Ok(false)`、別 session の instance なら
    /// `Err(SessionOwnership)`、一致すれば `Ok(true)`
    async fn validate_session_ownership(
        &self,
        session_id: &SessionId,
        instance_id: &InstanceId,
    ) -> Result<bool, TaskError>;

    /// client の running execution をすべて kill し、その数を返す
    async fn disconnect_client(
        &self,
        client_id: &ClientId,
        session_id: &SessionId,
    ) -> Result<usize, TaskError>;

    async fn fetch_task_inputs(&self, instance_id: &InstanceId) -> Result<Option<Value>, TaskError>;

    async fn report_task_outcome(
        &self,
        instance_id: &InstanceId,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError>;

    async fn append_log(&self, instance_id: &InstanceId, record: LogRecord) -> Result<(), TaskError>;

    /// execution に紐付かない progress / status の更新
    async fn update_instance_progress(
        &self,
        instance_id: &InstanceId,
        progress: Option<f64>,
        status_message: Option<&str>,
    ) -> Result<(), TaskError>;

    async fn get_instance(&self, instance_id: &InstanceId)
    -> Result<Option<InstanceRecord>, TaskError>;

    /// 未対応の実装は `Subscription::empty()` を返してよい
    async fn execution_updates(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Subscription<ExecutionUpdate>, TaskError>;

    async fn instance_updates(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Subscription<InstanceUpdate>, TaskError>;
}

/// Subscription はサーバーから届く更新の遅延シーケンス
///
/// 送信側が閉じると終わる。同期コードからは `Iterator` として、
/// async コードからは [`Subscription::recv`] で読む。
///
/// `Iterator::next` はスレッドをブロックするので async コンテキストでは使わないこと。
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// 何も流れない Subscription
    pub fn empty() -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_subscription_ends_immediately() {
        let mut sub: Subscription<u32> = Subscription::empty();
        assert_eq!(sub.next(), None);
    }

    #[test]
    fn subscription_iterates_until_sender_closes() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        drop(tx);
        let items: Vec<u32> = Subscription::new(rx).collect();
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn subscription_recv_in_async_code() {
        let (tx, rx) = mpsc::channel(1);
        let mut sub = Subscription::new(rx);
        tokio::spawn(async move {
            let _ = tx.send("update").await;
        });
        assert_eq!(sub.recv().await, Some("update"));
        assert_eq!(sub.recv().await, None);
    }
}
