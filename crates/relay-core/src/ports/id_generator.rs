//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: session / client / execution は Clock の時刻入りの ULID
//! - instance id は generator ごとのミリ秒カウンタから導出（時計が止まっても重複しない）

use std::sync::Mutex;

use ulid::Ulid;

use crate::domain::ids::{ClientId, ExecutionId, InstanceId, SessionId};
use crate::ports::Clock;

/// IdGenerator は SDK が使う ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_session_id(&self) -> SessionId;

    fn generate_client_id(&self) -> ClientId;

    fn generate_execution_id(&self) -> ExecutionId;

    /// `{session_id}:{task_name}:{counter}` を生成（counter は単調増加）
    fn generate_instance_id(&self, session_id: &SessionId, task_name: &str) -> InstanceId;
}

pub struct UlidGenerator<C> {
    clock: C,
    last_counter: Mutex<u64>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            last_counter: Mutex::new(0),
        }
    }

    fn ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }

    /// ミリ秒 timestamp。前回値以下なら前回値 + 1 に繰り上げる
    fn next_counter(&self) -> u64 {
        let now_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let mut last = self.last_counter.lock().unwrap_or_else(|e| e.into_inner());
        let next = now_ms.max(*last + 1);
        *last = next;
        next
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_session_id(&self) -> SessionId {
        SessionId::from(self.ulid())
    }

    fn generate_client_id(&self) -> ClientId {
        ClientId::from(self.ulid())
    }

    fn generate_execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.ulid())
    }

    fn generate_instance_id(&self, session_id: &SessionId, task_name: &str) -> InstanceId {
        InstanceId::compose(session_id.as_str(), task_name, self.next_counter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_session_id();
        let id2 = id_gen.generate_session_id();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("session-"));
        assert!(id_gen.generate_client_id().as_str().starts_with("client-"));
        assert!(id_gen.generate_execution_id().as_str().starts_with("exec-"));
    }

    #[test]
    fn instance_counter_is_monotonic_under_a_frozen_clock() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));
        let session = SessionId::from_string("session-s");

        let a = id_gen.generate_instance_id(&session, "add");
        let b = id_gen.generate_instance_id(&session, "add");

        let ms = fixed_time.timestamp_millis();
        assert_eq!(a.as_str(), format!("session-s:add:{ms}"));
        assert_eq!(b.as_str(), format!("session-s:add:{}", ms + 1));
        assert_eq!(b.session_part(), Some("session-s"));
    }
}
