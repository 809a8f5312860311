//! Ports - 抽象化レイヤー
//!
//! 外部のタスクサービスや時刻・ID 生成への依存を trait で切り離す。
//! 実装は `impls` に置く。

pub mod clock;
pub mod id_generator;
pub mod task_service;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_service::{Subscription, TaskService};
