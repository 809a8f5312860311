//! Impls - ports の実装
//!
//! - **InMemoryTaskService**: 開発・テスト用
//! - **HttpTaskService**: 本番用（reqwest）

pub mod http_service;
pub mod inmem_service;

pub use self::http_service::HttpTaskService;
pub use self::inmem_service::InMemoryTaskService;
