//! tether-core
//!
//! Resource-reserving task dispatcher: tasks that touch the same named
//! resource never run at the same time, work is spread across worker
//! processes, and a crashed worker or dispatcher is detected and cleaned up.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, worker, resource, lock, envelope, errors）
//! - **ports**: 抽象化レイヤー（Store, MessageQueue, Clock, IdGenerator, Janitor）
//! - **impls**: in-memory 実装（InMemoryStore, InMemoryMessageQueue, NoopJanitor）
//! - **typed**: 登録済みハンドラの表（Job, Handler, HandlerRegistry）
//! - **app**: コンポーネントとワイヤリング（AppBuilder, Tasking, DispatchLoop, ...）
//! - **config**: TaskingConfig
//! - **error**: TetherError

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{AppBuilder, JobContext, Submission, TaskHandle, Tasking};
pub use config::TaskingConfig;
pub use error::TetherError;
