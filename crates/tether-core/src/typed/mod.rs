//! Typed - 登録済みハンドラの表
//!
//! # 二層構造
//! - **表層（Typed）**: `Job` trait, `Handler<J>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod handler;
pub mod job;
pub mod registry;

pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler};
pub use self::job::Job;
pub use self::registry::{HandlerRegistry, RegistryError};
