//! Handler trait - ジョブを実行する Handler の定義
//!
//! - `Handler<J>`: 型付き（表層）
//! - `DynHandler`: object-safe（内部、HashMap に格納する側）
//! - `TypedHandler<J, H>` / `FnHandler<F>`: 両者をつなぐ type erasure

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::job::Job;
use crate::app::JobContext;
use crate::domain::{JobArgs, JobError};

/// Handler は Job を実行して結果（JSON）を返す
///
/// # ジェネリクスによる型安全性
/// - `Handler<SyncRepository>` は `SyncRepository` しか受け取れない
#[async_trait]
pub trait Handler<J: Job>: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: J) -> Result<Value, JobError>;
}

/// DynHandler は object-safe な Handler の抽象化
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Value, JobError>;
    fn job_name(&self) -> &str;
}

pub struct TypedHandler<J: Job, H: Handler<J>> {
    handler: H,
    _marker: PhantomData<J>,
}

impl<J: Job, H: Handler<J>> TypedHandler<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

/// Typed jobs travel as keyword arguments; a lone positional argument is
/// accepted as the whole payload.
pub(crate) fn decode_args<J: Job>(args: JobArgs) -> Result<J, JobError> {
    let payload = match (args.args.len(), args.kwargs.is_empty()) {
        (1, true) => args.args.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Object(args.kwargs),
    };
    serde_json::from_value(payload).map_err(|e| {
        JobError::new(format!("cannot decode arguments for {}: {e}", J::NAME))
            .with_code("invalid_args")
    })
}

#[async_trait]
impl<J: Job, H: Handler<J>> DynHandler for TypedHandler<J, H> {
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Value, JobError> {
        let job: J = decode_args(args)?;
        self.handler.handle(ctx, job).await
    }

    fn job_name(&self) -> &str {
        J::NAME
    }
}

/// Untyped handler built from an async closure over the raw arguments.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(JobContext, JobArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Value, JobError> {
        (self.f)(ctx, args).await
    }

    fn job_name(&self) -> &str {
        &self.name
    }
}
