//! HandlerRegistry - ジョブ名 → Handler の表
//!
//! 起動時に一度だけ組み立て、以後は `Arc` で共有します。
//! 文字列のジョブ名は実行時のコード読み込みではなく、この表の検索キーです。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::job::Job;
use crate::app::JobContext;
use crate::domain::{JobArgs, JobError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for job '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no handler registered for job '{0}'")]
    NotRegistered(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job, H: Handler<J> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(Arc::new(TypedHandler::<J, H>::new(handler)))
    }

    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F) -> Result<(), RegistryError>
    where
        F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.insert(Arc::new(FnHandler::new(name, f)))
    }

    fn insert(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let name = handler.job_name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn DynHandler>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_jobs(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SyncRepository {
        repository: String,
    }

    impl Job for SyncRepository {
        const NAME: &'static str = "test.repository.sync.v1";
    }

    struct SyncHandler;

    #[async_trait]
    impl Handler<SyncRepository> for SyncHandler {
        async fn handle(&self, _ctx: JobContext, job: SyncRepository) -> Result<Value, JobError> {
            Ok(json!({ "synced": job.repository }))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<SyncRepository, _>(SyncHandler).unwrap();

        let handler = registry.get(SyncRepository::NAME).unwrap();
        assert_eq!(handler.job_name(), SyncRepository::NAME);
        assert!(registry.contains(SyncRepository::NAME));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<SyncRepository, _>(SyncHandler).unwrap();
        let result = registry.register::<SyncRepository, _>(SyncHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn fn_handlers_share_the_namespace() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("test.noop", |_ctx, _args| async { Ok(Value::Null) })
            .unwrap();
        registry.register::<SyncRepository, _>(SyncHandler).unwrap();

        assert_eq!(
            registry.registered_jobs(),
            vec!["test.noop".to_string(), SyncRepository::NAME.to_string()]
        );
        assert!(matches!(
            registry.register_fn("test.noop", |_ctx, _args| async { Ok(Value::Null) }),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn missing_handler_is_reported_by_name() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.require("nope").err(),
            Some(RegistryError::NotRegistered("nope".into()))
        );
    }
}
