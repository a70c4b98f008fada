#[cfg(test)]
mod tests {
    use crate::domain::models::task::{Task, TaskContext, TaskStatus, TaskType};
    use crate::domain::services::provider_gateway::{ProviderError, ProviderGateway};
    use crate::infrastructure::repositories::task_repo_impl::TaskRepositoryImpl;
    use crate::queue::dispatcher::{BulkOutcome, DispatcherConfig, QueueDispatcher};
    use crate::queue::rate_limiter::{ProviderLimits, RateLimiter};
    use crate::queue::task_queue::{NewTask, QueueError, TaskQueue};
    use crate::utils::retry_policy::RetryPolicy;
    use async_trait::async_trait;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, DatabaseConnection};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// 按脚本逐次返回结果的网关桩；脚本耗尽后恒返回成功
    struct ScriptedGateway {
        responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    }

    impl ScriptedGateway {
        fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }

        fn always_ok() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl ProviderGateway for ScriptedGateway {
        async fn invoke(
            &self,
            _tenant_id: Uuid,
            _provider: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, ProviderError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("done".to_string()))
        }

        async fn has_credential(&self, _tenant_id: Uuid, _provider: &str) -> bool {
            true
        }
    }

    async fn setup_db() -> Arc<DatabaseConnection> {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let db = Arc::new(db);
        Migrator::up(db.as_ref(), None).await.unwrap();
        db
    }

    fn test_limiter(rpm: u32) -> Arc<RateLimiter> {
        let mut defaults = HashMap::new();
        defaults.insert(
            "demo".to_string(),
            ProviderLimits {
                requests_per_minute: rpm,
                tokens_per_minute: 1_000_000,
            },
        );
        Arc::new(RateLimiter::new(defaults, ProviderLimits::default()))
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            invoke_timeout: Duration::from_secs(1),
            batch_size: 50,
            retention: chrono::Duration::days(30),
        }
    }

    async fn make_dispatcher(
        db: Arc<DatabaseConnection>,
        gateway: ScriptedGateway,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
    ) -> Arc<QueueDispatcher<TaskRepositoryImpl>> {
        QueueDispatcher::new(
            Arc::new(TaskRepositoryImpl::new(db)),
            rate_limiter,
            Arc::new(gateway),
            retry_policy,
            test_config(),
        )
    }

    fn translation_task(tenant_id: Uuid) -> NewTask {
        NewTask {
            tenant_id,
            task_type: TaskType::Translation,
            provider: "demo".to_string(),
            prompt: "Translate the product description to French".to_string(),
            estimated_tokens: 100,
            context: TaskContext::Translation {
                resource_type: "product".to_string(),
                resource_id: "gid://shop/Product/42".to_string(),
                resource_title: Some("Blue Shirt".to_string()),
                field_type: Some("description".to_string()),
                target_locale: "fr".to_string(),
            },
        }
    }

    fn bulk_task(tenant_id: Uuid, locales: &[&str]) -> NewTask {
        NewTask {
            tenant_id,
            task_type: TaskType::TranslationBulk,
            provider: "demo".to_string(),
            prompt: "Translate the product description".to_string(),
            estimated_tokens: 300,
            context: TaskContext::TranslationBulk {
                resource_type: "product".to_string(),
                resource_id: "gid://shop/Product/42".to_string(),
                resource_title: None,
                field_type: Some("description".to_string()),
                target_locales: locales.iter().map(|l| l.to_string()).collect(),
            },
        }
    }

    /// 轮询等待任务满足条件，超时即失败
    async fn wait_for<Q, F>(queue: &Q, id: Uuid, pred: F) -> Task
    where
        Q: TaskQueue,
        F: Fn(&Task) -> bool,
    {
        for _ in 0..300 {
            let task = queue.get_status(id).await.unwrap();
            if pred(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met for task {}", id);
    }

    #[tokio::test]
    async fn test_submit_validates_and_persists_pending_task() {
        let db = setup_db().await;
        let dispatcher = make_dispatcher(
            db,
            ScriptedGateway::always_ok(),
            test_limiter(1000),
            RetryPolicy::default(),
        )
        .await;
        let tenant = Uuid::new_v4();

        let id = dispatcher.submit(translation_task(tenant)).await.unwrap();
        let task = dispatcher.get_status(id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 10);
        assert_eq!(task.provider, "demo");
        assert!(task.expires_at.is_some());

        // 空 prompt 被拒绝
        let mut invalid = translation_task(tenant);
        invalid.prompt = String::new();
        assert!(matches!(
            dispatcher.submit(invalid).await.unwrap_err(),
            QueueError::Validation(_)
        ));

        // 批量任务必须携带目标语言
        let empty_bulk = bulk_task(tenant, &[]);
        assert!(matches!(
            dispatcher.submit(empty_bulk).await.unwrap_err(),
            QueueError::Validation(_)
        ));

        // 未知任务ID
        assert!(matches!(
            dispatcher.get_status(Uuid::new_v4()).await.unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_single_task_runs_to_completed() {
        let db = setup_db().await;
        let gateway = ScriptedGateway::new(vec![Ok("Bonjour le monde".to_string())]);
        let dispatcher =
            make_dispatcher(db, gateway, test_limiter(1000), RetryPolicy::default()).await;
        let tenant = Uuid::new_v4();

        let id = dispatcher.submit(translation_task(tenant)).await.unwrap();
        dispatcher.start().await;

        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result.as_deref(), Some("Bonjour le monde"));
        assert!(task.completed_at.is_some());
        assert_eq!(task.retry_count, 0);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_completes() {
        let db = setup_db().await;
        let gateway = ScriptedGateway::new(vec![
            Err(ProviderError::Server {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Ok("Bonjour".to_string()),
        ]);
        // 退避压到毫秒级，测试不用等真实秒数
        let policy = RetryPolicy::from_millis(3, &[20, 40]);
        let dispatcher = make_dispatcher(db, gateway, test_limiter(1000), policy).await;
        let tenant = Uuid::new_v4();

        let id = dispatcher.submit(translation_task(tenant)).await.unwrap();
        dispatcher.start().await;

        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.result.as_deref(), Some("Bonjour"));
        // prompt 与 provider 在重试间不变
        assert_eq!(task.provider, "demo");
        assert!(!task.prompt.is_empty());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_failure_fails_without_retry() {
        let db = setup_db().await;
        let gateway =
            ScriptedGateway::new(vec![Err(ProviderError::Auth("invalid api key".to_string()))]);
        let dispatcher =
            make_dispatcher(db, gateway, test_limiter(1000), RetryPolicy::default()).await;
        let tenant = Uuid::new_v4();

        let id = dispatcher.submit(translation_task(tenant)).await.unwrap();
        dispatcher.start().await;

        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(task.error.as_deref().unwrap().contains("authentication"));
        assert!(task.completed_at.is_some());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_ends_failed() {
        let db = setup_db().await;
        let gateway = ScriptedGateway::new(vec![
            Err(ProviderError::Timeout(Duration::from_secs(30))),
            Err(ProviderError::Timeout(Duration::from_secs(30))),
            Err(ProviderError::Timeout(Duration::from_secs(30))),
        ]);
        let policy = RetryPolicy::from_millis(2, &[10]);
        let dispatcher = make_dispatcher(db, gateway, test_limiter(1000), policy).await;
        let tenant = Uuid::new_v4();

        let mut new_task = translation_task(tenant);
        new_task.prompt = "Translate X".to_string();
        let id = dispatcher.submit(new_task).await.unwrap();

        dispatcher.start().await;
        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(task.error.as_deref().unwrap().contains("timed out"));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_bulk_partial_success_completes_with_failures_recorded() {
        let db = setup_db().await;
        // fr 成功、de 失败、es 成功
        let gateway = ScriptedGateway::new(vec![
            Ok("Bonjour".to_string()),
            Err(ProviderError::Server {
                status: 500,
                message: "boom".to_string(),
            }),
            Ok("Hola".to_string()),
        ]);
        let dispatcher =
            make_dispatcher(db, gateway, test_limiter(1000), RetryPolicy::default()).await;
        let tenant = Uuid::new_v4();

        let id = dispatcher
            .submit(bulk_task(tenant, &["fr", "de", "es"]))
            .await
            .unwrap();
        dispatcher.start().await;

        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        // 有语言成功就不失败
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.retry_count, 0);

        let outcome: BulkOutcome = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results.get("fr").map(String::as_str), Some("Bonjour"));
        assert_eq!(outcome.results.get("es").map(String::as_str), Some("Hola"));
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed.contains_key("de"));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_bulk_all_locales_failed_is_failed() {
        let db = setup_db().await;
        let gateway = ScriptedGateway::new(vec![
            Err(ProviderError::Auth("bad key".to_string())),
            Err(ProviderError::Auth("bad key".to_string())),
        ]);
        let dispatcher =
            make_dispatcher(db, gateway, test_limiter(1000), RetryPolicy::default()).await;
        let tenant = Uuid::new_v4();

        let id = dispatcher
            .submit(bulk_task(tenant, &["fr", "de"]))
            .await
            .unwrap();
        dispatcher.start().await;

        let task = wait_for(&dispatcher, id, |t| t.status.is_terminal()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limited_task_deferred_not_dispatched() {
        let db = setup_db().await;
        let gateway = ScriptedGateway::always_ok();
        // 预算：每分钟 1 个请求
        let dispatcher =
            make_dispatcher(db, gateway, test_limiter(1), RetryPolicy::default()).await;
        let tenant = Uuid::new_v4();

        let first = dispatcher.submit(translation_task(tenant)).await.unwrap();
        let second = dispatcher.submit(translation_task(tenant)).await.unwrap();
        dispatcher.start().await;

        let done = wait_for(&dispatcher, first, |t| t.status.is_terminal()).await;
        assert_eq!(done.status, TaskStatus::Completed);

        // 第二个任务保持排队，派发时刻被推迟到预算释放之后
        let deferred = wait_for(&dispatcher, second, |t| t.scheduled_at.is_some()).await;
        assert_eq!(deferred.status, TaskStatus::Queued);
        let wait = deferred.scheduled_at.unwrap() - chrono::Utc::now().fixed_offset();
        assert!(wait > chrono::Duration::seconds(30));

        dispatcher.shutdown().await;

        // 关闭后仍未被派发
        let still_queued = dispatcher.get_status(second).await.unwrap();
        assert_eq!(still_queued.status, TaskStatus::Queued);
    }
}
