// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::task::{
    cap_error, cap_result, Task, TaskStatus, TaskType, PROGRESS_DONE, PROGRESS_RUNNING,
};
use crate::domain::repositories::task_repository::{
    RepositoryError, TaskRepository, TransitionFields,
};
use crate::domain::services::provider_gateway::{ProviderError, ProviderGateway};
use crate::queue::rate_limiter::{AdmitDecision, ProviderLimits, RateLimiter};
use crate::queue::task_queue::{NewTask, QueueError, TaskQueue};
use crate::utils::retry_policy::{classify, ErrorClass, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 轮询间隔；限流返回的等待时间更短时优先生效
    pub poll_interval: Duration,
    /// 单次提供商调用的墙钟时间预算
    pub invoke_timeout: Duration,
    /// 每次扫描取出的任务数上限
    pub batch_size: u64,
    /// 新任务的保留期，决定 expires_at
    pub retention: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            invoke_timeout: Duration::from_secs(30),
            batch_size: 50,
            retention: chrono::Duration::days(30),
        }
    }
}

/// 批量翻译的部分成功结果
///
/// 持久化到任务 result 字段的JSON结构：成功语言的译文与
/// 失败语言的诊断并存，调用方无需重做已成功的语言。
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// 成功语言 -> 译文
    pub results: BTreeMap<String, String>,
    /// 失败语言 -> 诊断
    pub failed: BTreeMap<String, String>,
}

/// 调度执行核心
///
/// 轮询循环与派生的提供商调用共享的状态集合，整体可克隆。
struct DispatchCore<R: TaskRepository + 'static> {
    repository: Arc<R>,
    rate_limiter: Arc<RateLimiter>,
    gateway: Arc<dyn ProviderGateway>,
    retry_policy: RetryPolicy,
    config: DispatcherConfig,
}

impl<R: TaskRepository + 'static> Clone for DispatchCore<R> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            rate_limiter: self.rate_limiter.clone(),
            gateway: self.gateway.clone(),
            retry_policy: self.retry_policy.clone(),
            config: self.config.clone(),
        }
    }
}

/// 队列调度器
///
/// 每个进程唯一的调度单元，独占 Queued/Running 之外的状态迁移。
/// 轮询到期任务，经限流器放行后将提供商调用派生为并发的tokio
/// 任务；失败走重试策略。构造后先由恢复服务完成启动清扫，再
/// 调用 `start` 开始轮询。
pub struct QueueDispatcher<R: TaskRepository + 'static> {
    core: DispatchCore<R>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: TaskRepository + 'static> QueueDispatcher<R> {
    /// 创建新的调度器实例
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    /// * `rate_limiter` - 限流器
    /// * `gateway` - 提供商网关
    /// * `retry_policy` - 重试策略
    /// * `config` - 调度器配置
    ///
    /// # 返回值
    ///
    /// 返回新的调度器实例
    pub fn new(
        repository: Arc<R>,
        rate_limiter: Arc<RateLimiter>,
        gateway: Arc<dyn ProviderGateway>,
        retry_policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            core: DispatchCore {
                repository,
                rate_limiter,
                gateway,
                retry_policy,
                config,
            },
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// 启动轮询循环
    ///
    /// 恢复服务完成启动清扫之后调用。重复调用是空操作。
    pub async fn start(&self) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            warn!("Dispatcher already started");
            return;
        }

        let core = self.core.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *guard = Some(tokio::spawn(async move {
            core.run_loop(shutdown_rx).await;
        }));
        info!(
            "Dispatcher started, poll interval {:?}",
            self.core.config.poll_interval
        );
    }

    /// 停止轮询并等待在途调用结束
    ///
    /// 不再接收新任务；已派生的提供商调用运行至自然完成。
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Dispatcher loop ended abnormally: {}", e);
            }
        }
        info!("Dispatcher shut down");
    }
}

impl<R: TaskRepository + 'static> DispatchCore<R> {
    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // 回收已结束的在途调用
            while in_flight.try_join_next().is_some() {}

            let sleep_for = match self.poll_once(&mut in_flight).await {
                Ok(wait) => wait,
                Err(e) => {
                    error!("Dispatch scan failed: {}", e);
                    self.config.poll_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        // 在途工作收尾后再退出；中断的调用会留下 Running 状态，
        // 由下次启动的卡住任务清扫兜底
        while in_flight.join_next().await.is_some() {}
    }

    /// 单轮扫描
    ///
    /// 返回下一次唤醒前的休眠时长：限流器给出的最短等待时间
    /// 直接决定唤醒时刻，而不是固定轮询间隔空转。
    async fn poll_once(&self, in_flight: &mut JoinSet<()>) -> Result<Duration, RepositoryError> {
        let now: DateTime<FixedOffset> = Utc::now().into();
        let due = self.repository.find_due(now, self.config.batch_size).await?;
        let mut next_wake = self.config.poll_interval;

        for task in due {
            match task.status {
                TaskStatus::Pending => {
                    // 接收新任务入队
                    match self
                        .repository
                        .transition(task.id, TaskStatus::Queued, TransitionFields::default())
                        .await
                    {
                        Ok(_) => {}
                        Err(RepositoryError::TerminalState { id, status }) => {
                            warn!("Task {} already terminal ({}), skipping admit", id, status);
                        }
                        Err(e) => return Err(e),
                    }
                }
                TaskStatus::Queued => {
                    let tokens = task.estimated_tokens.max(0) as u32;
                    match self
                        .rate_limiter
                        .try_admit(task.tenant_id, &task.provider, tokens)
                    {
                        AdmitDecision::Admitted => {
                            match self
                                .repository
                                .transition(
                                    task.id,
                                    TaskStatus::Running,
                                    TransitionFields::progress(PROGRESS_RUNNING),
                                )
                                .await
                            {
                                Ok(running) => {
                                    let core = self.clone();
                                    in_flight.spawn(async move {
                                        core.execute(running).await;
                                    });
                                }
                                Err(RepositoryError::TerminalState { id, status }) => {
                                    warn!(
                                        "Task {} already terminal ({}), not dispatching",
                                        id, status
                                    );
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        AdmitDecision::RetryAfter { wait_ms } => {
                            counter!("ai_rate_limit_deferrals_total").increment(1);
                            let wait = Duration::from_millis(wait_ms);
                            // 推迟到预算释放的时刻，避免每轮空扫同一批任务
                            let resume: DateTime<FixedOffset> =
                                (Utc::now() + chrono::Duration::milliseconds(wait_ms as i64))
                                    .into();
                            if let Err(e) = self
                                .repository
                                .transition(
                                    task.id,
                                    TaskStatus::Queued,
                                    TransitionFields {
                                        scheduled_at: Some(Some(resume)),
                                        ..Default::default()
                                    },
                                )
                                .await
                            {
                                warn!("Failed to defer task {}: {}", task.id, e);
                            }
                            next_wake = next_wake.min(wait);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(next_wake)
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type, provider = %task.provider))]
    async fn execute(&self, task: Task) {
        info!("Executing task");
        let start = std::time::Instant::now();

        let outcome = match task.task_type {
            TaskType::TranslationBulk => self.run_bulk(&task).await,
            _ => self.run_single(&task).await,
        };

        histogram!("ai_task_duration_seconds").record(start.elapsed().as_secs_f64());

        if let Err(e) = outcome {
            // 仓库层故障：任务保持 Running，留给卡住任务清扫处理
            error!("Failed to persist task outcome: {}", e);
        }
    }

    /// 带墙钟预算的提供商调用
    ///
    /// 网关实现自身的超时不可依赖，调度器始终在外层限定预算。
    async fn invoke_bounded(&self, task: &Task, prompt: &str) -> Result<String, ProviderError> {
        let timeout = self.config.invoke_timeout;
        match tokio::time::timeout(
            timeout,
            self.gateway
                .invoke(task.tenant_id, &task.provider, prompt, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }

    async fn run_single(&self, task: &Task) -> Result<(), RepositoryError> {
        match self.invoke_bounded(task, &task.prompt).await {
            Ok(text) => self.complete(task, cap_result(&text)).await,
            Err(e) => self.handle_failure(task, &e).await,
        }
    }

    /// 批量翻译：语言逐个串行处理，单个语言失败不中断其余语言
    ///
    /// 只要有语言成功，任务以部分成功完成并记录失败语言；全部
    /// 失败时整体按首个错误走重试策略。
    async fn run_bulk(&self, task: &Task) -> Result<(), RepositoryError> {
        let locales = task.context.bulk_locales().to_vec();
        if locales.is_empty() {
            let err = ProviderError::InvalidRequest(
                "bulk translation task has no target locales".to_string(),
            );
            return self.handle_failure(task, &err).await;
        }

        let total = locales.len();
        let mut outcome = BulkOutcome::default();
        let mut first_error: Option<ProviderError> = None;

        for (done, locale) in locales.iter().enumerate() {
            let prompt = format!("{}\n\nTarget locale: {}", task.prompt, locale);
            match self.invoke_bounded(task, &prompt).await {
                Ok(text) => {
                    outcome.results.insert(locale.clone(), text);
                }
                Err(e) => {
                    warn!("Locale {} failed for task {}: {}", locale, task.id, e);
                    outcome.failed.insert(locale.clone(), e.to_string());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }

            // 进度按已完成语言比例推进，只在语言边界更新
            let progress = PROGRESS_RUNNING
                + (((PROGRESS_DONE - 5 - PROGRESS_RUNNING) as usize * (done + 1)) / total) as i32;
            if let Err(e) = self
                .repository
                .transition(
                    task.id,
                    TaskStatus::Running,
                    TransitionFields::progress(progress),
                )
                .await
            {
                warn!("Failed to advance progress for task {}: {}", task.id, e);
            }
        }

        if outcome.results.is_empty() {
            let err = first_error.unwrap_or_else(|| {
                ProviderError::InvalidResponse("no locale produced a result".to_string())
            });
            return self.handle_failure(task, &err).await;
        }

        let result = serde_json::to_string(&outcome)
            .unwrap_or_else(|e| format!("{{\"error\":\"unserializable outcome: {}\"}}", e));
        self.complete(task, cap_result(&result)).await
    }

    async fn complete(&self, task: &Task, result: String) -> Result<(), RepositoryError> {
        match self
            .repository
            .transition(
                task.id,
                TaskStatus::Completed,
                TransitionFields {
                    progress: Some(PROGRESS_DONE),
                    result: Some(result),
                    completed_at: Some(Utc::now().into()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => {
                counter!("ai_tasks_completed_total").increment(1);
                info!("Task {} completed", task.id);
                Ok(())
            }
            Err(RepositoryError::TerminalState { id, status }) => {
                warn!("Task {} already terminal ({}), result dropped", id, status);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_failure(
        &self,
        task: &Task,
        error: &ProviderError,
    ) -> Result<(), RepositoryError> {
        if classify(error) == ErrorClass::Transient && task.can_retry() {
            let attempt = task.retry_count + 1;
            let delay = self.retry_policy.backoff(attempt);
            let resume: DateTime<FixedOffset> =
                (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()).into();

            let result = self
                .repository
                .transition(
                    task.id,
                    TaskStatus::Queued,
                    TransitionFields {
                        retry_count: Some(attempt),
                        scheduled_at: Some(Some(resume)),
                        error: Some(cap_error(&error.to_string())),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    counter!("ai_task_retries_total").increment(1);
                    info!(
                        "Scheduled retry {}/{} for task {} in {:?}",
                        attempt, task.max_retries, task.id, delay
                    );
                    Ok(())
                }
                Err(RepositoryError::TerminalState { id, status }) => {
                    warn!("Task {} already terminal ({}), retry dropped", id, status);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            let result = self
                .repository
                .transition(
                    task.id,
                    TaskStatus::Failed,
                    TransitionFields {
                        error: Some(cap_error(&error.to_string())),
                        completed_at: Some(Utc::now().into()),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    counter!("ai_tasks_failed_total").increment(1);
                    warn!("Task {} failed: {}", task.id, error);
                    Ok(())
                }
                Err(RepositoryError::TerminalState { id, status }) => {
                    warn!("Task {} already terminal ({}), failure dropped", id, status);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: TaskRepository + 'static> TaskQueue for QueueDispatcher<R> {
    async fn submit(&self, new_task: NewTask) -> Result<Uuid, QueueError> {
        new_task
            .validate()
            .map_err(|e| QueueError::Validation(e.to_string()))?;

        if new_task.task_type == TaskType::TranslationBulk
            && new_task.context.bulk_locales().is_empty()
        {
            return Err(QueueError::Validation(
                "translation_bulk requires at least one target locale".to_string(),
            ));
        }

        let mut task = Task::new(
            new_task.tenant_id,
            new_task.task_type,
            new_task.provider,
            new_task.prompt,
            new_task.estimated_tokens,
            new_task.context,
            self.core.config.retention,
        );
        task.max_retries = self.core.retry_policy.max_retries;

        let created = self.core.repository.create(&task).await?;
        counter!("ai_tasks_submitted_total").increment(1);
        info!(
            "Task {} submitted (type {}, provider {})",
            created.id, created.task_type, created.provider
        );
        Ok(created.id)
    }

    async fn get_status(&self, task_id: Uuid) -> Result<Task, QueueError> {
        self.core
            .repository
            .find_by_id(task_id)
            .await?
            .ok_or(QueueError::NotFound(task_id))
    }

    fn update_limits(&self, tenant_id: Uuid, limits: HashMap<String, ProviderLimits>) {
        self.core.rate_limiter.update_limits(tenant_id, limits);
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod tests;
