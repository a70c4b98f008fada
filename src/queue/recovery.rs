// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::task::{cap_error, TaskStatus};
use crate::domain::repositories::task_repository::{
    RepositoryError, TaskRepository, TransitionFields,
};
use crate::domain::services::provider_gateway::ProviderGateway;
use crate::queue::rate_limiter::{ProviderLimits, RateLimiter};
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 租户限流配置来源
///
/// 恢复时按当前设置重新加载租户预算：任务创建后套餐可能已经
/// 变化，不能沿用旧值。由外围应用（套餐/设置数据）实现。
pub trait TenantLimitsSource: Send + Sync {
    /// 读取租户当前生效的各提供商预算；无覆盖时返回 None
    fn current_limits(&self, tenant_id: Uuid) -> Option<HashMap<String, ProviderLimits>>;
}

/// 内存实现的租户限流配置来源
///
/// 进程装配与测试使用；生产部署替换为读取套餐数据的实现。
#[derive(Default)]
pub struct StaticLimitsSource {
    limits: DashMap<Uuid, HashMap<String, ProviderLimits>>,
}

impl StaticLimitsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入租户的预算覆盖
    pub fn set(&self, tenant_id: Uuid, limits: HashMap<String, ProviderLimits>) {
        self.limits.insert(tenant_id, limits);
    }
}

impl TenantLimitsSource for StaticLimitsSource {
    fn current_limits(&self, tenant_id: Uuid) -> Option<HashMap<String, ProviderLimits>> {
        self.limits.get(&tenant_id).map(|l| l.clone())
    }
}

/// 恢复清扫的结果计数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 重新入队的任务数
    pub recovered: u64,
    /// 因卡住被置为失败的任务数
    pub stuck_failed: u64,
    /// 恢复过程中单独失败的任务数
    pub recovery_failed: u64,
    /// 因凭证缺失跳过的任务数（保持原状，下次启动再试）
    pub skipped_no_credential: u64,
}

/// 恢复服务
///
/// 进程启动时、调度器接收任何新工作之前，同步运行恰好一次：
/// 先清扫上一进程崩溃遗留的卡住任务，再把可恢复任务重新入队。
/// 单个任务的恢复失败被隔离记录，绝不中断整个清扫。
pub struct RecoveryService<R: TaskRepository> {
    repository: Arc<R>,
    gateway: Arc<dyn ProviderGateway>,
    rate_limiter: Arc<RateLimiter>,
    limits_source: Arc<dyn TenantLimitsSource>,
    /// 卡住判定阈值：Running 且 updated_at 早于 now - 阈值
    stuck_threshold: chrono::Duration,
    completed: AtomicBool,
}

impl<R: TaskRepository> RecoveryService<R> {
    /// 创建新的恢复服务实例
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    /// * `gateway` - 提供商网关（凭证检查）
    /// * `rate_limiter` - 限流器（重载预算）
    /// * `limits_source` - 租户预算来源
    /// * `stuck_threshold` - 卡住判定阈值
    pub fn new(
        repository: Arc<R>,
        gateway: Arc<dyn ProviderGateway>,
        rate_limiter: Arc<RateLimiter>,
        limits_source: Arc<dyn TenantLimitsSource>,
        stuck_threshold: chrono::Duration,
    ) -> Self {
        Self {
            repository,
            gateway,
            rate_limiter,
            limits_source,
            stuck_threshold,
            completed: AtomicBool::new(false),
        }
    }

    /// 执行启动清扫
    ///
    /// 只在首次调用时生效；同一实例的再次调用直接返回空报告。
    /// 两个阶段都只操作各自在阶段开始时读取的固定快照。
    ///
    /// # 返回值
    ///
    /// * `Ok(RecoveryReport)` - 各类处理计数
    /// * `Err(RepositoryError)` - 快照读取失败，清扫无法进行
    pub async fn run(&self) -> Result<RecoveryReport, RepositoryError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            warn!("Recovery already ran in this process, skipping");
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport::default();
        let now = Utc::now();

        // 阶段一：卡住任务清扫。永远留在 Running 的任务会无限期误报
        // 进度，也永远得不到重试的机会。
        let threshold = now - self.stuck_threshold;
        let stuck = self.repository.find_stuck(threshold.into()).await?;
        info!("Recovery phase 1: {} stuck task(s)", stuck.len());

        for task in stuck {
            let diagnostic = format!(
                "Task stuck in running since {} (threshold {} minutes); the previous process likely crashed mid-call",
                task.updated_at,
                self.stuck_threshold.num_minutes()
            );
            let result = self
                .repository
                .transition(
                    task.id,
                    TaskStatus::Failed,
                    TransitionFields {
                        error: Some(cap_error(&diagnostic)),
                        completed_at: Some(Utc::now().into()),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    warn!("Marked stuck task {} as failed", task.id);
                    report.stuck_failed += 1;
                }
                Err(RepositoryError::TerminalState { id, status }) => {
                    warn!("Stuck task {} already terminal ({})", id, status);
                }
                Err(e) => {
                    error!("Failed to fail stuck task {}: {}", task.id, e);
                    report.recovery_failed += 1;
                }
            }
        }

        // 阶段二：恢复。快照内的任务逐个处理，单个失败不影响其余。
        let recoverable = self.repository.find_recoverable(now.into()).await?;
        info!("Recovery phase 2: {} recoverable task(s)", recoverable.len());

        for task in recoverable {
            if !self
                .gateway
                .has_credential(task.tenant_id, &task.provider)
                .await
            {
                // 不置为失败：凭证可能稍后恢复，任务尚未过期
                warn!(
                    "No credential for tenant {} provider {}, leaving task {} for a later run",
                    task.tenant_id, task.provider, task.id
                );
                report.skipped_no_credential += 1;
                continue;
            }

            // 任务创建后套餐可能已变化，按当前设置重载预算
            if let Some(limits) = self.limits_source.current_limits(task.tenant_id) {
                self.rate_limiter.update_limits(task.tenant_id, limits);
            }

            let result = self
                .repository
                .transition(
                    task.id,
                    TaskStatus::Queued,
                    TransitionFields {
                        scheduled_at: Some(None),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    report.recovered += 1;
                }
                Err(RepositoryError::TerminalState { id, status }) => {
                    warn!("Recoverable task {} already terminal ({})", id, status);
                }
                Err(e) => {
                    error!("Recovery of task {} failed: {}", task.id, e);
                    let diagnostic = cap_error(&format!("recovery failed: {}", e));
                    if let Err(e2) = self
                        .repository
                        .transition(
                            task.id,
                            TaskStatus::Failed,
                            TransitionFields {
                                error: Some(diagnostic),
                                completed_at: Some(Utc::now().into()),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        error!("Could not record recovery failure for {}: {}", task.id, e2);
                    }
                    report.recovery_failed += 1;
                }
            }
        }

        counter!("ai_recovery_recovered_total").increment(report.recovered);
        counter!("ai_recovery_stuck_failed_total").increment(report.stuck_failed);
        counter!("ai_recovery_failed_total").increment(report.recovery_failed);
        info!(
            "Recovery finished: {} recovered, {} stuck-failed, {} recovery-failed, {} skipped (no credential)",
            report.recovered, report.stuck_failed, report.recovery_failed, report.skipped_no_credential
        );

        Ok(report)
    }
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod tests;
