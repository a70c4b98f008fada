// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::task::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// 仓库错误类型
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    /// 记录未找到
    #[error("Record not found")]
    NotFound,
    /// 任务已处于终态，迁移请求未生效
    ///
    /// 终态任务上的迁移是空操作，但必须报告给调用方，不允许静默丢弃。
    #[error("Task {id} already terminal ({status}), transition ignored")]
    TerminalState { id: Uuid, status: TaskStatus },
    /// 状态机不允许的迁移
    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// 状态迁移附带的字段更新
///
/// 迁移在一条原子更新中同时写入状态与这里列出的字段子集。
/// `updated_at` 由仓库在每次迁移时刷新，调用方不需要设置。
#[derive(Debug, Default, Clone)]
pub struct TransitionFields {
    /// 新进度；仓库保证进度单调不减
    pub progress: Option<i32>,
    /// 提供商输出（调用方先截断再传入）
    pub result: Option<String>,
    /// 失败诊断（调用方先截断再传入）
    pub error: Option<String>,
    /// 终态时间
    pub completed_at: Option<DateTime<FixedOffset>>,
    /// 最早可派发时间；Some(None) 表示清除
    pub scheduled_at: Option<Option<DateTime<FixedOffset>>>,
    /// 新的重试计数
    pub retry_count: Option<i32>,
}

impl TransitionFields {
    /// 仅更新进度
    pub fn progress(progress: i32) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// 任务仓库特质
///
/// 任务存在性与状态的唯一事实来源。所有状态变更都经过
/// `transition`，其实现必须对单行原子：并发的两次迁移不会
/// 让同一任务被两个派发方同时拿走。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建新任务
    async fn create(&self, task: &Task) -> Result<Task, RepositoryError>;

    /// 根据ID查找任务
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, RepositoryError>;

    /// 原子状态迁移
    ///
    /// 在单条条件更新中写入新状态与字段子集，并刷新 updated_at。
    /// 终态任务上的请求返回 `RepositoryError::TerminalState`。
    async fn transition(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, RepositoryError>;

    /// 获取到期的待派发任务
    ///
    /// 状态为 Pending 或 Queued，且 scheduled_at 为空或已到期，
    /// 按创建时间升序（先到先服务）。
    async fn find_due(
        &self,
        now: DateTime<FixedOffset>,
        limit: u64,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// 获取可恢复任务
    ///
    /// 状态为 Pending 或 Queued、prompt 与 provider 俱在、未过期，
    /// 按创建时间升序。
    async fn find_recoverable(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// 获取卡住的任务
    ///
    /// 状态为 Running 且 updated_at 早于给定阈值，说明先前进程
    /// 很可能在调用中途崩溃。
    async fn find_stuck(
        &self,
        threshold: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, RepositoryError>;
}
