// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::task::{Task, TaskContext, TaskType};
use crate::queue::rate_limiter::ProviderLimits;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

/// 队列错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// 仓库错误
    #[error("Repository error: {0}")]
    Repository(#[from] crate::domain::repositories::task_repository::RepositoryError),

    /// 提交参数校验失败
    #[error("Validation error: {0}")]
    Validation(String),

    /// 任务未找到
    #[error("Task not found: {0}")]
    NotFound(Uuid),
}

/// 新任务提交参数
///
/// 调用方负责在提交前物化完整的 prompt；队列不会从其他数据
/// 重建请求内容。
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewTask {
    /// 所属租户ID
    pub tenant_id: Uuid,
    /// 任务类型
    pub task_type: TaskType,
    /// 提供商键名
    #[validate(length(min = 1, max = 64))]
    pub provider: String,
    /// 完整请求文本
    #[validate(length(min = 1))]
    pub prompt: String,
    /// 预估令牌数
    #[validate(range(min = 1, max = 1_000_000))]
    pub estimated_tokens: i32,
    /// 调用方关联元数据
    pub context: TaskContext,
}

/// 任务队列特质
///
/// 外围应用消费的提交接口：创建任务立即返回，完成情况由
/// 调用方轮询 `get_status` 获知。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 提交新任务，返回任务ID
    async fn submit(&self, new_task: NewTask) -> Result<Uuid, QueueError>;

    /// 查询任务状态快照
    async fn get_status(&self, task_id: Uuid) -> Result<Task, QueueError>;

    /// 租户套餐/设置变更时更新其限流预算
    fn update_limits(&self, tenant_id: Uuid, limits: HashMap<String, ProviderLimits>);
}

#[async_trait]
impl<T: TaskQueue + ?Sized> TaskQueue for Arc<T> {
    async fn submit(&self, new_task: NewTask) -> Result<Uuid, QueueError> {
        (**self).submit(new_task).await
    }

    async fn get_status(&self, task_id: Uuid) -> Result<Task, QueueError> {
        (**self).get_status(task_id).await
    }

    fn update_limits(&self, tenant_id: Uuid, limits: HashMap<String, ProviderLimits>) {
        (**self).update_limits(tenant_id, limits)
    }
}
