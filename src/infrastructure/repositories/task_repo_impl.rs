// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::models::task::{Task, TaskStatus};
use crate::domain::repositories::task_repository::{
    RepositoryError, TaskRepository, TransitionFields,
};
use crate::infrastructure::database::entities::task as task_entity;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

/// 任务仓库实现
///
/// 基于SeaORM实现的任务数据访问层
#[derive(Clone)]
pub struct TaskRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl TaskRepositoryImpl {
    /// 创建新的任务仓库实例
    ///
    /// # 参数
    ///
    /// * `db` - 数据库连接
    ///
    /// # 返回值
    ///
    /// 返回新的任务仓库实例
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn model_to_task(model: task_entity::Model) -> Result<Task, DbErr> {
    let context = serde_json::from_value(model.context.clone())
        .map_err(|e| DbErr::Json(format!("Invalid task context: {}", e)))?;

    Ok(Task {
        id: model.id,
        tenant_id: model.tenant_id,
        task_type: model.task_type.parse().unwrap_or_default(),
        status: model.status.parse().unwrap_or_default(),
        provider: model.provider,
        prompt: model.prompt,
        context,
        progress: model.progress,
        retry_count: model.retry_count,
        max_retries: model.max_retries,
        estimated_tokens: model.estimated_tokens,
        result: model.result,
        error: model.error,
        scheduled_at: model.scheduled_at,
        created_at: model.created_at,
        updated_at: model.updated_at,
        completed_at: model.completed_at,
        expires_at: model.expires_at,
    })
}

impl From<&Task> for task_entity::ActiveModel {
    fn from(task: &Task) -> Self {
        Self {
            id: Set(task.id),
            tenant_id: Set(task.tenant_id),
            task_type: Set(task.task_type.to_string()),
            status: Set(task.status.to_string()),
            provider: Set(task.provider.clone()),
            prompt: Set(task.prompt.clone()),
            context: Set(serde_json::to_value(&task.context).unwrap_or(serde_json::Value::Null)),
            progress: Set(task.progress),
            retry_count: Set(task.retry_count),
            max_retries: Set(task.max_retries),
            estimated_tokens: Set(task.estimated_tokens),
            result: Set(task.result.clone()),
            error: Set(task.error.clone()),
            scheduled_at: Set(task.scheduled_at),
            created_at: Set(task.created_at),
            updated_at: Set(task.updated_at),
            completed_at: Set(task.completed_at),
            expires_at: Set(task.expires_at),
        }
    }
}

#[async_trait]
impl TaskRepository for TaskRepositoryImpl {
    async fn create(&self, task: &Task) -> Result<Task, RepositoryError> {
        let model: task_entity::ActiveModel = task.into();

        model.insert(self.db.as_ref()).await?;
        Ok(task.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, RepositoryError> {
        let model = task_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;

        model.map(model_to_task).transpose().map_err(Into::into)
    }

    async fn transition(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, RepositoryError> {
        let current = self
            .find_by_id(id)
            .await?
            .ok_or(RepositoryError::NotFound)?;

        if current.status.is_terminal() {
            return Err(RepositoryError::TerminalState {
                id,
                status: current.status,
            });
        }
        if !current.status.can_transition_to(new_status) {
            return Err(RepositoryError::InvalidTransition {
                id,
                from: current.status,
                to: new_status,
            });
        }

        let now: DateTime<FixedOffset> = Utc::now().into();
        let mut update = task_entity::Entity::update_many()
            .col_expr(
                task_entity::Column::Status,
                Expr::value(new_status.to_string()),
            )
            .col_expr(task_entity::Column::UpdatedAt, Expr::value(now));

        if let Some(progress) = fields.progress {
            // 进度单调不减
            update = update.col_expr(
                task_entity::Column::Progress,
                Expr::value(progress.max(current.progress)),
            );
        }
        if let Some(result) = fields.result {
            update = update.col_expr(
                task_entity::Column::Result,
                Expr::value(Some(result)),
            );
        }
        if let Some(error) = fields.error {
            update = update.col_expr(task_entity::Column::Error, Expr::value(Some(error)));
        }
        if let Some(completed_at) = fields.completed_at {
            update = update.col_expr(
                task_entity::Column::CompletedAt,
                Expr::value(Some(completed_at)),
            );
        }
        if let Some(scheduled_at) = fields.scheduled_at {
            update = update.col_expr(
                task_entity::Column::ScheduledAt,
                Expr::value(scheduled_at),
            );
        }
        if let Some(retry_count) = fields.retry_count {
            update = update.col_expr(task_entity::Column::RetryCount, Expr::value(retry_count));
        }

        // 条件更新：终态行不会被改写，并发竞争时以行影响数为准
        let result = update
            .filter(task_entity::Column::Id.eq(id))
            .filter(task_entity::Column::Status.is_not_in(vec![
                TaskStatus::Completed.to_string(),
                TaskStatus::Failed.to_string(),
            ]))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            let task = self
                .find_by_id(id)
                .await?
                .ok_or(RepositoryError::NotFound)?;
            return Err(RepositoryError::TerminalState {
                id,
                status: task.status,
            });
        }

        self.find_by_id(id).await?.ok_or(RepositoryError::NotFound)
    }

    async fn find_due(
        &self,
        now: DateTime<FixedOffset>,
        limit: u64,
    ) -> Result<Vec<Task>, RepositoryError> {
        let models = task_entity::Entity::find()
            .filter(task_entity::Column::Status.is_in(vec![
                TaskStatus::Pending.to_string(),
                TaskStatus::Queued.to_string(),
            ]))
            .filter(
                Condition::any()
                    .add(task_entity::Column::ScheduledAt.is_null())
                    .add(task_entity::Column::ScheduledAt.lte(now)),
            )
            .order_by_asc(task_entity::Column::CreatedAt)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;

        models
            .into_iter()
            .map(|m| model_to_task(m).map_err(Into::into))
            .collect()
    }

    async fn find_recoverable(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let models = task_entity::Entity::find()
            .filter(task_entity::Column::Status.is_in(vec![
                TaskStatus::Pending.to_string(),
                TaskStatus::Queued.to_string(),
            ]))
            .filter(task_entity::Column::Prompt.ne(""))
            .filter(task_entity::Column::Provider.ne(""))
            .filter(
                Condition::any()
                    .add(task_entity::Column::ExpiresAt.is_null())
                    .add(task_entity::Column::ExpiresAt.gt(now)),
            )
            .order_by_asc(task_entity::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        models
            .into_iter()
            .map(|m| model_to_task(m).map_err(Into::into))
            .collect()
    }

    async fn find_stuck(
        &self,
        threshold: DateTime<FixedOffset>,
    ) -> Result<Vec<Task>, RepositoryError> {
        let models = task_entity::Entity::find()
            .filter(task_entity::Column::Status.eq(TaskStatus::Running.to_string()))
            .filter(task_entity::Column::UpdatedAt.lt(threshold))
            .order_by_asc(task_entity::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;

        models
            .into_iter()
            .map(|m| model_to_task(m).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
#[path = "task_repo_impl_test.rs"]
mod tests;
