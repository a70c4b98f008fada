use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 调度扫描：按状态 + 调度时间查询待执行任务
        manager
            .create_index(
                Index::create()
                    .name("idx_ai_tasks_status_scheduled_at")
                    .table(AiTasks::Table)
                    .col(AiTasks::Status)
                    .col(AiTasks::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        // 恢复扫描：按状态 + 创建时间排序
        manager
            .create_index(
                Index::create()
                    .name("idx_ai_tasks_status_created_at")
                    .table(AiTasks::Table)
                    .col(AiTasks::Status)
                    .col(AiTasks::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ai_tasks_tenant_id")
                    .table(AiTasks::Table)
                    .col(AiTasks::TenantId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_ai_tasks_status_scheduled_at")
                    .table(AiTasks::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_ai_tasks_status_created_at")
                    .table(AiTasks::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_ai_tasks_tenant_id")
                    .table(AiTasks::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum AiTasks {
    Table,
    TenantId,
    Status,
    ScheduledAt,
    CreatedAt,
}
