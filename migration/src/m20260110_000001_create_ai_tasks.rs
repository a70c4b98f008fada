use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create ai_tasks table
        manager
            .create_table(
                Table::create()
                    .table(AiTasks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AiTasks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AiTasks::TenantId).uuid().not_null())
                    .col(ColumnDef::new(AiTasks::TaskType).string().not_null())
                    .col(ColumnDef::new(AiTasks::Status).string().not_null())
                    .col(ColumnDef::new(AiTasks::Provider).string().not_null())
                    .col(ColumnDef::new(AiTasks::Prompt).text().not_null())
                    .col(ColumnDef::new(AiTasks::Context).json().not_null())
                    .col(ColumnDef::new(AiTasks::Progress).integer().not_null().default(0))
                    .col(ColumnDef::new(AiTasks::RetryCount).integer().not_null().default(0))
                    .col(ColumnDef::new(AiTasks::MaxRetries).integer().not_null().default(3))
                    .col(ColumnDef::new(AiTasks::EstimatedTokens).integer().not_null().default(0))
                    .col(ColumnDef::new(AiTasks::Result).text())
                    .col(ColumnDef::new(AiTasks::Error).text())
                    .col(ColumnDef::new(AiTasks::ScheduledAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(AiTasks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AiTasks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(AiTasks::CompletedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(AiTasks::ExpiresAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AiTasks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AiTasks {
    Table,
    Id,
    TenantId,
    TaskType,
    Status,
    Provider,
    Prompt,
    Context,
    Progress,
    RetryCount,
    MaxRetries,
    EstimatedTokens,
    Result,
    Error,
    ScheduledAt,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
    ExpiresAt,
}
