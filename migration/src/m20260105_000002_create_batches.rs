// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Batches::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Batches::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Batches::Name).string().not_null())
                    .col(ColumnDef::new(Batches::Provider).string())
                    .col(ColumnDef::new(Batches::Channel).string().not_null())
                    .col(ColumnDef::new(Batches::Content).text().not_null())
                    .col(ColumnDef::new(Batches::TemplateId).string())
                    .col(ColumnDef::new(Batches::Variables).json().not_null())
                    .col(
                        ColumnDef::new(Batches::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Batches::TotalRecipients)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::SentCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::DeliveredCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::FailedCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Batches::ChunkSize).integer().not_null())
                    .col(
                        ColumnDef::new(Batches::DelayBetweenBatches)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Batches::RetryFailed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Batches::MaxRetries).integer().not_null())
                    .col(
                        ColumnDef::new(Batches::CurrentRetry)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Batches::ScheduledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Batches::StartedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Batches::CompletedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Batches::CancelledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Batches::Metadata).json().not_null())
                    .col(
                        ColumnDef::new(Batches::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Batches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Batches::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_batches_status_scheduled")
                    .table(Batches::Table)
                    .col(Batches::Status)
                    .col(Batches::ScheduledAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Batches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Batches {
    Table,
    Id,
    Name,
    Provider,
    Channel,
    Content,
    TemplateId,
    Variables,
    Status,
    TotalRecipients,
    SentCount,
    DeliveredCount,
    FailedCount,
    ChunkSize,
    DelayBetweenBatches,
    RetryFailed,
    MaxRetries,
    CurrentRetry,
    ScheduledAt,
    StartedAt,
    CompletedAt,
    CancelledAt,
    Metadata,
    Version,
    CreatedAt,
    UpdatedAt,
}
