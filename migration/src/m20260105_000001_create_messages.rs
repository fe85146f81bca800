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
                    .table(Messages::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Messages::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Messages::BatchId).uuid())
                    .col(ColumnDef::new(Messages::Provider).string().not_null())
                    .col(ColumnDef::new(Messages::Channel).string().not_null())
                    .col(ColumnDef::new(Messages::Recipient).string().not_null())
                    .col(ColumnDef::new(Messages::Content).text().not_null())
                    .col(ColumnDef::new(Messages::TemplateId).string())
                    .col(ColumnDef::new(Messages::Variables).json().not_null())
                    .col(
                        ColumnDef::new(Messages::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Messages::Priority)
                            .string()
                            .not_null()
                            .default("normal"),
                    )
                    .col(ColumnDef::new(Messages::ProviderMessageId).string())
                    .col(ColumnDef::new(Messages::ScheduledAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Messages::SentAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Messages::DeliveredAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Messages::ReadAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Messages::FailedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Messages::CancelledAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Messages::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Messages::ErrorCode).string())
                    .col(ColumnDef::new(Messages::ErrorMessage).text())
                    .col(ColumnDef::new(Messages::Cost).double())
                    .col(ColumnDef::new(Messages::Metadata).json().not_null())
                    .col(
                        ColumnDef::new(Messages::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Messages::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Messages::UpdatedAt)
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
                    .name("idx_messages_provider_message_id")
                    .table(Messages::Table)
                    .col(Messages::Provider)
                    .col(Messages::ProviderMessageId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_messages_batch_status")
                    .table(Messages::Table)
                    .col(Messages::BatchId)
                    .col(Messages::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_messages_status_scheduled")
                    .table(Messages::Table)
                    .col(Messages::Status)
                    .col(Messages::ScheduledAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Messages::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Messages {
    Table,
    Id,
    BatchId,
    Provider,
    Channel,
    Recipient,
    Content,
    TemplateId,
    Variables,
    Status,
    Priority,
    ProviderMessageId,
    ScheduledAt,
    SentAt,
    DeliveredAt,
    ReadAt,
    FailedAt,
    CancelledAt,
    RetryCount,
    ErrorCode,
    ErrorMessage,
    Cost,
    Metadata,
    Version,
    CreatedAt,
    UpdatedAt,
}
