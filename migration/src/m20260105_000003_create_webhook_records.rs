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
        // Create webhook_records table
        manager
            .create_table(
                Table::create()
                    .table(WebhookRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookRecords::Provider).string().not_null())
                    .col(ColumnDef::new(WebhookRecords::ProviderMessageId).string())
                    .col(ColumnDef::new(WebhookRecords::RawPayload).json().not_null())
                    .col(ColumnDef::new(WebhookRecords::ProcessedPayload).json())
                    .col(ColumnDef::new(WebhookRecords::Signature).string())
                    .col(
                        ColumnDef::new(WebhookRecords::IsVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(WebhookRecords::VerificationAttempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookRecords::Processed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(WebhookRecords::ProcessedAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(WebhookRecords::FailureReason).text())
                    .col(
                        ColumnDef::new(WebhookRecords::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(WebhookRecords::NextRetryAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(WebhookRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Create indexes
        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_records_retry")
                    .table(WebhookRecords::Table)
                    .col(WebhookRecords::Processed)
                    .col(WebhookRecords::NextRetryAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebhookRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookRecords {
    Table,
    Id,
    Provider,
    ProviderMessageId,
    RawPayload,
    ProcessedPayload,
    Signature,
    IsVerified,
    VerificationAttempts,
    Processed,
    ProcessedAt,
    FailureReason,
    RetryCount,
    NextRetryAt,
    CreatedAt,
    UpdatedAt,
}
