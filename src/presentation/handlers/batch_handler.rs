// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;
use validator::Validate;

use crate::application::dto::batch_request::{CreateBatchRequestDto, EstimateCostRequestDto};
use crate::domain::models::batch::{Batch, BatchStatus};
use crate::domain::services::bulk_message_service::{
    BulkMessageService, BulkReport, CostEstimate,
};
use crate::presentation::errors::AppError;

/// 创建批次
///
/// 非定时批次在后台任务中处理，接口立即返回 202
pub async fn create_batch(
    Extension(bulk): Extension<Arc<BulkMessageService>>,
    Json(payload): Json<CreateBatchRequestDto>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let (params, recipients) = payload.into_parts();
    let batch = bulk.create_batch(params, recipients).await?;

    if batch.status != BatchStatus::Scheduled {
        let id = batch.id;
        let bulk = bulk.clone();
        tokio::spawn(async move {
            if let Err(e) = bulk.process_batch(id).await {
                error!(batch_id = %id, "Batch processing failed: {}", e);
            }
        });
    }

    Ok((StatusCode::ACCEPTED, Json(batch)))
}

/// 查询批次
pub async fn get_batch(
    Extension(bulk): Extension<Arc<BulkMessageService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Batch>, AppError> {
    Ok(Json(bulk.get_batch(id).await?))
}

/// 取消批次
pub async fn cancel_batch(
    Extension(bulk): Extension<Arc<BulkMessageService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Batch>, AppError> {
    Ok(Json(bulk.cancel_batch(id).await?))
}

/// 重试批次中失败的消息
pub async fn retry_failed(
    Extension(bulk): Extension<Arc<BulkMessageService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BulkReport>, AppError> {
    Ok(Json(bulk.retry_failed_messages(id).await?))
}

/// 估算批量发送费用
pub async fn estimate_cost(
    Extension(bulk): Extension<Arc<BulkMessageService>>,
    Json(payload): Json<EstimateCostRequestDto>,
) -> Result<Json<CostEstimate>, AppError> {
    payload.validate()?;

    Ok(Json(bulk.estimate_bulk_cost(
        payload.provider.as_deref(),
        payload.channel,
        &payload.content,
        payload.recipients,
    )))
}
