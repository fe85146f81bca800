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
use std::time::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::application::dto::send_request::{
    MessageResponseDto, SendMessageRequestDto, SendResponseDto,
};
use crate::domain::models::message::SendRequest;
use crate::domain::services::messenger_service::MessengerService;
use crate::presentation::errors::AppError;

/// 发送一条消息
///
/// 带 `scheduledAt` 的请求转为定时发送，返回 202
pub async fn send_message(
    Extension(messenger): Extension<Arc<MessengerService>>,
    Json(payload): Json<SendMessageRequestDto>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    if let Some(at) = payload.scheduled_at {
        let message = messenger.schedule(SendRequest::from(payload), at).await?;
        let body = SendResponseDto {
            message: MessageResponseDto::from(&message),
            result: None,
        };
        return Ok((StatusCode::ACCEPTED, Json(body)));
    }

    let outcome = messenger.send(SendRequest::from(payload)).await?;
    let body = SendResponseDto {
        message: MessageResponseDto::from(&outcome.message),
        result: Some(outcome.result),
    };
    Ok((StatusCode::OK, Json(body)))
}

/// 排队发送一条消息
pub async fn queue_message(
    Extension(messenger): Extension<Arc<MessengerService>>,
    Json(payload): Json<SendMessageRequestDto>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let delay = payload.delay_secs.map(Duration::from_secs);
    let message = messenger.queue(SendRequest::from(payload), delay).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendResponseDto {
            message: MessageResponseDto::from(&message),
            result: None,
        }),
    ))
}

/// 查询消息
pub async fn get_message(
    Extension(messenger): Extension<Arc<MessengerService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponseDto>, AppError> {
    let message = messenger.get_message(id).await?;
    Ok(Json(MessageResponseDto::from(&message)))
}

/// 立即重试一条失败的消息
pub async fn retry_message(
    Extension(messenger): Extension<Arc<MessengerService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SendResponseDto>, AppError> {
    let outcome = messenger.retry(id).await?;
    Ok(Json(SendResponseDto {
        message: MessageResponseDto::from(&outcome.message),
        result: Some(outcome.result),
    }))
}

/// 取消一条定时或排队中的消息
pub async fn cancel_message(
    Extension(messenger): Extension<Arc<MessengerService>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponseDto>, AppError> {
    let message = messenger.cancel(id).await?;
    Ok(Json(MessageResponseDto::from(&message)))
}
