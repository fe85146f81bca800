// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::domain::services::delivery_tracker::TrackerError;
use crate::domain::services::messenger_service::MessengerError;

/// 应用错误类型
///
/// 封装所有可能的应用层错误，提供统一的错误处理接口。
/// 响应体为 `{ "code": ..., "message": ... }`
#[derive(Debug)]
pub struct AppError(anyhow::Error);

/// 错误码对应的HTTP状态码
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "INVALID_STATE" => StatusCode::CONFLICT,
        "VALIDATION_ERROR" => StatusCode::UNPROCESSABLE_ENTITY,
        "CONSENT_REQUIRED" => StatusCode::FORBIDDEN,
        "PROVIDER_UNAVAILABLE" | "STORAGE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "SEND_FAILED" | "PROVIDER_ERROR" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    fn code(&self) -> &'static str {
        if let Some(e) = self.0.downcast_ref::<MessengerError>() {
            return e.code();
        }
        if self.0.downcast_ref::<TrackerError>().is_some() {
            return "STORAGE_UNAVAILABLE";
        }
        if self.0.downcast_ref::<validator::ValidationErrors>().is_some() {
            return "VALIDATION_ERROR";
        }
        "INTERNAL_ERROR"
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = status_for_code(code);
        let message_id = self
            .0
            .downcast_ref::<MessengerError>()
            .and_then(MessengerError::message_id);

        let mut body = json!({ "code": code, "message": self.0.to_string() });
        if let Some(id) = message_id {
            body["messageId"] = json!(id);
        }
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
