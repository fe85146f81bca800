// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::{
    body::Bytes,
    extract::{Extension, OriginalUri, Path},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::settings::Settings;
use crate::domain::services::delivery_tracker::DeliveryTracker;
use crate::presentation::errors::AppError;
use crate::providers::traits::InboundWebhook;

/// 解析回调请求体：表单或JSON，都不是时保留原文
fn parse_payload(content_type: Option<&str>, body: &[u8]) -> Value {
    let is_form = content_type
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        if let Ok(fields) = serde_urlencoded::from_bytes::<BTreeMap<String, String>>(body) {
            return json!(fields);
        }
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => json!({ "raw": String::from_utf8_lossy(body) }),
    }
}

/// 供应商回调时使用的完整URL
fn callback_url(public_url: Option<&str>, uri: &axum::http::Uri) -> Option<String> {
    let base = public_url?.trim_end_matches('/');
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    Some(format!("{}{}", base, path))
}

/// 接收供应商投递回调
///
/// 原始记录保存成功后总是返回 200，避免供应商重试风暴；
/// 只有原始记录无法保存时返回 503
pub async fn receive_webhook(
    Extension(tracker): Extension<Arc<DeliveryTracker>>,
    Extension(settings): Extension<Arc<Settings>>,
    Path(provider): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let payload = parse_payload(content_type, &body);

    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let webhook = InboundWebhook {
        payload,
        raw_body: Some(String::from_utf8_lossy(&body).into_owned()),
        headers,
        url: callback_url(settings.server.public_url.as_deref(), &uri),
    };

    let processed = tracker.process_webhook(&provider, webhook).await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    ))
}
