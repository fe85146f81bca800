// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum::{extract::Extension, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::domain::services::messenger_service::MessengerService;

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub circuit: String,
    pub failure_count: u32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: Vec<ProviderStatus>,
}

/// 健康检查端点
///
/// 返回服务状态和每个已配置供应商的熔断器状态
pub async fn health_check(
    Extension(messenger): Extension<Arc<MessengerService>>,
) -> Json<HealthResponse> {
    let mut providers = Vec::new();
    for name in messenger.registry().configured() {
        let state = messenger.breaker().state(name).await;
        providers.push(ProviderStatus {
            name: name.to_string(),
            circuit: state.status.to_string(),
            failure_count: state.failure_count,
        });
    }

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        providers,
    })
}
