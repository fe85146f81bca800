// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::Settings;
use crate::domain::services::bulk_message_service::BulkMessageService;
use crate::domain::services::delivery_tracker::DeliveryTracker;
use crate::domain::services::messenger_service::MessengerService;
use crate::presentation::handlers::{
    batch_handler, health_handler, message_handler, webhook_handler,
};
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// 路由依赖的服务
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub messenger: Arc<MessengerService>,
    pub bulk: Arc<BulkMessageService>,
    pub tracker: Arc<DeliveryTracker>,
}

/// 创建应用路由
///
/// # 返回值
///
/// 返回未注入依赖的路由
pub fn routes() -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_handler::health_check))
        .route("/v1/version", get(version))
        .route(
            "/v1/webhooks/{provider}",
            post(webhook_handler::receive_webhook),
        );

    let message_routes = Router::new()
        .route("/v1/messages", post(message_handler::send_message))
        .route("/v1/messages/queue", post(message_handler::queue_message))
        .route("/v1/messages/{id}", get(message_handler::get_message))
        .route(
            "/v1/messages/{id}/retry",
            post(message_handler::retry_message),
        )
        .route(
            "/v1/messages/{id}/cancel",
            post(message_handler::cancel_message),
        );

    let batch_routes = Router::new()
        .route("/v1/batches", post(batch_handler::create_batch))
        .route("/v1/batches/estimate", post(batch_handler::estimate_cost))
        .route("/v1/batches/{id}", get(batch_handler::get_batch))
        .route("/v1/batches/{id}/cancel", post(batch_handler::cancel_batch))
        .route(
            "/v1/batches/{id}/retry-failed",
            post(batch_handler::retry_failed),
        );

    Router::new()
        .merge(public_routes)
        .merge(message_routes)
        .merge(batch_routes)
}

/// 创建注入了全部依赖的应用
pub fn app(state: AppState) -> Router {
    routes()
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state.settings))
        .layer(Extension(state.messenger))
        .layer(Extension(state.bulk))
        .layer(Extension(state.tracker))
}

/// 版本信息端点
pub async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
