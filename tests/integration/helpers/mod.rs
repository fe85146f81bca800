// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use axum_test::TestServer;
use messenger::config::settings::{DatabaseSettings, Settings};
use messenger::domain::models::events::MessageEvent;
use messenger::domain::services::bulk_message_service::{BulkDefaults, BulkMessageService};
use messenger::domain::services::delivery_tracker::DeliveryTracker;
use messenger::domain::services::messenger_service::{DispatchOptions, MessengerService};
use messenger::infrastructure::cache::kv_store::InMemoryKeyValueStore;
use messenger::infrastructure::database::connection;
use messenger::infrastructure::repositories::batch_repo_impl::BatchRepositoryImpl;
use messenger::infrastructure::repositories::message_repo_impl::MessageRepositoryImpl;
use messenger::infrastructure::repositories::webhook_record_repo_impl::WebhookRecordRepoImpl;
use messenger::infrastructure::services::event_bus::BroadcastEventBus;
use messenger::presentation::routes::{self, AppState};
use messenger::providers::circuit_breaker::{CircuitBreaker, CircuitConfig};
use messenger::providers::mock_provider::MockProvider;
use messenger::providers::registry::ProviderRegistry;
use messenger::queue::dispatch_queue::InMemoryDispatchQueue;
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const MOCK_WEBHOOK_SECRET: &str = "mock-secret";
pub const TWILIO_AUTH_TOKEN: &str = "twilio-token";
pub const PUBLIC_URL: &str = "https://sms.example.com";

/// 完整的服务图，共享一个内存数据库
#[allow(dead_code)]
pub struct TestContext {
    pub settings: Arc<Settings>,
    pub db: Arc<DatabaseConnection>,
    pub messages: Arc<MessageRepositoryImpl>,
    pub batches: Arc<BatchRepositoryImpl>,
    pub records: Arc<WebhookRecordRepoImpl>,
    pub registry: Arc<ProviderRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub queue: Arc<InMemoryDispatchQueue>,
    pub events: Arc<BroadcastEventBus>,
    pub mock: Arc<MockProvider>,
    pub messenger: Arc<MessengerService>,
    pub bulk: Arc<BulkMessageService>,
    pub tracker: Arc<DeliveryTracker>,
}

impl TestContext {
    /// 订阅领域事件
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.events.subscribe()
    }

    /// 基于同一服务图的HTTP测试服务器
    pub fn server(&self) -> TestServer {
        let app = routes::app(AppState {
            settings: self.settings.clone(),
            messenger: self.messenger.clone(),
            bulk: self.bulk.clone(),
            tracker: self.tracker.clone(),
        });
        TestServer::new(app).expect("Failed to create test server")
    }
}

/// 测试配置：mocktest 为默认供应商，twilio 指向 `twilio_base_url`
pub fn test_settings(twilio_base_url: &str) -> Settings {
    Settings::defaults()
        .unwrap()
        .set_override("server.public_url", PUBLIC_URL)
        .unwrap()
        .set_override("providers.twilio.account_sid", "AC123")
        .unwrap()
        .set_override("providers.twilio.auth_token", TWILIO_AUTH_TOKEN)
        .unwrap()
        .set_override("providers.twilio.from", "+15550000000")
        .unwrap()
        .set_override("providers.twilio.base_url", twilio_base_url)
        .unwrap()
        .build()
        .unwrap()
        .try_deserialize()
        .unwrap()
}

pub async fn create_context() -> TestContext {
    create_context_with(test_settings("http://127.0.0.1:9")).await
}

pub async fn create_context_with(settings: Settings) -> TestContext {
    let db_settings = DatabaseSettings {
        url: "sqlite::memory:".to_string(),
        max_connections: Some(1),
        min_connections: Some(1),
        connect_timeout: Some(10),
        idle_timeout: None,
    };
    let db = Arc::new(
        connection::connect_and_migrate(&db_settings)
            .await
            .expect("Failed to create test database"),
    );

    let settings = Arc::new(settings);
    let messages = Arc::new(MessageRepositoryImpl::new(db.clone()));
    let batches = Arc::new(BatchRepositoryImpl::new(db.clone()));
    let records = Arc::new(WebhookRecordRepoImpl::new(db.clone()));

    let registry = Arc::new(ProviderRegistry::new(
        settings.providers.clone(),
        Duration::from_secs(5),
    ));
    let mock = Arc::new(MockProvider::new(0.10).with_webhook_secret(MOCK_WEBHOOK_SECRET));
    registry.register_instance(mock.clone());

    let breaker = Arc::new(CircuitBreaker::new(
        Arc::new(InMemoryKeyValueStore::new()),
        CircuitConfig::from(&settings.circuit_breaker),
    ));
    let queue = Arc::new(InMemoryDispatchQueue::new());
    let events = Arc::new(BroadcastEventBus::new(1024));

    let messenger = Arc::new(MessengerService::new(
        messages.clone(),
        registry.clone(),
        breaker.clone(),
        queue.clone(),
        events.clone(),
        DispatchOptions {
            fallback_enabled: false,
            ..DispatchOptions::from(&settings.dispatch)
        },
    ));
    let bulk = Arc::new(BulkMessageService::new(
        messages.clone(),
        batches.clone(),
        messenger.clone(),
        BulkDefaults::from(&settings.bulk),
    ));
    let tracker = Arc::new(DeliveryTracker::new(
        messages.clone(),
        records.clone(),
        registry.clone(),
        events.clone(),
        settings.webhook.clone(),
    ));

    TestContext {
        settings,
        db,
        messages,
        batches,
        records,
        registry,
        breaker,
        queue,
        events,
        mock,
        messenger,
        bulk,
        tracker,
    }
}

/// 取出当前已发布的全部事件
pub fn drain_events(rx: &mut broadcast::Receiver<MessageEvent>) -> Vec<MessageEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// 生成不同的测试号码
pub fn phone(i: usize) -> String {
    format!("+1555{:07}", i)
}

#[allow(dead_code)]
pub fn no_variables() -> HashMap<String, String> {
    HashMap::new()
}
