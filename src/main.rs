// Copyright 2025 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use messenger::config::settings::{Settings, StoreKind};
use messenger::domain::services::bulk_message_service::{BulkDefaults, BulkMessageService};
use messenger::domain::services::delivery_tracker::DeliveryTracker;
use messenger::domain::services::messenger_service::{DispatchOptions, MessengerService};
use messenger::infrastructure::cache::kv_store::{InMemoryKeyValueStore, KeyValueStore};
use messenger::infrastructure::cache::redis_client::RedisKeyValueStore;
use messenger::infrastructure::database::connection;
use messenger::infrastructure::repositories::batch_repo_impl::BatchRepositoryImpl;
use messenger::infrastructure::repositories::message_repo_impl::MessageRepositoryImpl;
use messenger::infrastructure::repositories::webhook_record_repo_impl::WebhookRecordRepoImpl;
use messenger::infrastructure::services::event_bus::BroadcastEventBus;
use messenger::presentation::routes::{self, AppState};
use messenger::providers::circuit_breaker::{CircuitBreaker, CircuitConfig};
use messenger::providers::health_monitor::{HealthCheckConfig, ProviderHealthMonitor};
use messenger::providers::registry::ProviderRegistry;
use messenger::queue::dispatch_queue::{DispatchQueue, InMemoryDispatchQueue};
use messenger::utils::telemetry;
use messenger::workers::automation::AutomationLoop;
use messenger::workers::manager::WorkerManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 主函数
///
/// 应用程序入口点，负责初始化所有组件并启动服务
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load configuration
    let settings = Arc::new(Settings::new()?);

    // 2. Initialize logging and metrics
    telemetry::init_telemetry(&settings.logging);
    info!("Starting messenger...");
    messenger::infrastructure::metrics::init_metrics(&settings.metrics);

    // 3. Connect to database and run migrations
    let db = Arc::new(connection::connect_and_migrate(&settings.database).await?);
    info!("Database connection established");

    // 4. Shared key-value store for circuit breaker state
    let store: Arc<dyn KeyValueStore> = match settings.circuit_breaker.store {
        StoreKind::Redis => {
            info!("Using Redis for circuit breaker state");
            Arc::new(RedisKeyValueStore::new(&settings.redis.url)?)
        }
        StoreKind::Memory => Arc::new(InMemoryKeyValueStore::new()),
    };

    // 5. Repositories
    let messages = Arc::new(MessageRepositoryImpl::new(db.clone()));
    let batches = Arc::new(BatchRepositoryImpl::new(db.clone()));
    let records = Arc::new(WebhookRecordRepoImpl::new(db.clone()));

    // 6. Providers
    let registry = Arc::new(ProviderRegistry::new(
        settings.providers.clone(),
        settings.dispatch.send_timeout(),
    ));
    info!(providers = ?registry.configured(), "Provider registry initialized");
    let breaker = Arc::new(CircuitBreaker::new(
        store,
        CircuitConfig::from(&settings.circuit_breaker),
    ));
    let health_monitor = Arc::new(ProviderHealthMonitor::new(
        registry.clone(),
        HealthCheckConfig::default(),
    ));

    // 7. Services
    let queue: Arc<dyn DispatchQueue> = Arc::new(InMemoryDispatchQueue::new());
    let events = Arc::new(BroadcastEventBus::default());
    let messenger = Arc::new(MessengerService::new(
        messages.clone(),
        registry.clone(),
        breaker,
        queue.clone(),
        events.clone(),
        DispatchOptions::from(&settings.dispatch),
    ));
    let bulk = Arc::new(BulkMessageService::new(
        messages.clone(),
        batches.clone(),
        messenger.clone(),
        BulkDefaults::from(&settings.bulk),
    ));
    let tracker = Arc::new(DeliveryTracker::new(
        messages.clone(),
        records,
        registry,
        events,
        settings.webhook.clone(),
    ));

    // 8. Background workers
    let mut manager = WorkerManager::new(queue.clone(), messenger.clone());
    manager.start_workers(settings.dispatch.workers);
    if settings.automation.enabled {
        let automation = AutomationLoop::new(
            messages,
            batches,
            messenger.clone(),
            bulk.clone(),
            tracker.clone(),
            queue,
            settings.automation.clone(),
        )
        .with_health_monitor(health_monitor);
        manager.start_automation(automation);
    }

    // 9. HTTP server
    let app = routes::app(AppState {
        settings: settings.clone(),
        messenger,
        bulk,
        tracker,
    });

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = manager.wait_for_shutdown() => {}
    }

    info!("Messenger stopped");
    Ok(())
}
