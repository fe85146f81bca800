// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::config::settings::MetricsSettings;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, warn};

/// 初始化Prometheus指标导出
pub fn init_metrics(settings: &MetricsSettings) {
    if !settings.enabled {
        info!("Metrics exporter disabled");
        return;
    }

    let addr: SocketAddr = match settings.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("Invalid metrics listen address {}: {}", settings.listen, e);
            return;
        }
    };

    // Ignore error if address is already in use (for development/testing)
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!("Failed to install Prometheus recorder: {}. This might happen if the port is already in use.", e);
        return;
    }

    describe_metrics();
    info!("Metrics exporter listening on {}", addr);
}

fn describe_metrics() {
    describe_counter!("messages_sent_total", "Messages accepted by a provider");
    describe_counter!("messages_failed_total", "Messages that failed to send");
    describe_counter!(
        "messages_rejected_total",
        "Send attempts rejected before reaching a provider"
    );
    describe_counter!("webhooks_received_total", "Inbound provider webhooks");
    describe_counter!("bulk_chunks_processed_total", "Bulk chunks processed");
    describe_gauge!(
        "circuit_breaker_status",
        "Circuit state per provider (0 closed, 0.5 half open, 1 open)"
    );
    describe_gauge!("provider_healthy", "Last health probe result per provider");
    describe_gauge!("dispatch_queue_depth", "Jobs waiting in the dispatch queue");
    describe_histogram!(
        "provider_send_duration_seconds",
        "Latency of provider send calls"
    );
}
