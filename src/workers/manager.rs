// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::services::messenger_service::MessengerService;
use crate::queue::dispatch_queue::DispatchQueue;
use crate::workers::automation::AutomationLoop;
use crate::workers::dispatch_worker::DispatchWorker;
use crate::workers::worker::Worker;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// 工作管理器
///
/// 负责启动调度工作者和自动化循环，并在关闭时终止它们
pub struct WorkerManager {
    queue: Arc<dyn DispatchQueue>,
    messenger: Arc<MessengerService>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerManager {
    pub fn new(queue: Arc<dyn DispatchQueue>, messenger: Arc<MessengerService>) -> Self {
        Self {
            queue,
            messenger,
            handles: Vec::new(),
        }
    }

    /// 启动调度工作者
    ///
    /// # 参数
    ///
    /// * `count` - 要启动的工作者数量
    pub fn start_workers(&mut self, count: usize) {
        for worker_id in 0..count {
            let worker = DispatchWorker::new(worker_id, self.queue.clone(), self.messenger.clone());
            self.spawn(Arc::new(worker));
        }
        info!("Started {} dispatch workers", count);
    }

    /// 启动自动化循环
    pub fn start_automation(&mut self, automation: AutomationLoop) {
        self.spawn(Arc::new(automation));
    }

    fn spawn(&mut self, worker: Arc<dyn Worker>) {
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!("Worker {} stopped: {}", worker.name(), e);
            }
        });
        self.handles.push(handle);
    }

    /// 正在运行的任务数
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// 终止所有工作者
    pub fn shutdown(&mut self) {
        info!("Shutting down workers...");
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("Workers shut down successfully");
    }

    /// 等待关闭信号并关闭工作进程
    pub async fn wait_for_shutdown(&mut self) {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
        self.shutdown();
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
