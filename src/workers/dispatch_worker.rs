// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::services::messenger_service::{MessengerError, MessengerService};
use crate::queue::dispatch_queue::{DispatchJob, DispatchQueue};
use crate::workers::worker::{Worker, WorkerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 队列为空时的最长等待时间
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// 调度工作者
///
/// 从调度队列取出任务并发送对应的消息。发送失败已经记录在消息上，
/// 这里只记录日志，没有同步调用方需要通知
pub struct DispatchWorker {
    worker_id: usize,
    queue: Arc<dyn DispatchQueue>,
    messenger: Arc<MessengerService>,
}

impl DispatchWorker {
    pub fn new(
        worker_id: usize,
        queue: Arc<dyn DispatchQueue>,
        messenger: Arc<MessengerService>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            messenger,
        }
    }

    /// 处理一个任务
    ///
    /// # 返回值
    ///
    /// * `Ok(true)` - 取到并处理了一个任务
    /// * `Ok(false)` - 队列中没有可执行的任务
    pub async fn process_next(&self) -> Result<bool, WorkerError> {
        let job = self
            .queue
            .dequeue()
            .await
            .map_err(|e| WorkerError::QueueError(e.to_string()))?;

        match job {
            Some(job) => {
                self.process_job(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self), fields(worker_id = self.worker_id, message_id = %job.message_id))]
    async fn process_job(&self, job: DispatchJob) {
        match self.messenger.send_existing(job.message_id).await {
            Ok(Some(outcome)) => {
                debug!(status = %outcome.message.status, "Queued message dispatched");
            }
            Ok(None) => debug!("Queued message skipped"),
            Err(e @ MessengerError::SendFailed { .. })
            | Err(e @ MessengerError::ProviderUnavailable(_))
            | Err(e @ MessengerError::ConsentRequired(_)) => {
                warn!(code = e.code(), "Queued message not sent: {}", e);
            }
            Err(e) => error!(code = e.code(), "Queued message dispatch failed: {}", e),
        }
    }
}

#[async_trait]
impl Worker for DispatchWorker {
    async fn run(&self) -> Result<(), WorkerError> {
        info!("Dispatch worker {} started", self.worker_id);

        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => self.queue.wait(IDLE_WAIT).await,
                Err(e) => {
                    error!("Error processing dispatch job: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn name(&self) -> &str {
        "dispatch-worker"
    }
}
