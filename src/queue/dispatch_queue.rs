// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::message::Priority;
use async_trait::async_trait;
use metrics::gauge;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// 队列错误类型
#[derive(Error, Debug)]
pub enum QueueError {
    /// 队列已关闭
    #[error("Queue closed")]
    Closed,
}

/// 调度任务：发送一条已持久化的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchJob {
    /// 消息ID
    pub message_id: Uuid,
    /// 优先级，决定所在通道
    pub priority: Priority,
}

/// 调度队列特质
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// 入队任务
    ///
    /// # 参数
    ///
    /// * `job` - 调度任务
    /// * `delay` - 延迟执行时间，为空时立即可取
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<(), QueueError>;

    /// 取出下一个可执行的任务，高优先级通道先出
    async fn dequeue(&self) -> Result<Option<DispatchJob>, QueueError>;

    /// 等待新任务或延迟任务到期，最多等待 `timeout`
    async fn wait(&self, timeout: Duration);

    /// 当前队列中（含延迟）的任务数
    fn depth(&self) -> usize;
}

fn lane(priority: Priority) -> usize {
    match priority {
        Priority::Urgent => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

#[derive(Debug)]
struct Delayed {
    run_at: Instant,
    seq: u64,
    job: DispatchJob,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.run_at, self.seq).cmp(&(other.run_at, other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    lanes: [VecDeque<DispatchJob>; 4],
    delayed: BinaryHeap<Reverse<Delayed>>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.run_at > now {
                break;
            }
            if let Some(Reverse(due)) = self.delayed.pop() {
                self.lanes[lane(due.job.priority)].push_back(due.job);
            }
        }
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum::<usize>() + self.delayed.len()
    }
}

/// 进程内优先级队列
///
/// 四个通道 (urgent > high > normal > low) 加一个按到期时间排序的延迟堆
#[derive(Default)]
pub struct InMemoryDispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn report_depth(&self, depth: usize) {
        gauge!("dispatch_queue_depth").set(depth as f64);
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<(), QueueError> {
        let depth = {
            let mut state = self.state.lock();
            match delay.filter(|d| !d.is_zero()) {
                Some(delay) => state.delayed.push(Reverse(Delayed {
                    run_at: Instant::now() + delay,
                    seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
                    job,
                })),
                None => state.lanes[lane(job.priority)].push_back(job),
            }
            state.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchJob>, QueueError> {
        let (job, depth) = {
            let mut state = self.state.lock();
            state.promote_due(Instant::now());
            let job = state.lanes.iter_mut().find_map(VecDeque::pop_front);
            (job, state.len())
        };
        if job.is_some() {
            self.report_depth(depth);
        }
        Ok(job)
    }

    async fn wait(&self, timeout: Duration) {
        let now = Instant::now();
        let next_due = self
            .state
            .lock()
            .delayed
            .peek()
            .map(|Reverse(next)| next.run_at.saturating_duration_since(now));
        let wait_for = next_due.map(|d| d.min(timeout)).unwrap_or(timeout);

        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(wait_for) => {}
        }
    }

    fn depth(&self) -> usize {
        self.state.lock().len()
    }
}

#[async_trait]
impl<T: DispatchQueue + ?Sized> DispatchQueue for Arc<T> {
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<(), QueueError> {
        (**self).enqueue(job, delay).await
    }

    async fn dequeue(&self) -> Result<Option<DispatchJob>, QueueError> {
        (**self).dequeue().await
    }

    async fn wait(&self, timeout: Duration) {
        (**self).wait(timeout).await
    }

    fn depth(&self) -> usize {
        (**self).depth()
    }
}
