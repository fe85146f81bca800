// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

//! 性能基准测试套件
//!
//! 覆盖模板渲染、分段计算、调度队列和消息持久化

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use messenger::domain::models::message::{
    render_content, Message, MessageStatus, Priority, SendRequest,
};
use messenger::domain::repositories::message_repository::MessageRepository;
use messenger::domain::services::bulk_message_service::segment_count;
use messenger::infrastructure::repositories::message_repo_impl::MessageRepositoryImpl;
use messenger::queue::dispatch_queue::{DispatchJob, DispatchQueue, InMemoryDispatchQueue};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection, DbErr};
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// 创建测试数据库连接并运行迁移
async fn create_test_db() -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

fn request(i: usize) -> SendRequest {
    SendRequest {
        to: format!("+1555{:07}", i),
        message: Some("Hi {{name}}, your code is {{code}}".to_string()),
        variables: HashMap::from([
            ("name".to_string(), format!("user{}", i)),
            ("code".to_string(), format!("{:06}", i)),
        ]),
        ..Default::default()
    }
}

/// 基准测试：模板渲染与分段
fn benchmark_content(c: &mut Criterion) {
    let mut group = c.benchmark_group("content");
    let variables = HashMap::from([
        ("name".to_string(), "Ada".to_string()),
        ("shop".to_string(), "Main St".to_string()),
    ]);

    for repeat in [1, 10, 50].iter() {
        let template = "Hi {{name}}, visit {{shop}} today! ".repeat(*repeat);
        group.bench_with_input(BenchmarkId::new("render", repeat), &template, |b, t| {
            b.iter(|| black_box(render_content(t, &variables)))
        });
        group.bench_with_input(BenchmarkId::new("segments", repeat), &template, |b, t| {
            b.iter(|| black_box(segment_count(t)))
        });
    }

    group.finish();
}

/// 基准测试：调度队列入队和出队
fn benchmark_dispatch_queue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_queue");

    for size in [100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("enqueue_dequeue", size),
            size,
            |b, &size| {
                b.to_async(&rt).iter(|| async move {
                    let queue = InMemoryDispatchQueue::new();
                    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];
                    for i in 0..size {
                        let job = DispatchJob {
                            message_id: Uuid::new_v4(),
                            priority: priorities[i % priorities.len()],
                        };
                        queue.enqueue(job, None).await.unwrap();
                    }
                    while let Some(job) = queue.dequeue().await.unwrap() {
                        black_box(job);
                    }
                });
            },
        );
    }

    group.finish();
}

/// 基准测试：消息持久化
fn benchmark_message_persistence(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = rt
        .block_on(create_test_db())
        .expect("Failed to setup test database");
    let repo = Arc::new(MessageRepositoryImpl::new(Arc::new(db)));

    let mut group = c.benchmark_group("message_persistence");
    group.sample_size(20);

    for size in [10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("create_many", size), size, |b, &size| {
            b.to_async(&rt).iter(|| {
                let repo = repo.clone();
                async move {
                    let messages: Vec<Message> = (0..size)
                        .map(|i| Message::new("mocktest", &request(i), MessageStatus::Pending))
                        .collect();
                    repo.create_many(&messages).await.unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_content,
    benchmark_dispatch_queue,
    benchmark_message_persistence
);
criterion_main!(benches);
