// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// 键值存储特质
///
/// 为熔断器等共享状态提供最小的存取接口，
/// 单实例部署使用进程内实现，多实例部署使用Redis实现
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 获取指定键的值
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 写入键值对
    ///
    /// # 参数
    ///
    /// * `key` - 键
    /// * `value` - 值
    /// * `ttl` - 过期时间，None 表示永久
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// 删除键
    async fn delete(&self, key: &str) -> Result<()>;

    /// 比较并交换
    ///
    /// 仅当当前值等于 `expected`（None 表示键不存在）时写入新值
    ///
    /// # 返回值
    ///
    /// * `Ok(true)` - 写入成功
    /// * `Ok(false)` - 当前值已被其他写入者修改
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// 进程内键值存储
///
/// 基于DashMap，CAS 在分片锁内完成
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| !v.is_live());
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current = current.is_live().then_some(current.value.as_str());
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(StoredValue::new(new, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(StoredValue::new(new, ttl));
                Ok(true)
            }
        }
    }
}
