// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::kv_store::KeyValueStore;
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use std::time::Duration;

/// 原子比较并交换脚本
///
/// ARGV: 是否有期望值, 期望值, 新值, 过期毫秒数（0 为永久）
static CAS_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
if tonumber(ARGV[4]) > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#,
    )
});

/// Redis键值存储
///
/// 多实例部署时在进程之间共享熔断器状态
#[derive(Clone)]
pub struct RedisKeyValueStore {
    /// Redis客户端
    client: redis::Client,
}

impl RedisKeyValueStore {
    /// 创建新的Redis存储实例
    ///
    /// # 参数
    ///
    /// * `redis_url` - Redis连接URL
    ///
    /// # 返回值
    ///
    /// * `Ok(RedisKeyValueStore)` - Redis存储实例
    /// * `Err(anyhow::Error)` - URL无效
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.connection().await?;
        let value: Option<String> = con.get(key).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut con = self.connection().await?;
        match ttl {
            Some(ttl) => {
                con.pset_ex::<_, _, ()>(key, value, ttl.as_millis() as u64)
                    .await?
            }
            None => con.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.connection().await?;
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut con = self.connection().await?;
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0);

        let swapped: i32 = CAS_SCRIPT
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_ms)
            .invoke_async(&mut con)
            .await?;

        Ok(swapped == 1)
    }
}
