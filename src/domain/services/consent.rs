// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::message::Channel;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;

/// 收件人同意检查特质
///
/// 联系人与同意管理由外部系统负责，这里只消费一个布尔结果
#[async_trait]
pub trait ConsentChecker: Send + Sync {
    /// 检查收件人是否同意接收该渠道的消息
    ///
    /// # 参数
    ///
    /// * `recipient` - E.164 格式的收件人号码
    /// * `channel` - 发送渠道
    ///
    /// # 返回值
    ///
    /// * `Ok(true)` - 允许发送
    /// * `Ok(false)` - 收件人未同意
    /// * `Err(anyhow::Error)` - 检查失败
    async fn has_consent(&self, recipient: &str, channel: Channel) -> Result<bool>;
}

/// 基于退订名单的同意检查
///
/// 名单中的号码在所有渠道上都被拒绝
#[derive(Default)]
pub struct OptOutList {
    numbers: DashSet<String>,
}

impl OptOutList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入退订名单
    pub fn opt_out(&self, recipient: &str) {
        self.numbers.insert(recipient.to_string());
    }

    /// 移出退订名单
    pub fn opt_in(&self, recipient: &str) {
        self.numbers.remove(recipient);
    }
}

#[async_trait]
impl ConsentChecker for OptOutList {
    async fn has_consent(&self, recipient: &str, _channel: Channel) -> Result<bool> {
        Ok(!self.numbers.contains(recipient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opt_out_list() {
        let list = OptOutList::new();
        list.opt_out("+15550001111");

        assert!(!list
            .has_consent("+15550001111", Channel::Sms)
            .await
            .unwrap());
        assert!(list.has_consent("+15550002222", Channel::Sms).await.unwrap());

        list.opt_in("+15550001111");
        assert!(list
            .has_consent("+15550001111", Channel::Whatsapp)
            .await
            .unwrap());
    }
}
