// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use super::africastalking::{self, AfricasTalkingProvider};
use super::mock_provider::{self, MockProvider};
use super::traits::{ProviderAdapter, ProviderError};
use super::twilio::{self, TwilioProvider};
use crate::domain::models::message::Channel;
use crate::domain::models::provider::{Capability, ProviderDefinition};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 单个供应商的配置块
pub type ProviderConfig = HashMap<String, String>;

/// 适配器工厂函数
pub type ProviderFactory =
    fn(&ProviderConfig, reqwest::Client) -> Result<Arc<dyn ProviderAdapter>, ProviderError>;

/// 注册项：静态定义加工厂函数
#[derive(Clone)]
pub struct ProviderRegistration {
    pub definition: &'static ProviderDefinition,
    pub factory: ProviderFactory,
}

fn make_mock(
    config: &ProviderConfig,
    _http: reqwest::Client,
) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    Ok(Arc::new(MockProvider::from_config(config)?))
}

fn make_twilio(
    config: &ProviderConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    Ok(Arc::new(TwilioProvider::from_config(config, http)?))
}

fn make_africastalking(
    config: &ProviderConfig,
    http: reqwest::Client,
) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    Ok(Arc::new(AfricasTalkingProvider::from_config(config, http)?))
}

/// 内置供应商列表
pub fn builtin_providers() -> Vec<ProviderRegistration> {
    vec![
        ProviderRegistration {
            definition: &mock_provider::DEFINITION,
            factory: make_mock,
        },
        ProviderRegistration {
            definition: &twilio::DEFINITION,
            factory: make_twilio,
        },
        ProviderRegistration {
            definition: &africastalking::DEFINITION,
            factory: make_africastalking,
        },
    ]
}

/// 供应商注册表
///
/// 把供应商名称解析为已配置的适配器实例。注册项在启动时显式给出，
/// 实例在第一次使用时创建并缓存
pub struct ProviderRegistry {
    registrations: Vec<ProviderRegistration>,
    configs: HashMap<String, ProviderConfig>,
    instances: DashMap<String, Arc<dyn ProviderAdapter>>,
    http: reqwest::Client,
}

impl ProviderRegistry {
    /// 使用内置供应商创建注册表
    ///
    /// # 参数
    ///
    /// * `configs` - 按供应商名称索引的配置块
    /// * `timeout` - 供应商HTTP调用的超时时间
    pub fn new(configs: HashMap<String, ProviderConfig>, timeout: Duration) -> Self {
        Self::with_registrations(builtin_providers(), configs, timeout)
    }

    /// 使用指定注册项创建注册表
    pub fn with_registrations(
        registrations: Vec<ProviderRegistration>,
        configs: HashMap<String, ProviderConfig>,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            registrations,
            configs,
            instances: DashMap::new(),
            http,
        }
    }

    /// 直接注册一个适配器实例，覆盖同名的工厂
    pub fn register_instance(&self, adapter: Arc<dyn ProviderAdapter>) {
        info!(provider = adapter.name(), "Registered provider instance");
        self.instances.insert(adapter.name().to_string(), adapter);
    }

    /// 获取供应商定义
    pub fn definition(&self, name: &str) -> Option<&'static ProviderDefinition> {
        if let Some(instance) = self.instances.get(name) {
            return Some(instance.definition());
        }
        self.registrations
            .iter()
            .find(|r| r.definition.name == name)
            .map(|r| r.definition)
    }

    /// 解析供应商
    ///
    /// # 参数
    ///
    /// * `name` - 供应商名称
    ///
    /// # 返回值
    ///
    /// * `Ok(Arc<dyn ProviderAdapter>)` - 适配器实例
    /// * `Err(ProviderError::NotRegistered)` - 供应商未注册
    /// * `Err(ProviderError::Configuration)` - 缺少必需配置项
    pub fn make(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(instance.clone());
        }

        let registration = self
            .registrations
            .iter()
            .find(|r| r.definition.name == name)
            .ok_or_else(|| ProviderError::NotRegistered(name.to_string()))?;

        let empty = ProviderConfig::new();
        let config = self.configs.get(name).unwrap_or(&empty);
        let missing: Vec<&str> = registration
            .definition
            .required_config
            .iter()
            .copied()
            .filter(|key| config.get(*key).map(|v| v.is_empty()).unwrap_or(true))
            .collect();
        if !missing.is_empty() {
            return Err(ProviderError::Configuration(format!(
                "provider '{}' is missing required config: {}",
                name,
                missing.join(", ")
            )));
        }

        let adapter = (registration.factory)(config, self.http.clone())?;
        debug!(provider = name, "Provider instantiated");

        Ok(self
            .instances
            .entry(name.to_string())
            .or_insert(adapter)
            .clone())
    }

    /// 所有已知供应商的名称，按注册顺序
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.registrations.iter().map(|r| r.definition.name).collect();
        for instance in self.instances.iter() {
            let name = instance.value().name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// 已配置（可以实例化）的供应商名称
    pub fn configured(&self) -> Vec<&'static str> {
        self.names()
            .into_iter()
            .filter(|name| self.instances.contains_key(*name) || self.configs.contains_key(*name))
            .collect()
    }

    /// 是否具备某项能力
    pub fn supports(&self, name: &str, capability: Capability) -> bool {
        self.definition(name)
            .map(|d| d.supports(capability))
            .unwrap_or(false)
    }

    /// 支持指定渠道的已配置供应商
    pub fn providers_for(&self, channel: Channel) -> Vec<&'static str> {
        self.configured()
            .into_iter()
            .filter(|name| self.supports(name, Capability::from(channel)))
            .collect()
    }
}
