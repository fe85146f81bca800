// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 供应商模块
///
/// 包含适配器契约、具体供应商适配器、熔断器、注册表和健康监控
pub mod africastalking;
pub mod circuit_breaker;
pub mod health_monitor;
pub mod mock_provider;
pub mod registry;
pub mod traits;
pub mod twilio;
