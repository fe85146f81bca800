// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

/// 数据传输对象模块
///
/// 定义HTTP请求和响应的数据结构，以及它们与领域模型之间的转换
pub mod batch_request;
pub mod send_request;
