// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod automation_test;
pub mod bulk_test;
pub mod delivery_tracker_test;
pub mod helpers;
pub mod messenger_test;
pub mod webhook_api_test;
