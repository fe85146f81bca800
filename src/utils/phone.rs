// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use once_cell::sync::Lazy;
use regex::Regex;

static E164: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("E.164 regex is valid"));

/// 判断号码是否为 E.164 格式
pub fn is_e164(number: &str) -> bool {
    E164.is_match(number)
}

/// 将号码规范化为 E.164 格式
///
/// 去除空格、括号、连字符和点号；`00` 前缀视为国际前缀；
/// 没有国际前缀的本地号码去掉开头的 0 后加上默认国家码
///
/// # 参数
///
/// * `raw` - 原始号码
/// * `default_country_code` - 默认国家码（不含 +），如 "1"、"254"
///
/// # 返回值
///
/// 规范化后的号码，无法规范化时返回 None
pub fn normalize_e164(raw: &str, default_country_code: Option<&str>) -> Option<String> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("whatsapp:").unwrap_or(raw);

    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();

    let candidate = if let Some(rest) = cleaned.strip_prefix('+') {
        format!("+{}", rest)
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{}", rest)
    } else {
        let country = default_country_code?.trim_start_matches('+');
        format!("+{}{}", country, cleaned.trim_start_matches('0'))
    };

    is_e164(&candidate).then_some(candidate)
}
