// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use crate::types::{CoreError, Result};

/// 缓存清理模式：`*`、`prefix*`、`*suffix` 或精确匹配，不支持通用正则
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    All,
    Prefix(String),
    Suffix(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(CoreError::InvalidPattern("empty pattern".to_string()));
        }
        if pattern == "*" {
            return Ok(KeyPattern::All);
        }

        let stars = pattern.matches('*').count();
        match stars {
            0 => Ok(KeyPattern::Exact(pattern.to_string())),
            1 if pattern.ends_with('*') => Ok(KeyPattern::Prefix(
                pattern[..pattern.len() - 1].to_string(),
            )),
            1 if pattern.starts_with('*') => Ok(KeyPattern::Suffix(pattern[1..].to_string())),
            _ => Err(CoreError::InvalidPattern(format!(
                "'{}': only '*', 'prefix*', '*suffix' or exact keys are supported",
                pattern
            ))),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Suffix(suffix) => key.ends_with(suffix.as_str()),
            KeyPattern::Exact(exact) => key == exact,
        }
    }

    /// 转换为 Redis SCAN MATCH 使用的 glob，并转义 glob 元字符
    pub fn to_redis_glob(&self, key_prefix: &str) -> String {
        let prefix = escape_glob(key_prefix);
        match self {
            KeyPattern::All => format!("{}*", prefix),
            KeyPattern::Prefix(p) => format!("{}{}*", prefix, escape_glob(p)),
            KeyPattern::Suffix(s) => format!("{}*{}", prefix, escape_glob(s)),
            KeyPattern::Exact(e) => format!("{}{}", prefix, escape_glob(e)),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::All => write!(f, "*"),
            KeyPattern::Prefix(p) => write!(f, "{}*", p),
            KeyPattern::Suffix(s) => write!(f, "*{}", s),
            KeyPattern::Exact(e) => write!(f, "{}", e),
        }
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(KeyPattern::parse("*").unwrap(), KeyPattern::All);
        assert_eq!(
            KeyPattern::parse("inventory:*").unwrap(),
            KeyPattern::Prefix("inventory:".to_string())
        );
        assert_eq!(
            KeyPattern::parse("*:wh7").unwrap(),
            KeyPattern::Suffix(":wh7".to_string())
        );
        assert_eq!(
            KeyPattern::parse("dashboard:wh7").unwrap(),
            KeyPattern::Exact("dashboard:wh7".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_general_globs() {
        for bad in ["", "a*b", "**", "*mid*", "a*b*"] {
            assert!(
                matches!(KeyPattern::parse(bad), Err(CoreError::InvalidPattern(_))),
                "pattern {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_matches() {
        let prefix = KeyPattern::parse("inventory:wh7:*").unwrap();
        assert!(prefix.matches("inventory:wh7:sku-1"));
        assert!(!prefix.matches("inventory:wh8:sku-1"));

        let suffix = KeyPattern::parse("*:summary").unwrap();
        assert!(suffix.matches("dashboard:wh7:summary"));
        assert!(!suffix.matches("dashboard:wh7:detail"));
    }

    #[test]
    fn test_redis_glob_escaping() {
        let pattern = KeyPattern::parse("report[2024]*").unwrap();
        assert_eq!(pattern.to_redis_glob("sp:"), "sp:report\\[2024\\]*");
        assert_eq!(KeyPattern::All.to_redis_glob("sp:"), "sp:*");
    }

    proptest! {
        #[test]
        fn prop_prefix_pattern_matches_exactly_prefixed_keys(
            prefix in "[a-z:]{1,12}",
            rest in "[a-z0-9:]{0,12}",
            other in "[a-z0-9:]{0,24}",
        ) {
            let pattern = KeyPattern::parse(&format!("{}*", prefix)).unwrap();
            let prefixed = format!("{}{}", prefix, rest);
            prop_assert!(pattern.matches(&prefixed));
            prop_assert_eq!(pattern.matches(&other), other.starts_with(&prefix));
        }
    }
}
