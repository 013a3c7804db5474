//! Smart TTL policy
//!
//! Decides whether a response may be cached and for how long. Rules are
//! evaluated in stages and the first match wins:
//!
//! 1. absolute exclusions (unsafe methods, non-2xx responses)
//! 2. priority path rules
//! 3. content rules, only once the upstream response is known
//! 4. fallback path rules
//! 5. the default TTL for safe reads
//!
//! The policy holds no mutable state; identical inputs always give the same
//! answer.

use regex::Regex;
use std::time::Duration;

use crate::config::{CacheConfig, PathRuleConfig, RuleStage};
use crate::error::{ProxyError, ProxyResult};
use crate::origin::{OriginResponse, ProxyRequest};

const LARGE_MEDIA_BYTES: usize = 100_000;
const LARGE_JSON_BYTES: usize = 50_000;
const SMALL_JSON_BYTES: usize = 500;

#[derive(Debug, Clone)]
struct PathRule {
    pattern: Regex,
    ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    priority: Vec<PathRule>,
    fallback: Vec<PathRule>,
    default_ttl_secs: u64,
}

fn builtin_rules() -> Vec<PathRuleConfig> {
    let rule = |pattern: &str, ttl_secs, stage| PathRuleConfig {
        pattern: pattern.to_string(),
        ttl_secs,
        stage,
    };

    vec![
        rule(r"^/api/v1/health$", 1, RuleStage::Priority),
        rule(r"^/api/v1/analytics/report/[^/]+/status$", 5, RuleStage::Priority),
        rule(r"^/api/v1/feed/global-trending$", 5, RuleStage::Fallback),
        rule(r"^/api/v1/user/[^/]+/dashboard-summary$", 10, RuleStage::Fallback),
        rule(r"^/api/v1/content/[^/]+/full-detail$", 60, RuleStage::Fallback),
        rule(r"^/api/v1/search/advanced$", 30, RuleStage::Fallback),
        rule(r"^/api/v1/analytics/content-performance$", 30, RuleStage::Fallback),
        rule(r"^/api/v1/analytics/user-engagement-trends$", 30, RuleStage::Fallback),
        rule(r"^/api/v1/analytics/report/[^/]+/download$", 60, RuleStage::Fallback),
    ]
}

impl TtlPolicy {
    pub fn from_config(config: &CacheConfig) -> ProxyResult<Self> {
        let rules = if config.rules.is_empty() {
            builtin_rules()
        } else {
            config.rules.clone()
        };

        let mut priority = Vec::new();
        let mut fallback = Vec::new();

        for rule in rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                ProxyError::ConfigError(format!("Invalid cache rule {}: {}", rule.pattern, e))
            })?;
            let compiled = PathRule {
                pattern,
                ttl_secs: rule.ttl_secs,
            };
            match rule.stage {
                RuleStage::Priority => priority.push(compiled),
                RuleStage::Fallback => fallback.push(compiled),
            }
        }

        Ok(Self {
            priority,
            fallback,
            default_ttl_secs: config.default_ttl_secs,
        })
    }

    /// TTL in seconds; 0 means the response must not be cached.
    ///
    /// Without a response this is the pre-flight estimate used to decide
    /// whether the cache is consulted at all.
    pub fn ttl_secs(&self, request: &ProxyRequest, response: Option<&OriginResponse>) -> u64 {
        if !request.is_safe_read() {
            return 0;
        }
        if let Some(response) = response {
            if !response.is_success() {
                return 0;
            }
        }

        let path = request.path();

        if let Some(ttl) = match_rules(&self.priority, path) {
            return ttl;
        }

        if let Some(ttl) = response.and_then(content_ttl) {
            return ttl;
        }

        if let Some(ttl) = match_rules(&self.fallback, path) {
            return ttl;
        }

        self.default_ttl_secs
    }

    pub fn ttl(&self, request: &ProxyRequest, response: Option<&OriginResponse>) -> Duration {
        Duration::from_secs(self.ttl_secs(request, response))
    }
}

fn match_rules(rules: &[PathRule], path: &str) -> Option<u64> {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(path))
        .map(|rule| rule.ttl_secs)
}

fn content_ttl(response: &OriginResponse) -> Option<u64> {
    let content_type = response
        .content_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let size = response.body.len();

    if content_type.starts_with("image/") || content_type.starts_with("video/") {
        // Large media is expensive to refetch and rarely changes.
        return Some(if size > LARGE_MEDIA_BYTES { 3600 } else { 600 });
    }

    if content_type.contains("csv")
        || content_type.contains("pdf")
        || content_type.contains("octet-stream")
    {
        return Some(1800);
    }

    if content_type.contains("application/json") {
        if size > LARGE_JSON_BYTES {
            return Some(300);
        }
        // tiny JSON bodies are usually volatile status objects
        if size < SMALL_JSON_BYTES {
            return Some(10);
        }
        return Some(60);
    }

    None
}
