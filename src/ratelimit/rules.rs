//! Rate limit policy configuration and request dispatch rules.
//!
//! A [`PolicyConfig`] describes one token-bucket policy. A [`DispatchTable`]
//! maps an HTTP method and path to the name of the policy that governs it.
//! Requests that match no rule are not rate limited at all.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TrackgateError};

/// Configuration for one named rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Tokens added back per second
    pub requests_per_second: f64,
    /// Bucket capacity: requests admitted back to back before throttling
    pub burst: u32,
    /// How often idle buckets are swept, in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Idle time after which a bucket is dropped, in milliseconds.
    /// Defaults to twice the cleanup interval.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl PolicyConfig {
    /// Create a policy with the default sweep interval and TTL.
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            ttl_ms: None,
        }
    }

    /// Sweep period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Idle eviction threshold.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(
            self.ttl_ms
                .unwrap_or_else(|| self.cleanup_interval_ms.saturating_mul(2)),
        )
    }

    /// Reject parameters that could never work, naming the policy in the error.
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason: &str| {
            Err(TrackgateError::InvalidPolicy {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if !self.requests_per_second.is_finite() || self.requests_per_second < 0.0 {
            return invalid("requests_per_second must be a finite number >= 0");
        }
        if self.burst == 0 {
            return invalid("burst must be at least 1");
        }
        if self.cleanup_interval_ms == 0 {
            return invalid("cleanup_interval_ms must be greater than 0");
        }
        if self.ttl().is_zero() {
            return invalid("ttl_ms must be greater than 0");
        }
        if self.ttl() < self.cleanup_interval() {
            return invalid("ttl_ms must not be shorter than cleanup_interval_ms");
        }
        Ok(())
    }
}

/// A dispatch rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// HTTP method, e.g. `POST`
    pub method: String,
    /// Path pattern, e.g. `/api/tracks/{id}/download`
    pub path: String,
    /// Name of the policy applied to matching requests
    pub policy: String,
}

impl RuleConfig {
    pub fn new(method: &str, path: &str, policy: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            policy: policy.to_string(),
        }
    }
}

/// One segment of a path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{name}`: any single non-empty segment
    Param,
}

/// A path pattern made of literal segments and `{param}` placeholders.
///
/// Matching is segment by segment; a trailing slash is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parse a pattern such as `/api/tracks/{id}`.
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(TrackgateError::InvalidRule(format!(
                "path pattern '{}' must start with '/'",
                pattern
            )));
        }

        let mut segments = Vec::new();
        for part in split_path(pattern) {
            if part.starts_with('{') && part.ends_with('}') && part.len() > 2 {
                segments.push(Segment::Param);
            } else if part.contains('{') || part.contains('}') {
                return Err(TrackgateError::InvalidRule(format!(
                    "malformed placeholder '{}' in path pattern '{}'",
                    part, pattern
                )));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Whether `path` (no query string) matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            match (segment, parts.next()) {
                (Segment::Literal(expected), Some(actual)) if expected == actual => {}
                (Segment::Param, Some(actual)) if !actual.is_empty() => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Split a path into its segments, ignoring a trailing slash.
///
/// Empty interior segments (`//`) are kept so `/a//b` does not match `/a/b`.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let root = trimmed.is_empty();
    trimmed.split('/').take_while(move |_| !root)
}

/// A compiled dispatch rule.
#[derive(Debug, Clone)]
pub struct DispatchRule {
    method: Method,
    pattern: PathPattern,
    policy: String,
}

impl DispatchRule {
    /// Compile a rule from its configuration form.
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let method = Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                TrackgateError::InvalidRule(format!("invalid method '{}': {}", config.method, e))
            })?;
        let pattern = PathPattern::parse(config.path.trim())?;

        Ok(Self {
            method,
            pattern,
            policy: config.policy.clone(),
        })
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        &self.method == method && self.pattern.matches(path)
    }
}

/// Ordered list of dispatch rules; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    rules: Vec<DispatchRule>,
}

impl DispatchTable {
    /// Create an empty table, which matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every rule in order.
    pub fn from_configs(configs: &[RuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(DispatchRule::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Append a rule; it is tried after every existing rule.
    pub fn push(&mut self, rule: DispatchRule) {
        self.rules.push(rule);
    }

    /// Name of the policy governing `method path`, or `None` for unlimited.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(DispatchRule::policy)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[DispatchRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
