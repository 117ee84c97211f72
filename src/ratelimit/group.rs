//! Named rate limit policies and request dispatch.

use axum::http::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::identity::ClientIdentity;
use super::registry::LimiterRegistry;
use super::rules::{DispatchRule, DispatchTable, PolicyConfig, RuleConfig};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TrackgateError};

/// One named policy and the buckets of every client it has seen.
#[derive(Debug)]
pub struct Policy {
    name: String,
    config: PolicyConfig,
    registry: LimiterRegistry,
}

impl Policy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No rule matched; no bucket was consulted
    Unlimited,
    /// A token was taken from the named policy's bucket
    Allowed { policy: String },
    /// The named policy's bucket was empty
    Rejected { policy: String },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// A set of independently configured policies plus the rules that route
/// each request to at most one of them.
///
/// Policies and rules are registered during startup (`&mut self`); once
/// traffic flows the group is shared behind an `Arc` and only the bucket
/// state inside each registry changes.
pub struct PolicyGroup {
    policies: HashMap<String, Policy>,
    rules: DispatchTable,
    clock: Arc<dyn Clock>,
}

impl PolicyGroup {
    /// Create an empty group using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty group whose buckets read time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            policies: HashMap::new(),
            rules: DispatchTable::new(),
            clock,
        }
    }

    /// Build a group from configuration: every policy, then every rule.
    ///
    /// Fails on the first invalid policy or rule. Must be called inside a
    /// tokio runtime, since each policy starts its eviction sweeper.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let mut group = Self::new();

        if !config.enabled {
            info!("Rate limiting disabled; all requests will be admitted");
            return Ok(group);
        }

        for (name, policy) in &config.policies {
            group.add(name, policy.clone())?;
        }
        for rule in &config.rules {
            group.add_rule(rule)?;
        }

        Ok(group)
    }

    /// Register a policy and start its eviction sweeper.
    ///
    /// Misconfiguration is reported here, at startup, never at request time.
    pub fn add(&mut self, name: &str, config: PolicyConfig) -> Result<()> {
        config.validate(name)?;
        if self.policies.contains_key(name) {
            return Err(TrackgateError::DuplicatePolicy(name.to_string()));
        }

        let registry = LimiterRegistry::new(&config, Arc::clone(&self.clock));
        registry.start_sweeper()?;

        info!(
            policy = %name,
            requests_per_second = config.requests_per_second,
            burst = config.burst,
            cleanup_interval_ms = config.cleanup_interval_ms,
            ttl_ms = config.ttl().as_millis() as u64,
            "Registered rate limit policy"
        );

        self.policies.insert(
            name.to_string(),
            Policy {
                name: name.to_string(),
                config,
                registry,
            },
        );
        Ok(())
    }

    /// Append a dispatch rule. The policy it names must already exist.
    pub fn add_rule(&mut self, rule: &RuleConfig) -> Result<()> {
        if !self.policies.contains_key(&rule.policy) {
            return Err(TrackgateError::UnknownPolicy(rule.policy.clone()));
        }

        let compiled = DispatchRule::from_config(rule)?;
        debug!(
            method = %compiled.method(),
            path = %compiled.pattern().as_str(),
            policy = %compiled.policy(),
            "Added dispatch rule"
        );
        self.rules.push(compiled);
        Ok(())
    }

    /// Name of the policy that governs `method path`, if any.
    pub fn resolve_policy(&self, method: &Method, path: &str) -> Option<&str> {
        self.rules.resolve(method, path)
    }

    /// Decide whether a request from `client` may proceed.
    pub fn check(&self, method: &Method, path: &str, client: &ClientIdentity) -> Admission {
        let Some(name) = self.resolve_policy(method, path) else {
            trace!(%method, path, "No rate limit policy applies");
            return Admission::Unlimited;
        };

        let Some(policy) = self.policies.get(name) else {
            // Rules are checked against policies when added; stay open if
            // that invariant is ever broken rather than failing the request.
            warn!(policy = %name, "Dispatch rule names a missing policy");
            return Admission::Unlimited;
        };

        if policy.registry.allow(client.as_str()) {
            Admission::Allowed {
                policy: name.to_string(),
            }
        } else {
            Admission::Rejected {
                policy: name.to_string(),
            }
        }
    }

    pub fn policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Registered policy names, sorted.
    pub fn policy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn rules(&self) -> &DispatchTable {
        &self.rules
    }

    /// Stop every policy's eviction sweeper.
    pub fn stop_all(&self) {
        for policy in self.policies.values() {
            policy.registry.stop();
        }
    }

    /// Stop every sweeper and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        for policy in self.policies.values() {
            policy.registry.shutdown().await;
        }
        info!(policies = self.policies.len(), "Stopped rate limit sweepers");
    }
}

impl Default for PolicyGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicyGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyGroup")
            .field("policies", &self.policy_names())
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::time::Duration;

    fn client(ip: &str) -> ClientIdentity {
        ClientIdentity::new(ip)
    }

    fn track_group(clock: ManualClock) -> PolicyGroup {
        let mut group = PolicyGroup::with_clock(Arc::new(clock));
        group.add("upload", PolicyConfig::new(1.0, 1)).unwrap();
        group.add("download", PolicyConfig::new(10.0, 10)).unwrap();
        group.add("list", PolicyConfig::new(10.0, 10)).unwrap();
        group.add_rule(&RuleConfig::new("POST", "/api/tracks", "upload")).unwrap();
        group
            .add_rule(&RuleConfig::new("GET", "/api/tracks/{id}/download", "download"))
            .unwrap();
        group.add_rule(&RuleConfig::new("GET", "/api/tracks", "list")).unwrap();
        group
    }

    #[tokio::test]
    async fn test_policies_are_independent() {
        let group = track_group(ManualClock::new());
        let a = client("192.168.1.1");

        assert_eq!(
            group.check(&Method::POST, "/api/tracks", &a),
            Admission::Allowed { policy: "upload".to_string() }
        );
        assert_eq!(
            group.check(&Method::POST, "/api/tracks", &a),
            Admission::Rejected { policy: "upload".to_string() }
        );

        // Exhausting uploads leaves downloads untouched
        for _ in 0..5 {
            assert!(group
                .check(&Method::GET, "/api/tracks/abc123/download", &a)
                .is_admitted());
        }

        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_unmatched_requests_create_no_state() {
        let group = track_group(ManualClock::new());
        let a = client("192.168.1.1");

        for _ in 0..50 {
            assert_eq!(group.check(&Method::GET, "/api/health", &a), Admission::Unlimited);
        }

        for name in group.policy_names() {
            assert!(group.policy(name).unwrap().registry().is_empty());
        }

        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_refill_through_group() {
        let clock = ManualClock::new();
        let group = track_group(clock.clone());
        let a = client("192.168.1.1");

        assert!(group.check(&Method::POST, "/api/tracks", &a).is_admitted());
        assert!(!group.check(&Method::POST, "/api/tracks", &a).is_admitted());

        clock.advance(Duration::from_secs(1));
        assert!(group.check(&Method::POST, "/api/tracks", &a).is_admitted());
        assert!(!group.check(&Method::POST, "/api/tracks", &a).is_admitted());

        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_policy() {
        let mut group = PolicyGroup::new();
        let err = group.add("upload", PolicyConfig::new(-1.0, 1)).unwrap_err();
        assert!(matches!(err, TrackgateError::InvalidPolicy { .. }));
        assert!(group.policy("upload").is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_policy() {
        let mut group = PolicyGroup::new();
        group.add("upload", PolicyConfig::new(1.0, 1)).unwrap();
        let err = group.add("upload", PolicyConfig::new(2.0, 2)).unwrap_err();
        assert!(matches!(err, TrackgateError::DuplicatePolicy(name) if name == "upload"));
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_rule_for_unknown_policy_rejected() {
        let mut group = PolicyGroup::new();
        let err = group
            .add_rule(&RuleConfig::new("GET", "/api/tracks", "list"))
            .unwrap_err();
        assert!(matches!(err, TrackgateError::UnknownPolicy(name) if name == "list"));
    }

    #[tokio::test]
    async fn test_from_config_defaults() {
        let config = RateLimitingConfig::default();
        let group = PolicyGroup::from_config(&config).unwrap();

        assert_eq!(group.policy_names(), vec!["download", "list", "upload"]);
        assert_eq!(
            group.resolve_policy(&Method::POST, "/api/tracks"),
            Some("upload")
        );
        assert_eq!(group.resolve_policy(&Method::GET, "/api/health"), None);
        for name in group.policy_names() {
            let policy = group.policy(name).unwrap();
            assert_eq!(policy.config(), &config.policies[name]);
            assert!(policy.registry().is_sweeping());
        }

        let rules = group.rules().rules();
        assert_eq!(rules.len(), config.rules.len());
        for (rule, rule_config) in rules.iter().zip(&config.rules) {
            assert_eq!(rule.policy(), rule_config.policy);
            assert_eq!(rule.method().as_str(), rule_config.method);
            assert_eq!(rule.pattern().as_str(), rule_config.path);
        }

        group.shutdown().await;
        for name in group.policy_names() {
            assert!(!group.policy(name).unwrap().registry().is_sweeping());
        }
    }

    #[tokio::test]
    async fn test_from_config_disabled() {
        let config = RateLimitingConfig {
            enabled: false,
            ..RateLimitingConfig::default()
        };
        let group = PolicyGroup::from_config(&config).unwrap();

        assert!(group.policy_names().is_empty());
        assert_eq!(
            group.check(&Method::POST, "/api/tracks", &client("10.0.0.1")),
            Admission::Unlimited
        );
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let group = track_group(ManualClock::new());
        group.stop_all();
        group.stop_all();
        group.shutdown().await;
    }

    #[test]
    fn test_add_outside_runtime_fails() {
        let mut group = PolicyGroup::new();
        let err = group.add("upload", PolicyConfig::new(1.0, 1)).unwrap_err();
        assert!(matches!(err, TrackgateError::Runtime(_)));
    }
}
