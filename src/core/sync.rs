//! Firewall synchronization
//!
//! [`FirewallSync`] is the only thing the allowlist manager knows about the
//! firewall: a single `replace_rule` call that either succeeds or returns the
//! backend's message. Backends are built from a [`FirewallConfig`] that the
//! manager never inspects.

use crate::core::error::FirewallError;
use crate::core::nft_json::{NftablesConfig, NftablesFirewall};
use crate::validators::{NormalizedCidr, to_strings};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Replaces the full set of addresses enforced for one rule identifier
pub trait FirewallSync: Send + Sync {
    fn replace_rule(
        &self,
        rule_identifier: &str,
        ips: &[NormalizedCidr],
    ) -> impl Future<Output = Result<(), FirewallError>> + Send;
}

/// Backend selection and settings, passed through unmodified to the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum FirewallConfig {
    Nftables(NftablesConfig),
    /// Keeps rules in process memory; nothing is enforced. For tests and
    /// embedding only: the CLI refuses it (see `AppConfig::firewall_backend`).
    Memory {
        #[serde(default)]
        label: Option<String>,
    },
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self::Nftables(NftablesConfig::default())
    }
}

/// In-memory rule registry.
///
/// Scoped to the instance (clones share it), never process-wide. Records the
/// configuration it was built with so callers can check it was passed through.
#[derive(Debug, Clone)]
pub struct MemoryFirewall {
    config: FirewallConfig,
    rules: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl MemoryFirewall {
    pub fn new(config: FirewallConfig) -> Self {
        Self {
            config,
            rules: Arc::default(),
        }
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// Addresses currently held for a rule, `None` if it was never written
    pub fn rule(&self, rule_identifier: &str) -> Option<Vec<String>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rule_identifier)
            .cloned()
    }

    /// Seeds a rule directly, bypassing validation
    pub fn insert_rule(&self, rule_identifier: &str, ips: Vec<String>) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rule_identifier.to_string(), ips);
    }

    pub fn rule_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl FirewallSync for MemoryFirewall {
    async fn replace_rule(
        &self,
        rule_identifier: &str,
        ips: &[NormalizedCidr],
    ) -> Result<(), FirewallError> {
        debug!(rule = rule_identifier, entries = ips.len(), "Replacing in-memory rule");
        self.insert_rule(rule_identifier, to_strings(ips));
        Ok(())
    }
}

impl FirewallSync for NftablesFirewall {
    async fn replace_rule(
        &self,
        rule_identifier: &str,
        ips: &[NormalizedCidr],
    ) -> Result<(), FirewallError> {
        NftablesFirewall::replace_rule(self, rule_identifier, ips).await
    }
}

/// Firewall backend chosen from configuration
#[derive(Debug, Clone)]
pub enum Backend {
    Nftables(NftablesFirewall),
    Memory(MemoryFirewall),
}

impl Backend {
    pub fn from_config(config: &FirewallConfig) -> Self {
        match config {
            FirewallConfig::Nftables(nft) => Self::Nftables(NftablesFirewall::new(nft.clone())),
            FirewallConfig::Memory { .. } => Self::Memory(MemoryFirewall::new(config.clone())),
        }
    }
}

impl FirewallSync for Backend {
    async fn replace_rule(
        &self,
        rule_identifier: &str,
        ips: &[NormalizedCidr],
    ) -> Result<(), FirewallError> {
        match self {
            Self::Nftables(nft) => nft.replace_rule(rule_identifier, ips).await,
            Self::Memory(mem) => mem.replace_rule(rule_identifier, ips).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::{IpPolicy, validate_ip_or_cidr};

    #[tokio::test]
    async fn test_memory_firewall_replaces() {
        let firewall = MemoryFirewall::new(FirewallConfig::Memory { label: None });
        let policy = IpPolicy::default();

        let first = vec![validate_ip_or_cidr("8.8.8.8", &policy).unwrap()];
        let second = vec![validate_ip_or_cidr("1.1.1.1", &policy).unwrap()];

        firewall.replace_rule("alice", &first).await.unwrap();
        firewall.replace_rule("alice", &second).await.unwrap();

        assert_eq!(firewall.rule("alice"), Some(vec!["1.1.1.1".to_string()]));
        assert_eq!(firewall.rule_identifiers(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_memory_firewall_clones_share_rules() {
        let firewall = MemoryFirewall::new(FirewallConfig::Memory { label: None });
        let handle = firewall.clone();
        firewall.replace_rule("acme", &[]).await.unwrap();
        assert_eq!(handle.rule("acme"), Some(vec![]));
    }

    #[test]
    fn test_backend_receives_config_unmodified() {
        let config = FirewallConfig::Memory {
            label: Some("the-config".into()),
        };
        match Backend::from_config(&config) {
            Backend::Memory(mem) => assert_eq!(mem.config(), &config),
            Backend::Nftables(_) => panic!("expected memory backend"),
        }
    }

    #[test]
    fn test_config_parsing() {
        let config: FirewallConfig = serde_json::from_str(
            r#"{ "backend": "nftables", "table": "edge", "elevation": "sudo" }"#,
        )
        .unwrap();
        match config {
            FirewallConfig::Nftables(nft) => {
                assert_eq!(nft.table, "edge");
                assert_eq!(nft.set_prefix, "dbdirect");
                assert_eq!(nft.elevation, crate::elevation::ElevationMethod::Sudo);
            }
            FirewallConfig::Memory { .. } => panic!("expected nftables"),
        }
    }
}
