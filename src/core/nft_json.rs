//! nftables backend for allowlist rules
//!
//! Each rule identifier maps to a pair of named interval sets in a dedicated
//! `inet` table, one for IPv4 and one for IPv6:
//!
//! ```text
//! table inet dbgate {
//!     set dbdirect_acme_v4 { type ipv4_addr; flags interval; auto-merge; }
//!     set dbdirect_acme_v6 { type ipv6_addr; flags interval; auto-merge; }
//! }
//! ```
//!
//! Replacing a rule flushes both sets and re-adds every element in one
//! `nft --json -f -` batch, which nftables applies atomically. The chains
//! that match `ip saddr @dbdirect_acme_v4` against the database port are
//! owned by the host's firewall configuration, not by dbgate.

use crate::core::error::FirewallError;
use crate::elevation::{self, ElevationMethod};
use crate::utils::sha256_hex;
use crate::validators::{NormalizedCidr, sanitize_identifier};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{error, info};

/// Settings for the nftables backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NftablesConfig {
    /// Table holding the allowlist sets (family `inet`)
    #[serde(default = "default_table")]
    pub table: String,
    /// Prefix for set names
    #[serde(default = "default_set_prefix")]
    pub set_prefix: String,
    /// Path to the nft binary
    #[serde(default = "default_nft_command")]
    pub nft_command: PathBuf,
    #[serde(default)]
    pub elevation: ElevationMethod,
}

impl Default for NftablesConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            set_prefix: default_set_prefix(),
            nft_command: default_nft_command(),
            elevation: ElevationMethod::default(),
        }
    }
}

fn default_table() -> String {
    "dbgate".to_string()
}

fn default_set_prefix() -> String {
    "dbdirect".to_string()
}

fn default_nft_command() -> PathBuf {
    PathBuf::from(option_env!("DBGATE_SYSTEM_NFT_PATH").unwrap_or("nft"))
}

/// Base name of the sets for a rule identifier.
///
/// Identifiers that need sanitizing get a short digest suffix so that, say,
/// `my-org` and `my_org` never share a set.
pub fn set_base_name(prefix: &str, rule_identifier: &str) -> String {
    let sanitized = sanitize_identifier(rule_identifier);
    if sanitized == rule_identifier {
        format!("{prefix}_{sanitized}")
    } else {
        let digest = sha256_hex(rule_identifier.as_bytes());
        format!("{prefix}_{sanitized}_{}", &digest[..8])
    }
}

fn element(network: IpNetwork) -> Value {
    let is_host = match network {
        IpNetwork::V4(n) => n.prefix() == 32,
        IpNetwork::V6(n) => n.prefix() == 128,
    };
    if is_host {
        json!(network.ip().to_string())
    } else {
        json!({ "prefix": { "addr": network.ip().to_string(), "len": network.prefix() } })
    }
}

/// Builds the batch that replaces the contents of a rule's sets
pub fn build_replace_batch(config: &NftablesConfig, rule_identifier: &str, ips: &[NormalizedCidr]) -> Value {
    let base = set_base_name(&config.set_prefix, rule_identifier);
    let table = config.table.as_str();

    let mut commands = vec![json!({ "add": { "table": { "family": "inet", "name": table } } })];

    for (suffix, addr_type, is_v4) in [("v4", "ipv4_addr", true), ("v6", "ipv6_addr", false)] {
        let name = format!("{base}_{suffix}");
        commands.push(json!({
            "add": { "set": {
                "family": "inet",
                "table": table,
                "name": name,
                "type": addr_type,
                "flags": ["interval"],
                "auto-merge": true,
                "comment": rule_identifier,
            } }
        }));
        commands.push(json!({
            "flush": { "set": { "family": "inet", "table": table, "name": name } }
        }));

        let elements: Vec<Value> = ips
            .iter()
            .filter(|cidr| cidr.is_ipv4() == is_v4)
            .map(|cidr| element(cidr.masked()))
            .collect();

        if !elements.is_empty() {
            commands.push(json!({
                "add": { "element": {
                    "family": "inet",
                    "table": table,
                    "name": name,
                    "elem": elements,
                } }
            }));
        }
    }

    json!({ "nftables": commands })
}

/// Firewall backend that loads allowlists into nftables sets
#[derive(Debug, Clone)]
pub struct NftablesFirewall {
    config: NftablesConfig,
}

impl NftablesFirewall {
    pub fn new(config: NftablesConfig) -> Self {
        Self { config }
    }

    /// Pipes a batch into `nft --json -f -` and waits for it to finish
    pub async fn apply_batch(&self, batch: &Value) -> Result<(), FirewallError> {
        let json_string = serde_json::to_string(batch)
            .map_err(|e| FirewallError::new(format!("Failed to encode nft batch: {e}")))?;

        let mut child = elevation::build_command(
            self.config.elevation,
            &self.config.nft_command,
            &["--json", "-f", "-"],
        )
        .map_err(|e| FirewallError::new(format!("Privilege escalation unavailable: {e}")))?
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn nft: {e}");
            FirewallError::new(format!("Failed to spawn nft: {e}"))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(json_string.as_bytes())
                .await
                .map_err(|e| FirewallError::new(format!("Failed to write to nft stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FirewallError::new(format!("Failed to wait for nft: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("nft batch failed: {stderr}");
            let message = if stderr.is_empty() {
                format!("nft exited with status {:?}", output.status.code())
            } else {
                stderr
            };
            Err(FirewallError::new(message))
        }
    }

    pub async fn replace_rule(&self, rule_identifier: &str, ips: &[NormalizedCidr]) -> Result<(), FirewallError> {
        let batch = build_replace_batch(&self.config, rule_identifier, ips);
        info!(
            rule = rule_identifier,
            entries = ips.len(),
            "Replacing nftables allowlist sets"
        );
        self.apply_batch(&batch).await
    }
}
