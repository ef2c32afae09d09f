//! Input validation and normalization for allowlist updates
//!
//! Every address that reaches the firewall goes through [`validate_ips`] first.
//! A request is accepted only if every entry is a public unicast address or
//! CIDR range that is narrow enough for the configured [`IpPolicy`]; one bad
//! entry rejects the whole list.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Limits applied on top of address syntax
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpPolicy {
    /// Shortest IPv4 prefix accepted (a `/20` is rejected when this is 24)
    #[serde(default = "default_min_ipv4_prefix")]
    pub min_ipv4_prefix: u8,
    /// Shortest IPv6 prefix accepted
    #[serde(default = "default_min_ipv6_prefix")]
    pub min_ipv6_prefix: u8,
    /// Maximum number of entries in a single allowlist
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self {
            min_ipv4_prefix: default_min_ipv4_prefix(),
            min_ipv6_prefix: default_min_ipv6_prefix(),
            max_entries: default_max_entries(),
        }
    }
}

impl IpPolicy {
    /// Checks that the policy can accept at least one address of each family.
    ///
    /// # Errors
    ///
    /// Returns a description of the first out-of-range value.
    pub fn check(&self) -> Result<(), String> {
        if self.min_ipv4_prefix > 32 {
            return Err(format!(
                "min_ipv4_prefix must be at most 32, got {}",
                self.min_ipv4_prefix
            ));
        }
        if self.min_ipv6_prefix > 128 {
            return Err(format!(
                "min_ipv6_prefix must be at most 128, got {}",
                self.min_ipv6_prefix
            ));
        }
        if self.max_entries == 0 {
            return Err("max_entries must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_min_ipv4_prefix() -> u8 {
    24
}

fn default_min_ipv6_prefix() -> u8 {
    48
}

fn default_max_entries() -> usize {
    100
}

/// Why a candidate list was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpRejection {
    #[error("must be a list of IP addresses or CIDR ranges")]
    NotAList,

    #[error("entry {index} is not a string")]
    NotAString { index: usize },

    #[error("'{value}' is not a valid IP address or CIDR range")]
    Malformed { value: String },

    #[error("'{value}' has a prefix length above {max}")]
    PrefixOutOfRange { value: String, max: u8 },

    #[error("'{value}' is too broad (prefix must be /{min} or narrower)")]
    TooBroad { value: String, min: u8 },

    #[error("'{value}' overlaps {kind} range {block}")]
    Reserved {
        value: String,
        block: String,
        kind: &'static str,
    },

    #[error("too many entries ({count}, max {max})")]
    TooMany { count: usize, max: usize },
}

/// A validated allowlist entry.
///
/// Keeps track of whether the caller wrote a prefix so that `100.20.30.40`
/// stays `100.20.30.40` and `200.20.30.40/24` stays `200.20.30.40/24` when
/// rendered back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedCidr {
    network: IpNetwork,
    explicit_prefix: bool,
}

impl NormalizedCidr {
    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Network form used by the firewall (host bits cleared)
    pub fn masked(&self) -> IpNetwork {
        match self.network {
            IpNetwork::V4(n) => IpNetwork::new(IpAddr::V4(n.network()), n.prefix()),
            IpNetwork::V6(n) => IpNetwork::new(IpAddr::V6(n.network()), n.prefix()),
        }
        .unwrap_or(self.network)
    }
}

impl fmt::Display for NormalizedCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.explicit_prefix {
            write!(f, "{}/{}", self.network.ip(), self.network.prefix())
        } else {
            write!(f, "{}", self.network.ip())
        }
    }
}

struct ReservedV4 {
    base: Ipv4Addr,
    prefix: u8,
    kind: &'static str,
}

struct ReservedV6 {
    base: Ipv6Addr,
    prefix: u8,
    kind: &'static str,
}

const RESERVED_V4: &[ReservedV4] = &[
    ReservedV4 { base: Ipv4Addr::new(0, 0, 0, 0), prefix: 8, kind: "unspecified" },
    ReservedV4 { base: Ipv4Addr::new(10, 0, 0, 0), prefix: 8, kind: "private" },
    ReservedV4 { base: Ipv4Addr::new(100, 64, 0, 0), prefix: 10, kind: "shared address" },
    ReservedV4 { base: Ipv4Addr::new(127, 0, 0, 0), prefix: 8, kind: "loopback" },
    ReservedV4 { base: Ipv4Addr::new(169, 254, 0, 0), prefix: 16, kind: "link-local" },
    ReservedV4 { base: Ipv4Addr::new(172, 16, 0, 0), prefix: 12, kind: "private" },
    ReservedV4 { base: Ipv4Addr::new(192, 0, 0, 0), prefix: 24, kind: "protocol assignment" },
    ReservedV4 { base: Ipv4Addr::new(192, 0, 2, 0), prefix: 24, kind: "documentation" },
    ReservedV4 { base: Ipv4Addr::new(192, 168, 0, 0), prefix: 16, kind: "private" },
    ReservedV4 { base: Ipv4Addr::new(198, 18, 0, 0), prefix: 15, kind: "benchmarking" },
    ReservedV4 { base: Ipv4Addr::new(198, 51, 100, 0), prefix: 24, kind: "documentation" },
    ReservedV4 { base: Ipv4Addr::new(203, 0, 113, 0), prefix: 24, kind: "documentation" },
    ReservedV4 { base: Ipv4Addr::new(224, 0, 0, 0), prefix: 4, kind: "multicast" },
    ReservedV4 { base: Ipv4Addr::new(240, 0, 0, 0), prefix: 4, kind: "reserved" },
];

const RESERVED_V6: &[ReservedV6] = &[
    ReservedV6 { base: Ipv6Addr::UNSPECIFIED, prefix: 128, kind: "unspecified" },
    ReservedV6 { base: Ipv6Addr::LOCALHOST, prefix: 128, kind: "loopback" },
    ReservedV6 { base: Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), prefix: 96, kind: "IPv4-mapped" },
    ReservedV6 { base: Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), prefix: 96, kind: "IPv4-translated" },
    ReservedV6 { base: Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), prefix: 64, kind: "discard" },
    ReservedV6 { base: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), prefix: 32, kind: "documentation" },
    ReservedV6 { base: Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), prefix: 7, kind: "unique local" },
    ReservedV6 { base: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), prefix: 10, kind: "link-local" },
    ReservedV6 { base: Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), prefix: 8, kind: "multicast" },
];

fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

/// Two networks overlap when they agree on the bits of the shorter prefix.
fn reserved_overlap(network: IpNetwork) -> Option<(String, &'static str)> {
    match network {
        IpNetwork::V4(n) => {
            let addr = u32::from(n.ip());
            RESERVED_V4.iter().find_map(|r| {
                let mask = mask_v4(n.prefix().min(r.prefix));
                ((addr ^ u32::from(r.base)) & mask == 0)
                    .then(|| (format!("{}/{}", r.base, r.prefix), r.kind))
            })
        }
        IpNetwork::V6(n) => {
            let addr = u128::from(n.ip());
            RESERVED_V6.iter().find_map(|r| {
                let mask = mask_v6(n.prefix().min(r.prefix));
                ((addr ^ u128::from(r.base)) & mask == 0)
                    .then(|| (format!("{}/{}", r.base, r.prefix), r.kind))
            })
        }
    }
}

/// Validates a single IP address or CIDR range.
///
/// # Errors
///
/// Returns `Err` if the value is malformed, its prefix is out of range or
/// too broad for `policy`, or it overlaps a loopback, private or otherwise
/// reserved block.
pub fn validate_ip_or_cidr(input: &str, policy: &IpPolicy) -> Result<NormalizedCidr, IpRejection> {
    let value = input.trim();
    let malformed = || IpRejection::Malformed {
        value: input.to_string(),
    };

    let (addr_part, prefix_part) = match value.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (value, None),
    };

    let addr: IpAddr = addr_part.parse().map_err(|_| malformed())?;
    let width: u8 = if addr.is_ipv4() { 32 } else { 128 };

    let prefix = match prefix_part {
        Some(p) => {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let prefix: u32 = p.parse().map_err(|_| malformed())?;
            if prefix > u32::from(width) {
                return Err(IpRejection::PrefixOutOfRange {
                    value: input.to_string(),
                    max: width,
                });
            }
            u8::try_from(prefix).map_err(|_| malformed())?
        }
        None => width,
    };

    let network = IpNetwork::new(addr, prefix).map_err(|_| malformed())?;

    let min = if addr.is_ipv4() {
        policy.min_ipv4_prefix
    } else {
        policy.min_ipv6_prefix
    };
    if prefix < min {
        return Err(IpRejection::TooBroad {
            value: input.to_string(),
            min,
        });
    }

    if let Some((block, kind)) = reserved_overlap(network) {
        return Err(IpRejection::Reserved {
            value: input.to_string(),
            block,
            kind,
        });
    }

    Ok(NormalizedCidr {
        network,
        explicit_prefix: prefix_part.is_some(),
    })
}

/// Validates a candidate allowlist as received from a caller.
///
/// The payload must be a JSON array of strings. Order is preserved and no
/// deduplication happens here.
///
/// # Errors
///
/// Returns the first [`IpRejection`] found; nothing is partially accepted.
pub fn validate_ips(candidates: &Value, policy: &IpPolicy) -> Result<Vec<NormalizedCidr>, IpRejection> {
    let items = candidates.as_array().ok_or(IpRejection::NotAList)?;

    if items.len() > policy.max_entries {
        return Err(IpRejection::TooMany {
            count: items.len(),
            max: policy.max_entries,
        });
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let value = item.as_str().ok_or(IpRejection::NotAString { index })?;
            validate_ip_or_cidr(value, policy)
        })
        .collect()
}

/// Renders validated entries in their canonical text form
pub fn to_strings(cidrs: &[NormalizedCidr]) -> Vec<String> {
    cidrs.iter().map(ToString::to_string).collect()
}

/// Sanitizes a rule identifier for use inside an nftables object name.
///
/// Keeps ASCII alphanumerics and underscores, maps every other character to
/// `_`, and limits the result to 48 bytes so that prefixes and suffixes still
/// fit within nft name limits.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(48)
        .collect()
}

/// Validates an account or organization name before it is used in a path.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 64 characters, contains
/// anything other than ASCII alphanumerics, `_`, `-` and `.`, or is `.`/`..`.
pub fn validate_entity_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > 64 {
        return Err("Name too long (max 64 chars)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -, .)".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(ips: Value) -> Result<Vec<String>, IpRejection> {
        validate_ips(&ips, &IpPolicy::default()).map(|v| to_strings(&v))
    }

    #[test]
    fn test_accepts_public_addresses() {
        assert_eq!(check(json!(["100.20.30.40"])).unwrap(), vec!["100.20.30.40"]);
        assert_eq!(check(json!(["11.21.31.41"])).unwrap(), vec!["11.21.31.41"]);
    }

    #[test]
    fn test_preserves_order_and_form() {
        let ips = check(json!(["100.20.30.40", "200.20.30.40/24", "8.8.8.0/24"])).unwrap();
        assert_eq!(ips, vec!["100.20.30.40", "200.20.30.40/24", "8.8.8.0/24"]);
    }

    #[test]
    fn test_does_not_deduplicate() {
        let ips = check(json!(["8.8.8.8", "8.8.8.8"])).unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn test_empty_list_is_valid() {
        assert!(check(json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(check(json!([" 8.8.4.4 "])).unwrap(), vec!["8.8.4.4"]);
    }

    #[test]
    fn test_ipv6_is_canonicalized() {
        let ips = check(json!(["2a00:1450:4001:0000:0000:0000:0000:0001", "2a00:1450::/48"])).unwrap();
        assert_eq!(ips, vec!["2a00:1450:4001::1", "2a00:1450::/48"]);
    }

    #[test]
    fn test_rejects_unspecified() {
        assert!(matches!(
            check(json!(["0.0.0.0"])),
            Err(IpRejection::Reserved { kind: "unspecified", .. })
        ));
        assert!(matches!(
            check(json!(["::"])),
            Err(IpRejection::Reserved { kind: "unspecified", .. })
        ));
    }

    #[test]
    fn test_rejects_loopback() {
        assert!(matches!(
            check(json!(["127.0.0.1"])),
            Err(IpRejection::Reserved { kind: "loopback", .. })
        ));
        assert!(matches!(
            check(json!(["::1"])),
            Err(IpRejection::Reserved { kind: "loopback", .. })
        ));
    }

    #[test]
    fn test_rejects_private_ranges() {
        for ip in ["10.20.30.40", "192.168.1.1", "172.16.5.4", "172.31.255.1"] {
            assert!(
                matches!(check(json!([ip])), Err(IpRejection::Reserved { kind: "private", .. })),
                "{ip} should be rejected"
            );
        }
        // Just outside 172.16.0.0/12
        assert!(check(json!(["172.32.0.1"])).is_ok());
    }

    #[test]
    fn test_rejects_other_reserved_ranges() {
        for ip in ["169.254.1.1", "224.0.0.1", "255.255.255.255", "192.0.2.10", "fe80::1", "fd00::1"] {
            assert!(check(json!([ip])).is_err(), "{ip} should be rejected");
        }
    }

    #[test]
    fn test_rejects_too_broad_prefix() {
        assert!(matches!(
            check(json!(["120.120.120.120/20"])),
            Err(IpRejection::TooBroad { min: 24, .. })
        ));
    }

    #[test]
    fn test_breadth_is_configurable() {
        let policy = IpPolicy {
            min_ipv4_prefix: 16,
            ..IpPolicy::default()
        };
        let ips = validate_ips(&json!(["120.120.120.120/20"]), &policy).unwrap();
        assert_eq!(to_strings(&ips), vec!["120.120.120.120/20"]);
    }

    #[test]
    fn test_cidr_covering_reserved_block_is_rejected() {
        let policy = IpPolicy {
            min_ipv4_prefix: 4,
            ..IpPolicy::default()
        };
        assert!(matches!(
            validate_ips(&json!(["8.0.0.0/5"]), &policy),
            Err(IpRejection::Reserved { kind: "private", .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_octet() {
        assert!(matches!(
            check(json!(["100.100.100.300"])),
            Err(IpRejection::Malformed { .. })
        ));
    }

    #[test]
    fn test_rejects_prefix_over_width() {
        assert!(matches!(
            check(json!(["8.8.8.8/33"])),
            Err(IpRejection::PrefixOutOfRange { max: 32, .. })
        ));
        assert!(matches!(
            check(json!(["2a00:1450::/129"])),
            Err(IpRejection::PrefixOutOfRange { max: 128, .. })
        ));
    }

    #[test]
    fn test_rejects_malformed() {
        for ip in ["not-an-ip", "", "8.8.8.8/", "8.8.8.8/+24", "8.8.8/24", "8.8.8.8/24/1"] {
            assert!(
                matches!(check(json!([ip])), Err(IpRejection::Malformed { .. })),
                "{ip:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_rejects_numeric_entry() {
        assert_eq!(
            check(json!([11_223_344])),
            Err(IpRejection::NotAString { index: 0 })
        );
    }

    #[test]
    fn test_rejects_scalar_payload() {
        assert_eq!(check(json!("100.20.30.40")), Err(IpRejection::NotAList));
        assert_eq!(check(Value::Null), Err(IpRejection::NotAList));
    }

    #[test]
    fn test_one_bad_entry_rejects_all() {
        let result = check(json!(["100.20.30.40", "10.0.0.1"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_too_many_entries() {
        let policy = IpPolicy {
            max_entries: 2,
            ..IpPolicy::default()
        };
        let result = validate_ips(&json!(["8.8.8.8", "8.8.4.4", "1.1.1.1"]), &policy);
        assert_eq!(result, Err(IpRejection::TooMany { count: 3, max: 2 }));
    }

    #[test]
    fn test_policy_check() {
        assert!(IpPolicy::default().check().is_ok());
        let host_only = IpPolicy {
            min_ipv4_prefix: 32,
            min_ipv6_prefix: 128,
            max_entries: 1,
        };
        assert!(host_only.check().is_ok());

        let too_long = IpPolicy {
            min_ipv4_prefix: 40,
            ..IpPolicy::default()
        };
        assert!(too_long.check().unwrap_err().contains("min_ipv4_prefix"));

        let v6 = IpPolicy {
            min_ipv6_prefix: 129,
            ..IpPolicy::default()
        };
        assert!(v6.check().unwrap_err().contains("min_ipv6_prefix"));

        let empty = IpPolicy {
            max_entries: 0,
            ..IpPolicy::default()
        };
        assert!(empty.check().is_err());
    }

    #[test]
    fn test_masked_clears_host_bits() {
        let cidr = validate_ip_or_cidr("200.20.30.40/24", &IpPolicy::default()).unwrap();
        assert_eq!(cidr.masked().to_string(), "200.20.30.0/24");
        assert_eq!(cidr.to_string(), "200.20.30.40/24");
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("acme"), "acme");
        assert_eq!(sanitize_identifier("my-org.team"), "my_org_team");
        assert_eq!(sanitize_identifier(&"x".repeat(100)).len(), 48);
    }

    #[test]
    fn test_validate_entity_name() {
        assert!(validate_entity_name("alice").is_ok());
        assert!(validate_entity_name("my-org.v2").is_ok());
        assert!(validate_entity_name("").is_err());
        assert!(validate_entity_name("..").is_err());
        assert!(validate_entity_name("../etc/passwd").is_err());
        assert!(validate_entity_name(&"a".repeat(65)).is_err());
    }
}
