//! Principals, organizations and effective-identity resolution
//!
//! An account that belongs to an organization never owns a firewall rule of
//! its own: the owner and every member share the organization's rule, keyed by
//! the organization name. Unaffiliated accounts own a rule keyed by their
//! username.

use crate::core::error::StoreError;
use crate::core::store::AllowlistStore;
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Role of an account inside its organization
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    #[strum(serialize = "owner")]
    Owner,
    #[strum(serialize = "member")]
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub organization: String,
    pub role: OrgRole,
}

/// An authenticated account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    #[serde(default)]
    pub membership: Option<Membership>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            membership: None,
        }
    }

    pub fn in_organization(mut self, organization: impl Into<String>, role: OrgRole) -> Self {
        self.membership = Some(Membership {
            organization: organization.into(),
            role,
        });
        self
    }

    pub fn organization(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.organization.as_str())
    }
}

/// The entity an allowlist belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, strum::AsRefStr)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum OwningEntity {
    #[strum(serialize = "account")]
    Account(String),
    #[strum(serialize = "organization")]
    Organization(String),
}

impl OwningEntity {
    pub fn name(&self) -> &str {
        match self {
            Self::Account(name) | Self::Organization(name) => name,
        }
    }

    pub fn kind(&self) -> &str {
        self.as_ref()
    }
}

impl fmt::Display for OwningEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Who owns the firewall rule for a principal, and under which identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub rule_identifier: String,
    pub owning_entity: OwningEntity,
}

/// Resolves the owning entity and rule identifier for a principal.
///
/// Organization owner and members all resolve to the organization.
pub fn resolve(principal: &Principal) -> Resolution {
    match principal.organization() {
        Some(org) => Resolution {
            rule_identifier: org.to_string(),
            owning_entity: OwningEntity::Organization(org.to_string()),
        },
        None => Resolution {
            rule_identifier: principal.username.clone(),
            owning_entity: OwningEntity::Account(principal.username.clone()),
        },
    }
}

/// Returns the allowlist that applies to `principal`.
///
/// An owning entity without a stored entry has an empty allowlist.
pub async fn effective_ips<S: AllowlistStore>(
    store: &S,
    principal: &Principal,
) -> Result<Vec<String>, StoreError> {
    let resolution = resolve(principal);
    Ok(store
        .get(&resolution.owning_entity)
        .await?
        .unwrap_or_default())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Account '{0}' is defined more than once")]
    DuplicateAccount(String),

    #[error("Organization '{0}' is defined more than once")]
    DuplicateOrganization(String),

    #[error("Organization '{organization}' references unknown account '{username}'")]
    UnknownAccount {
        organization: String,
        username: String,
    },

    #[error("Account '{username}' already belongs to organization '{organization}'")]
    AlreadyInOrganization {
        username: String,
        organization: String,
    },

    /// Accounts and organizations share the firewall rule namespace
    #[error("'{0}' is already used by an account or organization")]
    NameConflict(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

#[derive(Debug, Clone)]
struct AccountRecord {
    principal: Principal,
    api_key_sha256: Option<String>,
    features: Vec<String>,
}

/// Registry of known accounts and organizations.
///
/// Built once at startup from configuration; lookups never hit the disk.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    accounts: HashMap<String, AccountRecord>,
    organizations: HashSet<String>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account. `api_key_sha256` is the hex digest of its key.
    pub fn add_account(
        &mut self,
        username: &str,
        api_key_sha256: Option<String>,
        features: Vec<String>,
    ) -> Result<(), DirectoryError> {
        crate::validators::validate_entity_name(username).map_err(|reason| {
            DirectoryError::InvalidName {
                name: username.to_string(),
                reason,
            }
        })?;

        if self.accounts.contains_key(username) {
            return Err(DirectoryError::DuplicateAccount(username.to_string()));
        }
        if self.organizations.contains(username) {
            return Err(DirectoryError::NameConflict(username.to_string()));
        }

        self.accounts.insert(
            username.to_string(),
            AccountRecord {
                principal: Principal::new(username),
                api_key_sha256: api_key_sha256.map(|d| d.trim().to_lowercase()),
                features,
            },
        );
        Ok(())
    }

    /// Registers an organization over already registered accounts
    pub fn add_organization(
        &mut self,
        name: &str,
        owner: &str,
        members: &[String],
    ) -> Result<(), DirectoryError> {
        crate::validators::validate_entity_name(name).map_err(|reason| {
            DirectoryError::InvalidName {
                name: name.to_string(),
                reason,
            }
        })?;

        if self.organizations.contains(name) {
            return Err(DirectoryError::DuplicateOrganization(name.to_string()));
        }
        if self.accounts.contains_key(name) {
            return Err(DirectoryError::NameConflict(name.to_string()));
        }

        let people = std::iter::once((owner, OrgRole::Owner)).chain(
            members
                .iter()
                .filter(|m| m.as_str() != owner)
                .map(|m| (m.as_str(), OrgRole::Member)),
        );

        // Check everything before mutating so a bad entry leaves no trace
        let mut assignments = Vec::new();
        for (username, role) in people {
            let record =
                self.accounts
                    .get(username)
                    .ok_or_else(|| DirectoryError::UnknownAccount {
                        organization: name.to_string(),
                        username: username.to_string(),
                    })?;
            if let Some(existing) = record.principal.organization() {
                return Err(DirectoryError::AlreadyInOrganization {
                    username: username.to_string(),
                    organization: existing.to_string(),
                });
            }
            if assignments.iter().any(|(u, _)| *u == username) {
                continue;
            }
            assignments.push((username, role));
        }

        for (username, role) in assignments {
            if let Some(record) = self.accounts.get_mut(username) {
                record.principal.membership = Some(Membership {
                    organization: name.to_string(),
                    role,
                });
            }
        }

        self.organizations.insert(name.to_string());
        Ok(())
    }

    pub fn principal(&self, username: &str) -> Option<&Principal> {
        self.accounts.get(username).map(|r| &r.principal)
    }

    /// Looks up the account whose key digest matches `api_key`
    pub fn find_by_api_key(&self, api_key: &str) -> Option<&Principal> {
        let digest = hash_api_key(api_key);
        self.accounts
            .values()
            .find(|r| r.api_key_sha256.as_deref() == Some(digest.as_str()))
            .map(|r| &r.principal)
    }

    pub fn has_feature(&self, username: &str, feature: &str) -> bool {
        self.accounts
            .get(username)
            .is_some_and(|r| r.features.iter().any(|f| f == feature))
    }
}

/// Digest stored in configuration in place of the API key itself
pub fn hash_api_key(api_key: &str) -> String {
    sha256_hex(api_key.as_bytes())
}
