//! Allowlist manager
//!
//! Orchestrates validation, identity resolution, firewall synchronization and
//! persistence. The ordering is the consistency mechanism: the firewall is
//! updated first and the store is written only after the firewall accepted
//! the new set, so the store never claims a state the firewall does not have.
//!
//! # Example
//!
//! ```
//! use dbgate::core::identity::Principal;
//! use dbgate::core::manager::AllowlistManager;
//! use dbgate::core::store::MemoryStore;
//! use dbgate::core::sync::{FirewallConfig, MemoryFirewall};
//!
//! # async fn example() -> dbgate::Result<()> {
//! let firewall = MemoryFirewall::new(FirewallConfig::Memory { label: None });
//! let manager = AllowlistManager::new(firewall, MemoryStore::new());
//! let alice = Principal::new("alice");
//!
//! manager.update(&alice, &serde_json::json!(["100.20.30.40"])).await?;
//! assert_eq!(manager.show(&alice).await?, vec!["100.20.30.40"]);
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::error::{Error, FirewallError, Result};
use crate::core::identity::{self, Principal, Resolution};
use crate::core::store::AllowlistStore;
use crate::core::sync::FirewallSync;
use crate::validators::{self, IpPolicy, NormalizedCidr};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Default bound on a single firewall call
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

type RuleLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one rule identifier.
///
/// On drop the lock is released and its map entry removed when no other
/// caller holds or waits on it, so the map only tracks rules in use.
struct RuleGuard<'a> {
    locks: &'a RuleLocks,
    rule_identifier: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RuleGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.rule_identifier)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.rule_identifier);
        }
    }
}

pub struct AllowlistManager<F, S> {
    firewall: F,
    store: S,
    policy: IpPolicy,
    sync_timeout: Duration,
    audit: Option<AuditLog>,
    /// One lock per rule identifier; Update/Delete on the same rule never interleave
    rule_locks: RuleLocks,
}

impl<F: FirewallSync, S: AllowlistStore> AllowlistManager<F, S> {
    pub fn new(firewall: F, store: S) -> Self {
        Self {
            firewall,
            store,
            policy: IpPolicy::default(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            audit: None,
            rule_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: IpPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &IpPolicy {
        &self.policy
    }

    /// Replaces the allowlist that applies to `principal`.
    ///
    /// Returns the normalized list on success. Nothing changes when
    /// validation fails; the store is untouched when the firewall fails.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a bad payload (no side effects)
    /// - [`Error::Firewall`] when the backend fails or times out
    /// - [`Error::Store`] when the firewall accepted the list but it could
    ///   not be persisted
    pub async fn update(&self, principal: &Principal, raw_ips: &Value) -> Result<Vec<String>> {
        let cidrs = validators::validate_ips(raw_ips, &self.policy)
            .map_err(|rejection| Error::invalid_ips(rejection.to_string()))?;
        let ips = validators::to_strings(&cidrs);

        let resolution = identity::resolve(principal);
        let _guard = self.lock_rule(&resolution.rule_identifier).await;

        let result = self.sync_then_commit(&resolution, &cidrs, &ips).await;

        self.audit(
            EventType::UpdateAllowlist,
            principal,
            &resolution,
            json!({ "ips": ips }),
            &result,
        )
        .await;

        result.map(|()| ips)
    }

    /// Clears the allowlist that applies to `principal`.
    ///
    /// The firewall rule is emptied first; the stored entry is removed only
    /// if that succeeded. No rollback is attempted on failure.
    ///
    /// # Errors
    ///
    /// - [`Error::Firewall`] when the backend fails or times out
    /// - [`Error::Store`] when the entry could not be removed
    pub async fn delete(&self, principal: &Principal) -> Result<()> {
        let resolution = identity::resolve(principal);
        let _guard = self.lock_rule(&resolution.rule_identifier).await;

        let result = self.sync_then_commit(&resolution, &[], &[]).await;

        self.audit(
            EventType::ClearAllowlist,
            principal,
            &resolution,
            json!({}),
            &result,
        )
        .await;

        result
    }

    /// Returns the effective allowlist for `principal`; never touches the firewall.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the stored entry cannot be read.
    pub async fn show(&self, principal: &Principal) -> Result<Vec<String>> {
        Ok(identity::effective_ips(&self.store, principal).await?)
    }

    async fn sync_then_commit(
        &self,
        resolution: &Resolution,
        cidrs: &[NormalizedCidr],
        ips: &[String],
    ) -> Result<()> {
        let rule_identifier = resolution.rule_identifier.as_str();
        let entity = &resolution.owning_entity;

        if let Err(e) = self.push(rule_identifier, cidrs).await {
            warn!(
                rule = rule_identifier,
                "Firewall rejected allowlist update, store left unchanged: {e}"
            );
            return Err(e.into());
        }

        let committed = if ips.is_empty() {
            self.store.clear(entity).await
        } else {
            self.store.put(entity, ips).await
        };

        if let Err(e) = committed {
            // The firewall now enforces a list the store does not record
            error!(
                rule = rule_identifier,
                "Firewall updated but allowlist for {entity} could not be stored: {e}"
            );
            return Err(e.into());
        }

        info!(
            rule = rule_identifier,
            entries = ips.len(),
            "Allowlist for {entity} synchronized"
        );
        Ok(())
    }

    /// Single, time-bounded firewall call; no retries
    async fn push(&self, rule_identifier: &str, cidrs: &[NormalizedCidr]) -> std::result::Result<(), FirewallError> {
        match tokio::time::timeout(
            self.sync_timeout,
            self.firewall.replace_rule(rule_identifier, cidrs),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FirewallError::new(format!(
                "Firewall synchronization timed out after {}s",
                self.sync_timeout.as_secs_f32()
            ))),
        }
    }

    async fn lock_rule(&self, rule_identifier: &str) -> RuleGuard<'_> {
        let lock = {
            let mut locks = self
                .rule_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(rule_identifier.to_string()).or_default())
        };
        RuleGuard {
            locks: &self.rule_locks,
            rule_identifier: rule_identifier.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_rule_locks(&self) -> usize {
        self.rule_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn audit(
        &self,
        event_type: EventType,
        principal: &Principal,
        resolution: &Resolution,
        details: Value,
        result: &Result<()>,
    ) {
        if let Some(audit) = &self.audit {
            let event = AuditEvent::new(
                event_type,
                &principal.username,
                resolution,
                result.is_ok(),
                details,
                result.as_ref().err().map(ToString::to_string),
            );
            audit.record(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::{OrgRole, OwningEntity};
    use crate::core::store::MemoryStore;
    use crate::core::sync::{FirewallConfig, MemoryFirewall};
    use crate::core::test_helpers::{FailingFirewall, SlowFirewall};
    use serde_json::json;

    fn memory_manager() -> AllowlistManager<MemoryFirewall, MemoryStore> {
        AllowlistManager::new(
            MemoryFirewall::new(FirewallConfig::Memory {
                label: Some("the-config".into()),
            }),
            MemoryStore::new(),
        )
    }

    fn alice() -> Principal {
        Principal::new("alice")
    }

    #[tokio::test]
    async fn test_update_then_show() {
        let manager = memory_manager();
        let ips = manager
            .update(&alice(), &json!(["100.20.30.40", "200.20.30.40/24"]))
            .await
            .unwrap();

        assert_eq!(ips, vec!["100.20.30.40", "200.20.30.40/24"]);
        assert_eq!(manager.show(&alice()).await.unwrap(), ips);
        assert_eq!(manager.firewall().rule("alice"), Some(ips));
    }

    #[tokio::test]
    async fn test_update_replaces_previous_list() {
        let manager = memory_manager();
        manager
            .update(&alice(), &json!(["100.20.30.40", "200.20.30.40/24"]))
            .await
            .unwrap();
        manager.update(&alice(), &json!(["11.21.31.41"])).await.unwrap();

        assert_eq!(manager.show(&alice()).await.unwrap(), vec!["11.21.31.41"]);
        assert_eq!(
            manager.firewall().rule("alice"),
            Some(vec!["11.21.31.41".to_string()])
        );
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let manager = memory_manager();
        let payload = json!(["8.8.8.8"]);
        manager.update(&alice(), &payload).await.unwrap();
        let once = manager.show(&alice()).await.unwrap();
        manager.update(&alice(), &payload).await.unwrap();
        assert_eq!(manager.show(&alice()).await.unwrap(), once);
    }

    #[tokio::test]
    async fn test_invalid_update_changes_nothing() {
        let manager = memory_manager();
        manager.update(&alice(), &json!(["8.8.8.8"])).await.unwrap();

        let err = manager
            .update(&alice(), &json!(["8.8.4.4", "127.0.0.1"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { ref field, .. } if field == "ips"));
        assert_eq!(manager.show(&alice()).await.unwrap(), vec!["8.8.8.8"]);
        assert_eq!(
            manager.firewall().rule("alice"),
            Some(vec!["8.8.8.8".to_string()])
        );
    }

    #[tokio::test]
    async fn test_firewall_failure_leaves_store_untouched() {
        let store = MemoryStore::new();
        let manager = AllowlistManager::new(FailingFirewall::new("FIREWALL ERROR"), store.clone());

        let err = manager
            .update(&alice(), &json!(["100.20.30.40"]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("FIREWALL ERROR"));
        assert!(matches!(err, Error::Firewall(_)));
        assert!(store.is_empty());
        assert_eq!(manager.firewall().calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_existing_list() {
        let store = MemoryStore::new();
        let entity = OwningEntity::Account("alice".into());
        store.put(&entity, &["100.20.30.40".to_string()]).await.unwrap();

        let manager = AllowlistManager::new(FailingFirewall::new("FIREWALL ERROR"), store.clone());
        let err = manager.delete(&alice()).await.unwrap_err();

        assert!(err.to_string().contains("FIREWALL ERROR"));
        assert_eq!(manager.show(&alice()).await.unwrap(), vec!["100.20.30.40"]);
    }

    #[tokio::test]
    async fn test_delete_clears_store_and_rule() {
        let manager = memory_manager();
        manager.update(&alice(), &json!(["100.20.30.40"])).await.unwrap();
        manager.delete(&alice()).await.unwrap();

        assert!(manager.show(&alice()).await.unwrap().is_empty());
        assert!(manager.store().is_empty());
        assert_eq!(manager.firewall().rule("alice"), Some(vec![]));
    }

    #[tokio::test]
    async fn test_empty_update_clears_entry() {
        let manager = memory_manager();
        manager.update(&alice(), &json!(["100.20.30.40"])).await.unwrap();
        manager.update(&alice(), &json!([])).await.unwrap();

        assert!(manager.show(&alice()).await.unwrap().is_empty());
        assert!(manager.store().is_empty());
    }

    #[tokio::test]
    async fn test_organization_members_share_rule() {
        let manager = memory_manager();
        let bob = Principal::new("bob").in_organization("acme", OrgRole::Owner);
        let carol = Principal::new("carol").in_organization("acme", OrgRole::Member);
        let dave = Principal::new("dave").in_organization("acme", OrgRole::Member);

        manager.update(&carol, &json!(["8.8.8.0/24"])).await.unwrap();

        for p in [&bob, &carol, &dave] {
            assert_eq!(manager.show(p).await.unwrap(), vec!["8.8.8.0/24"]);
        }
        assert_eq!(manager.firewall().rule_identifiers(), vec!["acme"]);
        assert!(manager.firewall().rule("carol").is_none());
        assert!(manager.firewall().rule("bob").is_none());
    }

    #[tokio::test]
    async fn test_slow_firewall_times_out_without_commit() {
        let store = MemoryStore::new();
        let manager = AllowlistManager::new(SlowFirewall::new(Duration::from_secs(5)), store.clone())
            .with_sync_timeout(Duration::from_millis(20));

        let err = manager
            .update(&alice(), &json!(["8.8.8.8"]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_show_ignores_firewall_state() {
        let store = MemoryStore::new();
        store
            .put(&OwningEntity::Account("alice".into()), &["8.8.8.8".to_string()])
            .await
            .unwrap();
        let manager = AllowlistManager::new(FailingFirewall::new("down"), store);

        assert_eq!(manager.show(&alice()).await.unwrap(), vec!["8.8.8.8"]);
        assert_eq!(manager.firewall().calls(), 0);
    }

    #[tokio::test]
    async fn test_policy_is_applied() {
        let manager = memory_manager().with_policy(IpPolicy {
            min_ipv4_prefix: 16,
            ..IpPolicy::default()
        });
        let ips = manager
            .update(&alice(), &json!(["120.120.120.120/20"]))
            .await
            .unwrap();
        assert_eq!(ips, vec!["120.120.120.120/20"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_end_consistent() {
        let manager = Arc::new(memory_manager());
        let bob = Principal::new("bob").in_organization("acme", OrgRole::Owner);
        let carol = Principal::new("carol").in_organization("acme", OrgRole::Member);

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let (r1, r2) = tokio::join!(
            async move { m1.update(&bob, &json!(["8.8.8.8"])).await },
            async move { m2.update(&carol, &json!(["1.1.1.1"])).await },
        );
        r1.unwrap();
        r2.unwrap();

        let stored = manager
            .show(&Principal::new("x").in_organization("acme", OrgRole::Member))
            .await
            .unwrap();
        assert_eq!(manager.firewall().rule("acme"), Some(stored));
        assert_eq!(manager.tracked_rule_locks(), 0);
    }

    #[tokio::test]
    async fn test_rule_locks_are_forgotten_after_use() {
        let manager = memory_manager();
        for name in ["alice", "bob", "carol"] {
            let principal = Principal::new(name);
            manager.update(&principal, &json!(["8.8.8.8"])).await.unwrap();
            manager.delete(&principal).await.unwrap();
        }
        assert_eq!(manager.tracked_rule_locks(), 0);

        // Failures release the lock too
        let failing = AllowlistManager::new(FailingFirewall::new("down"), MemoryStore::new());
        let _ = failing.update(&alice(), &json!(["8.8.8.8"])).await;
        assert_eq!(failing.tracked_rule_locks(), 0);
    }

    #[tokio::test]
    async fn test_waiting_caller_keeps_rule_lock() {
        let manager = Arc::new(
            AllowlistManager::new(SlowFirewall::new(Duration::from_millis(50)), MemoryStore::new()),
        );
        let first = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.update(&alice(), &json!(["8.8.8.8"])).await })
        };
        let second = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.update(&alice(), &json!(["1.1.1.1"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.tracked_rule_locks(), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(manager.tracked_rule_locks(), 0);
    }

    #[tokio::test]
    async fn test_audit_records_outcomes() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(tmp.path().join("audit.log"));
        let manager = AllowlistManager::new(FailingFirewall::new("FIREWALL ERROR"), MemoryStore::new())
            .with_audit(audit.clone());

        let _ = manager.update(&alice(), &json!(["8.8.8.8"])).await;

        let events = audit.read_recent(5).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::UpdateAllowlist);
        assert!(!events[0].success);
        assert_eq!(events[0].error.as_deref(), Some("FIREWALL ERROR"));
        assert_eq!(events[0].actor, "alice");
    }
}
