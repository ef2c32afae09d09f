//! Shared test utilities for core module tests
//!
//! Firewall doubles injected into the manager in place of a real backend.
//! This module is only compiled in test mode.

use crate::core::error::FirewallError;
use crate::core::sync::FirewallSync;
use crate::validators::NormalizedCidr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Backend that rejects every call with a fixed message
#[derive(Debug)]
pub struct FailingFirewall {
    message: String,
    calls: AtomicUsize,
}

impl FailingFirewall {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `replace_rule` calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FirewallSync for FailingFirewall {
    async fn replace_rule(
        &self,
        _rule_identifier: &str,
        _ips: &[NormalizedCidr],
    ) -> Result<(), FirewallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FirewallError::new(self.message.clone()))
    }
}

/// Backend that takes `delay` before succeeding
#[derive(Debug)]
pub struct SlowFirewall {
    delay: Duration,
}

impl SlowFirewall {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl FirewallSync for SlowFirewall {
    async fn replace_rule(
        &self,
        _rule_identifier: &str,
        _ips: &[NormalizedCidr],
    ) -> Result<(), FirewallError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
