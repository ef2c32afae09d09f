//! Core allowlist management
//!
//! - [`validators`](crate::validators): checks and normalizes candidate lists
//! - [`identity`]: who owns the rule for a principal, and its effective list
//! - [`store`]: persistence of allowlists per owning entity
//! - [`sync`]: the firewall synchronization contract and backends
//! - [`nft_json`]: nftables set backend
//! - [`manager`]: firewall-first, store-second orchestration
//! - [`error`]: error types

pub mod error;
pub mod identity;
pub mod manager;
pub mod nft_json;
pub mod store;
pub mod sync;

#[cfg(test)]
pub mod test_helpers;
