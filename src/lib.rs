//! dbgate - database direct-access allowlist manager
//!
//! Keeps a per-account (or per-organization) list of addresses allowed to
//! connect to the database directly, and mirrors it into the firewall.
//!
//! # Architecture
//!
//! - [`validators`] - IP/CIDR validation and normalization
//! - [`core`] - Identity resolution, persistence, firewall sync, orchestration
//! - [`service`] - Authentication, feature gate and response mapping
//! - [`audit`] - Audit log of every allowlist change
//! - [`config`] - Configuration loading and persistence
//! - [`elevation`] - Privilege escalation for the nft binary
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Consistency
//!
//! - Validation happens before any side effect
//! - The firewall is updated before the store; the store is never written
//!   unless the firewall accepted the list
//! - Updates to the same rule are serialized
//! - Atomic file writes with 0o600 permissions and SHA-256 checksums

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod service;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::identity::{OwningEntity, Principal};
pub use core::manager::AllowlistManager;
pub use core::sync::{FirewallConfig, FirewallSync};
pub use validators::IpPolicy;
