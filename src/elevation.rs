//! Privilege elevation for the nft command
//!
//! dbgate usually runs as an unprivileged service account and only needs root
//! to load set updates into nftables. How it elevates is decided once, in
//! configuration, through [`ElevationMethod`]:
//!
//! - `none`: run the program directly (root, or CAP_NET_ADMIN granted)
//! - `sudo` / `run0` / `pkexec`: prefix with the given helper
//! - `auto`: run directly when already root, otherwise prefer `run0`,
//!   then `sudo` on a terminal, then `pkexec`
//!
//! Commands are built without a shell, so arguments are never interpolated.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

/// How the nft command gets root privileges
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ElevationMethod {
    #[default]
    None,
    Sudo,
    Run0,
    Pkexec,
    Auto,
}

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation helper is not installed
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// No helper could be found for automatic elevation
    #[error("No elevation helper found (tried run0, sudo, pkexec)")]
    NoHelperFound,
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                full_path.is_file().then_some(full_path)
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn helper(name: &str, program: &Path, args: &[&str]) -> Result<Command, ElevationError> {
    if !binary_exists(name) {
        return Err(ElevationError::MethodNotAvailable(name.to_string()));
    }
    Ok(wrapped(name, program, args))
}

/// Builds a command running `program` with root privileges according to `method`.
///
/// # Errors
///
/// Returns `Err` if the requested helper (or, for `auto`, every helper) is
/// missing from PATH.
pub fn build_command(
    method: ElevationMethod,
    program: &Path,
    args: &[&str],
) -> Result<Command, ElevationError> {
    match method {
        ElevationMethod::None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        ElevationMethod::Sudo => helper("sudo", program, args),
        ElevationMethod::Run0 => helper("run0", program, args),
        ElevationMethod::Pkexec => helper("pkexec", program, args),
        ElevationMethod::Auto => {
            if nix::unistd::getuid().is_root() {
                return build_command(ElevationMethod::None, program, args);
            }

            if binary_exists("run0") {
                return Ok(wrapped("run0", program, args));
            }

            let is_atty = {
                use std::os::fd::AsFd;
                nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false)
            };

            if is_atty && binary_exists("sudo") {
                Ok(wrapped("sudo", program, args))
            } else if binary_exists("pkexec") {
                Ok(wrapped("pkexec", program, args))
            } else {
                Err(ElevationError::NoHelperFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(!binary_exists("dbgate_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_none_runs_program_directly() {
        let cmd = build_command(ElevationMethod::None, Path::new("/usr/sbin/nft"), &["-f", "-"]).unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/sbin/nft");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-f", "-"]);
    }

    #[test]
    fn test_missing_helper_is_reported() {
        let result = helper("dbgate_nonexistent_helper_xyz", Path::new("nft"), &[]);
        assert!(matches!(result, Err(ElevationError::MethodNotAvailable(_))));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ElevationMethod::from_str("run0").unwrap(), ElevationMethod::Run0);
        assert_eq!(ElevationMethod::Pkexec.to_string(), "pkexec");
        let parsed: ElevationMethod = serde_json::from_str("\"sudo\"").unwrap();
        assert_eq!(parsed, ElevationMethod::Sudo);
    }
}
