//! Stdin handshake with the spawning daemon.
//!
//! The daemon forks init into fresh namespaces, writes one JSON
//! [`InitHandshake`] object to its stdin, and then waits for the `WAITING`
//! line on stderr. Once the daemon has finished its side of the setup
//! (uid maps, veth wiring) it fires SIGUSR1 and init proceeds. The final
//! `OK` line tells the daemon every service inside the sandbox is up.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use nix::sys::signal::{SigSet, Signal};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, DEFAULT_SOCKET_NAME};
use crate::error::{InitError, Result};
use crate::profile::Profile;

/// The sandbox user's identity, resolved by the daemon from the host
/// passwd database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home_dir: PathBuf,
}

/// Everything init needs to bring one sandbox up, decoded once from stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct InitHandshake {
    pub profile: Profile,
    pub config: Config,
    /// Abstract-namespace control socket name, `@`-prefixed.
    pub socket_addr: String,
    /// `KEY=VALUE` environment entries for spawned applications.
    #[serde(default)]
    pub launch_env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    /// Supplementary groups by name.
    #[serde(default)]
    pub gids: HashMap<String, u32>,
    pub user: SandboxUser,
    /// X display number when the profile enables an X server.
    #[serde(default)]
    pub display: u32,
    /// Throwaway sandbox: home-directory whitelists are stripped.
    #[serde(default)]
    pub ephemeral: bool,
}

/// Decode the handshake object from `reader`.
pub fn read_handshake<R: Read>(reader: R) -> Result<InitHandshake> {
    serde_json::from_reader(reader).map_err(|e| InitError::BadHandshake(e.to_string()))
}

impl InitHandshake {
    /// Enforce the acceptance invariants against the calling process's
    /// effective uid and pid.
    pub fn validate(&self, euid: u32, pid: i32) -> Result<()> {
        if euid != 0 {
            return Err(InitError::NotRoot);
        }
        if pid != 1 {
            return Err(InitError::NotPidOne);
        }
        if self.uid == 0 || self.user.uid != self.uid {
            return Err(InitError::BadUser);
        }
        Ok(())
    }
}

/// Write the `WAITING` gate line and block until the parent fires SIGUSR1.
///
/// The line bypasses the logger: it is a protocol token, not a log event.
/// SIGUSR1 must already be blocked process-wide (see `supervisor`), which
/// makes the delivery race-free regardless of when the parent fires.
pub fn wait_for_parent() -> Result<()> {
    let mut stderr = std::io::stderr();
    stderr.write_all(b"WAITING\n")?;
    stderr.flush()?;

    let mut set = SigSet::empty();
    set.add(Signal::SIGUSR1);
    let sig = set.wait()?;
    info!("Received {} from parent, ready to init.", sig);
    Ok(())
}

/// Write the `OK` readiness sentinel once all services are up.
pub fn report_ready() -> Result<()> {
    let mut stderr = std::io::stderr();
    stderr.write_all(b"OK\n")?;
    stderr.flush()?;
    Ok(())
}

/// Abstract socket names must match `^@[A-Za-z0-9_-]+$`.
pub fn validate_socket_name(name: &str) -> bool {
    match name.strip_prefix('@') {
        Some(rest) if !rest.is_empty() => rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'),
        _ => false,
    }
}

/// Pick the control socket name: the handshake address when present,
/// otherwise a validated `OZ_SOCKET_NAME` override, otherwise the built-in
/// default.
pub fn control_socket_name(handshake_addr: &str) -> String {
    if !handshake_addr.is_empty() {
        return handshake_addr.to_string();
    }
    match std::env::var("OZ_SOCKET_NAME") {
        Ok(name) if !name.is_empty() => {
            let name = if name.starts_with('@') {
                name
            } else {
                format!("@{name}")
            };
            if validate_socket_name(&name) {
                name
            } else {
                warn!(
                    "Invalid socket name `{}`, reverting to `{}`",
                    name, DEFAULT_SOCKET_NAME
                );
                DEFAULT_SOCKET_NAME.to_string()
            }
        }
        _ => DEFAULT_SOCKET_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handshake(uid: u32, user_uid: u32) -> InitHandshake {
        InitHandshake {
            profile: Profile::default(),
            config: Config::default(),
            socket_addr: "@oz-init-1".into(),
            launch_env: vec![],
            uid,
            gid: 1000,
            gids: HashMap::new(),
            user: SandboxUser {
                uid: user_uid,
                gid: 1000,
                name: "user".into(),
                home_dir: PathBuf::from("/home/user"),
            },
            display: 0,
            ephemeral: false,
        }
    }

    #[test]
    fn test_validate_accepts_root_pid1() {
        assert!(sample_handshake(1000, 1000).validate(0, 1).is_ok());
    }

    #[test]
    fn test_validate_rejects_nonroot_caller() {
        assert!(matches!(
            sample_handshake(1000, 1000).validate(1000, 1),
            Err(InitError::NotRoot)
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_pid() {
        assert!(matches!(
            sample_handshake(1000, 1000).validate(0, 42),
            Err(InitError::NotPidOne)
        ));
    }

    #[test]
    fn test_validate_rejects_uid_mismatch_and_root_user() {
        assert!(matches!(
            sample_handshake(1000, 1001).validate(0, 1),
            Err(InitError::BadUser)
        ));
        assert!(matches!(
            sample_handshake(0, 0).validate(0, 1),
            Err(InitError::BadUser)
        ));
    }

    #[test]
    fn test_read_handshake_rejects_bad_json() {
        let err = read_handshake("{not json".as_bytes()).unwrap_err();
        assert!(matches!(err, InitError::BadHandshake(_)));
    }

    #[test]
    fn test_read_handshake_decodes_minimal_object() {
        let json = r#"{
            "profile": {"name": "editor"},
            "config": {},
            "socket_addr": "@oz-init-7",
            "uid": 1000,
            "gid": 1000,
            "user": {"uid": 1000, "gid": 1000, "name": "u", "home_dir": "/home/u"}
        }"#;
        let hs = read_handshake(json.as_bytes()).expect("decode handshake");
        assert_eq!(hs.profile.name, "editor");
        assert_eq!(hs.socket_addr, "@oz-init-7");
        assert!(!hs.ephemeral);
        assert!(hs.validate(0, 1).is_ok());
    }

    #[test]
    fn test_socket_name_validation() {
        assert!(validate_socket_name("@oz-control"));
        assert!(validate_socket_name("@a_b-c9"));
        assert!(!validate_socket_name("oz-control"));
        assert!(!validate_socket_name("@"));
        assert!(!validate_socket_name("@bad name"));
        assert!(!validate_socket_name("@bad/name"));
    }

    #[test]
    fn test_control_socket_name_prefers_handshake() {
        assert_eq!(control_socket_name("@oz-init-3"), "@oz-init-3");
    }
}
