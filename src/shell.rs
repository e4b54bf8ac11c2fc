//! Interactive shells served over the control channel.
//!
//! A RunShell request gets a fresh PTY pair: the shell runs on the slave
//! side under the requesting peer's credentials, and the master descriptor
//! travels back over the socket as ancillary data. Once delivered, the
//! peer owns the master; init never touches it again.

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::pty::openpty;
use nix::unistd::setsid;
use tracing::info;

use crate::app::App;
use crate::error::{InitError, Result};
use crate::ipc::PeerCreds;
use crate::launch;

/// Shell authorization: credentials must be present, and root peers are
/// only admitted when the config explicitly allows them.
pub fn authorize(creds: Option<PeerCreds>, allow_root_shell: bool) -> Result<PeerCreds> {
    let creds = creds.ok_or(InitError::NoShellCreds)?;
    if (creds.uid == 0 || creds.gid == 0) && !allow_root_shell {
        return Err(InitError::RootShellDenied);
    }
    Ok(creds)
}

/// Spawn `shell_path -i` on a new PTY under the peer's identity and return
/// the master descriptor.
pub fn open_shell(app: &App, term: &str, creds: &PeerCreds) -> Result<OwnedFd> {
    let peer_is_root = creds.uid == 0 || creds.gid == 0;
    let mut groups = vec![creds.gid];
    if !peer_is_root {
        groups.extend(app.gids.values().copied());
    }

    info!(
        "Starting shell with uid = {}, gid = {}",
        creds.uid, creds.gid
    );

    let pty = openpty(None, None)?;
    let master = pty.master;
    let slave = pty.slave;

    let mut cmd = Command::new(&app.config.shell_path);
    cmd.arg("-i")
        .env_clear()
        .envs(app.launch_env.iter().map(|(k, v)| (k, v)))
        .env("PS1", "[\\h] $ ")
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));
    launch::drop_credentials(&mut cmd, creds.uid, creds.gid, groups);
    if !term.is_empty() {
        cmd.env("TERM", term);
    }
    if !peer_is_root {
        cmd.current_dir(&app.user.home_dir);
    }

    launch::reset_signal_mask(&mut cmd);
    // SAFETY: the closure only calls async-signal-safe functions (setsid
    // and ioctl) between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            setsid().map_err(std::io::Error::from)?;
            // Adopt the PTY slave on stdin as the controlling terminal.
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    info!("Executing shell...");
    let child = cmd.spawn().map_err(|e| InitError::Spawn {
        program: app.config.shell_path.clone(),
        source: e,
    })?;
    app.registry.insert(child.id() as i32, false);
    Ok(master)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uid: u32, gid: u32) -> PeerCreds {
        PeerCreds { pid: 1234, uid, gid }
    }

    #[test]
    fn test_missing_creds_rejected() {
        let err = authorize(None, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No credentials received for RunShell command"
        );
    }

    #[test]
    fn test_root_peer_rejected_unless_allowed() {
        let err = authorize(Some(creds(0, 0)), false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot open shell because allowRootShell is disabled"
        );
        // gid 0 alone is also a root peer.
        assert!(authorize(Some(creds(1000, 0)), false).is_err());

        assert!(authorize(Some(creds(0, 0)), true).is_ok());
    }

    #[test]
    fn test_regular_peer_accepted() {
        let accepted = authorize(Some(creds(1000, 1000)), false).expect("authorized");
        assert_eq!(accepted.uid, 1000);
    }
}
