//! D-Bus machine UUID and session bus bootstrap.
//!
//! The machine UUID doubles as /etc/machine-id. A session bus is only
//! launched for profiles that need one (audio routing, notifications, or
//! the shared terminal server); its address variables are folded into the
//! launch environment of every subsequent application.

use std::os::unix::process::CommandExt;
use std::process::Command;

use tracing::debug;

use crate::error::{InitError, Result};
use crate::profile::{AudioMode, Profile};

const DBUS_UUIDGEN: &str = "/usr/bin/dbus-uuidgen";
const DBUS_LAUNCH: &str = "/usr/bin/dbus-launch";

/// Ensure the machine UUID exists and return it.
pub fn setup_uuid() -> Result<String> {
    // --ensure creates the id file when missing; its exit status only
    // matters if the subsequent --get produces nothing.
    let _ = Command::new(DBUS_UUIDGEN).arg("--ensure").status();

    let output = Command::new(DBUS_UUIDGEN)
        .arg("--get")
        .output()
        .map_err(|e| InitError::Dbus(format!("dbus-uuidgen failed: {e}")))?;
    let uuid = String::from_utf8_lossy(&output.stdout)
        .trim_matches(['\0', ' ', '\n', '\t'])
        .to_string();
    if !output.status.success() || uuid.is_empty() {
        return Err(InitError::Dbus(format!(
            "dbus-uuidgen failed: {} {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    debug!("dbus-uuid: {}", uuid);
    Ok(uuid)
}

/// Whether the profile requires a session bus.
pub fn needs_session(profile: &Profile) -> bool {
    profile.xserver.audio_mode == AudioMode::Full
        || profile.xserver.audio_mode == AudioMode::Speaker
        || profile.xserver.enable_notifications
        || profile.sandboxed_terminal
}

/// Launch a session bus under the sandbox credentials and return the
/// `DBUS_*` variables it prints.
pub fn launch_session(
    uuid: &str,
    launch_env: &[(String, String)],
    uid: u32,
    gid: u32,
) -> Result<Vec<(String, String)>> {
    let mut cmd = Command::new(DBUS_LAUNCH);
    cmd.arg(format!("--autolaunch={uuid}"))
        .arg("--sh-syntax")
        .arg("--close-stderr")
        .env_clear()
        .envs(launch_env.iter().map(|(k, v)| (k, v)))
        .uid(uid)
        .gid(gid);

    let output = cmd
        .output()
        .map_err(|e| InitError::Dbus(format!("dbus-launch failed: {e}")))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim_matches('\0').trim();
    if !output.status.success() && text.len() <= 1 {
        return Err(InitError::Dbus(format!(
            "dbus-launch failed: {} {}",
            output.status, text
        )));
    }
    Ok(parse_session_output(text))
}

/// Parse `--sh-syntax` output into `DBUS_*` variable pairs.
///
/// Lines look like `DBUS_SESSION_BUS_ADDRESS='unix:abstract=...';` with an
/// optional `export NAME` spelling; quotes, `export`, and the trailing
/// semicolon are stripped, and only `DBUS_`-prefixed names are kept.
fn parse_session_output(text: &str) -> Vec<(String, String)> {
    let cleaned = text.replace("export ", "").replace([';', '\''], "");
    let mut vars = Vec::new();
    for line in cleaned.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with("DBUS_") {
            continue;
        }
        if let Some((name, value)) = line.split_once('=') {
            vars.push((name.to_string(), value.to_string()));
        }
    }
    vars
}
