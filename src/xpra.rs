//! xpra display server lifecycle.
//!
//! The server runs inside the sandbox as the sandbox user, with the
//! `video` group (and `audio` when sound is routed). Its stderr is scraped
//! until the literal readiness line appears; the daemon-side client
//! attaches through the shared socket directory bound at /tmp/.X11-unix.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::error::{InitError, Result};
use crate::handshake::SandboxUser;
use crate::launch::{oz_environ, reset_signal_mask};
use crate::profile::AudioMode;

const XPRA: &str = "/usr/bin/xpra";

/// In-sandbox socket directory, shared with the host via a bind mount.
pub const SOCKET_DIR: &str = "/tmp/.X11-unix";

/// The literal stderr line marking server readiness.
const READY_MARKER: &str = "xpra is ready.";

/// A started xpra server. Dropping the handle does not stop the server;
/// its lifetime is the sandbox's.
pub struct XpraServer {
    display: u32,
    ready: mpsc::Receiver<bool>,
}

/// Group ids for the server process: sandbox gid, `video`, and `audio`
/// when the profile routes sound.
fn xpra_groups(gid: u32, gids: &HashMap<String, u32>, audio_mode: AudioMode) -> Vec<u32> {
    let mut groups = vec![gid];
    if let Some(&video) = gids.get("video") {
        groups.push(video);
    }
    if audio_mode != AudioMode::None {
        if let Some(&audio) = gids.get("audio") {
            groups.push(audio);
        }
    }
    groups
}

/// Spawn the server for `display` and start the readiness scraper.
pub fn start_server(
    user: &SandboxUser,
    uid: u32,
    gid: u32,
    gids: &HashMap<String, u32>,
    audio_mode: AudioMode,
    display: u32,
    log_xpra: bool,
) -> Result<XpraServer> {
    let mut cmd = Command::new(XPRA);
    cmd.arg("start")
        .arg(format!(":{display}"))
        .arg("--no-daemon")
        .arg(format!("--socket-dir={SOCKET_DIR}"))
        .env_clear()
        .env("HOME", &user.home_dir)
        .envs(oz_environ())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    crate::launch::drop_credentials(&mut cmd, uid, gid, xpra_groups(gid, gids, audio_mode));
    reset_signal_mask(&mut cmd);

    info!("Starting xpra server");
    let mut child = cmd.spawn().map_err(|e| InitError::Xpra(format!(
        "failed to start xpra server: {e}"
    )))?;

    debug!("xpra server started, pid {}", child.id());

    let (tx, ready) = mpsc::channel();
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| InitError::Xpra("xpra stderr not piped".to_string()))?;
    std::thread::spawn(move || scrape_stderr(stderr, tx, log_xpra));

    Ok(XpraServer { display, ready })
}

impl XpraServer {
    /// Block until the server reports readiness. An exit before the ready
    /// line is a bootstrap failure.
    pub fn wait_ready(&self) -> Result<()> {
        match self.ready.recv() {
            Ok(true) => Ok(()),
            _ => Err(InitError::Xpra(
                "xpra server exited before becoming ready".to_string(),
            )),
        }
    }

    /// Ask the server to stop, under the sandbox credentials. Output is
    /// logged line by line; failures are warnings since shutdown proceeds
    /// regardless.
    pub fn stop(&self, uid: u32, gid: u32) {
        let mut cmd = Command::new(XPRA);
        cmd.arg("stop")
            .arg(format!(":{}", self.display))
            .arg(format!("--socket-dir={SOCKET_DIR}"))
            .env_clear()
            .uid(uid)
            .gid(gid)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        reset_signal_mask(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Error running xpra stop: {}", e);
                return;
            }
        };
        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if !line.is_empty() {
                    debug!("(xpra stop) {}", line);
                }
            }
        }
    }
}

fn scrape_stderr<R: std::io::Read>(stderr: R, tx: mpsc::Sender<bool>, log_xpra: bool) {
    let reader = BufReader::new(stderr);
    let mut seen_ready = false;
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        if !seen_ready && line.contains(READY_MARKER) {
            seen_ready = true;
            let _ = tx.send(true);
            if !log_xpra {
                return;
            }
        }
        if log_xpra {
            debug!("(xpra-server) {}", line);
        }
    }
    // Stream ended; release a waiter that never saw the ready line.
    if !seen_ready {
        let _ = tx.send(false);
    }
}
