//! Child reaping, signal handling, and the shutdown policy.
//!
//! As PID 1, init inherits every orphan in the namespace and owns all
//! calls to `wait`. The reaper thread sleeps in `sigwait` on SIGCHLD and
//! drains zombies; a second thread turns SIGTERM/SIGINT into an orderly
//! shutdown. Both rely on the signals being blocked process-wide before
//! any thread is spawned.

use std::path::Path;
use std::sync::Arc;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tracing::{debug, info};

use crate::app::App;
use crate::error::Result;
use crate::profile::ShutdownMode;

/// Block every signal init handles synchronously. Must run on the main
/// thread before any other thread exists so the mask is inherited.
pub fn block_signals() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGUSR1);
    set.thread_block()?;
    Ok(())
}

/// Start the SIGCHLD reaper thread.
pub fn spawn_reaper(app: Arc<App>) {
    std::thread::spawn(move || {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        loop {
            if set.wait().is_err() {
                continue;
            }
            drain_zombies(&app);
        }
    });
}

/// Reap every currently waitable child.
fn drain_zombies(app: &App) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, status)) => {
                handle_child_exit(app, pid.as_raw(), status);
            }
            Ok(WaitStatus::Signaled(pid, signal, _core)) => {
                handle_child_exit(app, pid.as_raw(), 128 + signal as i32);
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// The §child-exit policy: remove the child, then decide whether this
/// exit shuts the sandbox down.
fn handle_child_exit(app: &App, pid: i32, status: i32) {
    debug!(
        "Child process pid={} exited from init with status {}",
        pid, status
    );
    let tracked = app
        .registry
        .remove(pid)
        .map(|entry| entry.tracked)
        .unwrap_or(false);
    app.registry.notify_exit(pid, status);

    if app.registry.has_tracked() {
        return;
    }

    let mut eligible = tracked;
    if !app.profile.watchdog.is_empty() {
        if watchdog_running(&app.profile.watchdog) {
            return;
        }
        // No watchdog process left: treat this exit as if it were tracked.
        eligible = true;
    }

    if eligible && app.profile.auto_shutdown == ShutdownMode::Yes {
        info!("Shutting down sandbox after child exit.");
        app.shutdown();
    }
}

/// Start the SIGTERM/SIGINT listener thread.
pub fn spawn_signal_listener(app: Arc<App>) {
    std::thread::spawn(move || {
        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGINT);
        loop {
            match set.wait() {
                Ok(signal) => {
                    info!("Received signal ({})", signal);
                    app.shutdown();
                }
                Err(_) => continue,
            }
        }
    });
}

/// Scan `/proc/*/cmdline` for any process whose argv[0] basename matches a
/// watchdog name.
pub fn watchdog_running(names: &[String]) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(pid) = file_name.to_str() else {
            continue;
        };
        if !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if let Some(base) = cmdline_basename(&cmdline) {
            if names.iter().any(|name| *name == base) {
                return true;
            }
        }
    }
    false
}

/// Basename of argv[0] from a NUL-separated /proc cmdline.
fn cmdline_basename(raw: &[u8]) -> Option<String> {
    let first = raw.split(|b| *b == 0).next()?;
    if first.is_empty() {
        return None;
    }
    let arg0 = String::from_utf8_lossy(first);
    Path::new(arg0.as_ref())
        .file_name()
        .map(|base| base.to_string_lossy().into_owned())
}
