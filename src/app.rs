//! Bootstrap driver and shared sandbox state.
//!
//! [`App`] is the explicit value that replaces any global init state: it
//! is assembled once during bootstrap (while the launch environment is
//! still growing), frozen behind an `Arc`, and threaded through every
//! handler and supervisor thread. After the freeze the only mutable parts
//! are the child registry, the set-once xpra handle, and the shutdown
//! latch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::config::Config;
use crate::dbus;
use crate::error::Result;
use crate::etcfiles;
use crate::handshake::{self, InitHandshake, SandboxUser};
use crate::ipc::{self, IpcListener};
use crate::launch;
use crate::network;
use crate::paths::XdgDirs;
use crate::profile::{AudioMode, Profile, WhitelistItem};
use crate::registry::ChildRegistry;
use crate::rootfs::{BuildInputs, Filesystem};
use crate::server;
use crate::supervisor;
use crate::xpra::{self, XpraServer};

/// Shared state for one sandbox lifetime.
pub struct App {
    pub config: Config,
    pub profile: Profile,
    pub user: SandboxUser,
    pub uid: u32,
    pub gid: u32,
    pub gids: HashMap<String, u32>,
    pub display: u32,
    /// Frozen after bootstrap; read by every launch site.
    pub launch_env: Vec<(String, String)>,
    pub xdg: XdgDirs,
    pub registry: ChildRegistry,
    xpra: Mutex<Option<XpraServer>>,
    listener: IpcListener,
    shutdown_started: AtomicBool,
}

impl App {
    pub fn listener(&self) -> &IpcListener {
        &self.listener
    }

    /// Orderly teardown: SIGINT to every child, stop xpra, close the
    /// control socket so the serve loop exits. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for pid in self.registry.pids() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
        }
        if let Some(server) = self.xpra.lock().expect("xpra handle poisoned").take() {
            server.stop(self.uid, self.gid);
        }
        self.listener.shutdown();
    }

    #[cfg(test)]
    pub fn for_tests() -> Arc<App> {
        use std::sync::atomic::AtomicU32;
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let listener = IpcListener::bind(&format!("@oz-test-app-{}-{}", std::process::id(), n))
            .expect("bind test listener");
        let user = SandboxUser {
            uid: 1000,
            gid: 1000,
            name: "user".into(),
            home_dir: "/home/user".into(),
        };
        let xdg = XdgDirs::for_user(&user);
        Arc::new(App {
            config: Config::default(),
            profile: Profile::default(),
            user,
            uid: 1000,
            gid: 1000,
            gids: HashMap::new(),
            display: 0,
            launch_env: Vec::new(),
            xdg,
            registry: ChildRegistry::new(),
            xpra: Mutex::new(None),
            listener,
            shutdown_started: AtomicBool::new(false),
        })
    }
}

/// `KEY=VALUE` entries to pairs; malformed entries are dropped.
fn parse_env_entries(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Extra whitelist items for pulse-audio profiles, bound before the
/// profile's own entries.
fn pulse_whitelist() -> Vec<WhitelistItem> {
    vec![
        WhitelistItem {
            path: "/run/user/${UID}/pulse/native".into(),
            ignore: true,
            ..Default::default()
        },
        WhitelistItem {
            path: "${HOME}/.config/pulse/cookie".into(),
            ignore: true,
            read_only: true,
            ..Default::default()
        },
        WhitelistItem {
            path: "/dev/shm/pulse-shm-*".into(),
            ignore: true,
            ..Default::default()
        },
    ]
}

/// Drive the whole bootstrap, then serve the control socket until
/// shutdown.
pub fn run(handshake_data: InitHandshake) -> Result<()> {
    let InitHandshake {
        profile,
        config,
        socket_addr,
        launch_env,
        uid,
        gid,
        gids,
        user,
        display,
        ephemeral,
    } = handshake_data;

    // Nothing below may touch the filesystem before the parent says go.
    handshake::wait_for_parent()?;
    info!("Starting oz-init for profile: {}", profile.name);

    let socket_name = handshake::control_socket_name(&socket_addr);
    let listener = IpcListener::bind(&socket_name)?;
    ipc::chown_control_socket(&socket_name, uid, gid);

    let mut env = parse_env_entries(&launch_env);
    env.push(("PATH".to_string(), "/usr/bin:/bin".to_string()));
    if profile.xserver.enabled {
        env.push(("DISPLAY".to_string(), format!(":{display}")));
    }

    let extra_whitelist = if profile.xserver.audio_mode == AudioMode::Pulse {
        pulse_whitelist()
    } else {
        Vec::new()
    };

    let mut filesystem = Filesystem::new(&config, &user, uid, gid, &profile.name);
    let xdg = filesystem.xdg().clone();
    filesystem.build(&BuildInputs {
        profile: &profile,
        extra_whitelist,
        extra_blacklist: Vec::new(),
        ephemeral,
        display,
    })?;

    if !user.home_dir.as_os_str().is_empty() {
        env.push((
            "HOME".to_string(),
            user.home_dir.to_string_lossy().into_owned(),
        ));
    }

    network::setup()?;
    network::print_interfaces();

    etcfiles::set_host_identity(&profile.name)?;

    let dbus_uuid = dbus::setup_uuid()?;
    etcfiles::write_etc_files(&profile.name, &dbus_uuid, &profile.networking.hosts);

    // The session bus is brought up while the launch environment is still
    // ours to extend; its address variables must reach every later spawn.
    if dbus::needs_session(&profile) {
        let vars = dbus::launch_session(&dbus_uuid, &env, uid, gid)?;
        for (name, value) in vars {
            std::env::set_var(&name, &value);
            env.push((name, value));
        }
    }

    let app = Arc::new(App {
        config,
        profile,
        user,
        uid,
        gid,
        gids,
        display,
        launch_env: env,
        xdg,
        registry: ChildRegistry::new(),
        xpra: Mutex::new(None),
        listener,
        shutdown_started: AtomicBool::new(false),
    });

    supervisor::spawn_reaper(Arc::clone(&app));

    if app.profile.xserver.enabled {
        let server = xpra::start_server(
            &app.user,
            app.uid,
            app.gid,
            &app.gids,
            app.profile.xserver.audio_mode,
            app.display,
            app.config.log_xpra,
        )?;
        server.wait_ready()?;
        info!("XPRA started");
        *app.xpra.lock().expect("xpra handle poisoned") = Some(server);
    }

    etcfiles::write_sandbox_marker(&app.profile.name);

    if app.profile.sandboxed_terminal {
        let watch = launch::watch_terminal_server_ready(&app)?;
        launch::launch_terminal_server(&app)?;
        watch.wait();
        info!("Terminal server ready");
    }

    handshake::report_ready()?;
    supervisor::spawn_signal_listener(Arc::clone(&app));

    if let Err(e) = server::serve(&app) {
        warn!("Control server returned err: {}", e);
    }
    info!("oz-init exiting...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_entries() {
        let entries = vec![
            "PATH=/usr/bin".to_string(),
            "EMPTY=".to_string(),
            "garbage".to_string(),
            "A=b=c".to_string(),
        ];
        let parsed = parse_env_entries(&entries);
        assert_eq!(
            parsed,
            vec![
                ("PATH".to_string(), "/usr/bin".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("A".to_string(), "b=c".to_string()),
            ]
        );
    }

    #[test]
    fn test_pulse_whitelist_items_are_optional_binds() {
        let items = pulse_whitelist();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.ignore));
        assert!(items
            .iter()
            .any(|item| item.path == "${HOME}/.config/pulse/cookie" && item.read_only));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let app = App::for_tests();
        app.shutdown();
        // A second call must be a no-op rather than re-signaling children.
        app.shutdown();
        assert!(app.shutdown_started.load(Ordering::SeqCst));
    }
}
