//! Application launching inside the sandbox.
//!
//! Every launch goes through the same pipeline: path diversion, argument
//! policy, seccomp wrapping, credential drop, working-directory selection,
//! and output capture into the log stream. Terminal profiles add a detour
//! through gnome-terminal and its shared server.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use tracing::{debug, info};

use crate::app::App;
use crate::config::Config;
use crate::error::{InitError, Result};
use crate::profile::{Profile, SeccompMode};

const GNOME_TERMINAL: &str = "/usr/bin/gnome-terminal";
const GNOME_TERMINAL_SERVER: &str = "/usr/lib/gnome-terminal/gnome-terminal-server";
const DBUS_MONITOR: &str = "/usr/bin/dbus-monitor";
const DCONF: &str = "/usr/bin/dconf";

/// A fully decided program invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Wrapped launches receive the profile JSON on stdin.
    pub feed_profile: bool,
}

/// Apply the configured path diversions to an executable path.
pub fn divert(config: &Config, cpath: &str) -> String {
    let mut cpath = cpath.to_string();
    if !config.divert_suffix.is_empty() {
        cpath = format!("{}.{}", cpath, config.divert_suffix);
    }
    if config.divert_path {
        let path = Path::new(&cpath);
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let base = path.file_name().unwrap_or_default();
        cpath = format!("{}-oz/{}", dir.display(), base.to_string_lossy());
    }
    cpath
}

/// Apply the profile's argument policy to caller-supplied arguments.
pub fn effective_args(profile: &Profile, args: &[String]) -> Vec<String> {
    let user_args: Vec<String> = if profile.reject_user_args {
        info!(
            "RejectUserArgs true, discarding user supplied command arguments: {:?}",
            args
        );
        Vec::new()
    } else {
        args.to_vec()
    };
    let mut out = profile.default_params.clone();
    out.extend(user_args);
    out
}

/// Decide the outer program and argv for the profile's seccomp mode.
pub fn seccomp_plan(
    config: &Config,
    profile: &Profile,
    target: &str,
    args: &[String],
) -> CommandPlan {
    let mode = profile.seccomp.mode;
    match mode {
        SeccompMode::Disabled => CommandPlan {
            program: target.to_string(),
            args: args.to_vec(),
            feed_profile: false,
        },
        SeccompMode::Train => tracer_plan(config, mode, target, args),
        SeccompMode::Whitelist | SeccompMode::Blacklist => {
            if profile.seccomp.enforce {
                enforcing_plan(config, mode, target, args)
            } else {
                tracer_plan(config, mode, target, args)
            }
        }
    }
}

/// Direct filter: `oz-seccomp -mode=<mode> <target> args...`
fn enforcing_plan(
    config: &Config,
    mode: SeccompMode,
    target: &str,
    args: &[String],
) -> CommandPlan {
    let mut argv = vec![format!("-mode={}", mode.flag_name()), target.to_string()];
    argv.extend(args.iter().cloned());
    CommandPlan {
        program: config.helper_path("oz-seccomp").to_string_lossy().into_owned(),
        args: argv,
        feed_profile: true,
    }
}

/// Ptrace tracer: `oz-seccomp-tracer <oz-seccomp> -mode=<mode> <target> args...`
fn tracer_plan(config: &Config, mode: SeccompMode, target: &str, args: &[String]) -> CommandPlan {
    let filter = config.helper_path("oz-seccomp").to_string_lossy().into_owned();
    let mut argv = vec![
        filter,
        format!("-mode={}", mode.flag_name()),
        target.to_string(),
    ];
    argv.extend(args.iter().cloned());
    CommandPlan {
        program: config
            .helper_path("oz-seccomp-tracer")
            .to_string_lossy()
            .into_owned(),
        args: argv,
        feed_profile: true,
    }
}

/// `OZ_`-prefixed variables inherited from the daemon, propagated into
/// every spawned application.
pub fn oz_environ() -> Vec<(String, String)> {
    std::env::vars().filter(|(k, _)| k.starts_with("OZ_")).collect()
}

/// Pick the working directory: the request's `pwd` when it names an
/// existing directory, the user's home otherwise.
pub fn working_dir(pwd: &str, home: &Path) -> PathBuf {
    if !pwd.is_empty() && Path::new(pwd).is_dir() {
        PathBuf::from(pwd)
    } else {
        home.to_path_buf()
    }
}

/// Supplementary group list: the sandbox gid plus every mapped group.
fn group_list(gid: u32, gids: &HashMap<String, u32>) -> Vec<u32> {
    let mut groups = vec![gid];
    groups.extend(gids.values().copied());
    groups
}

/// Drop to the given uid/gid/supplementary groups before exec.
///
/// `Command::groups` is gated behind the unstable `setgroups` feature, so
/// the drop is done by hand via a `pre_exec` closure instead of the
/// builtin `Command::uid`/`Command::gid`/`Command::groups` methods. Order
/// matters: groups must be set while still root, then gid, then uid.
pub fn drop_credentials(cmd: &mut Command, uid: u32, gid: u32, groups: Vec<u32>) {
    let groups: Vec<nix::unistd::Gid> = groups.into_iter().map(nix::unistd::Gid::from_raw).collect();
    // SAFETY: the pre_exec closure only calls the async-signal-safe
    // setgroups/setgid/setuid between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setgroups(&groups).map_err(std::io::Error::from)?;
            nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).map_err(std::io::Error::from)?;
            nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

/// Children must not inherit init's blocked signal mask.
pub fn reset_signal_mask(cmd: &mut Command) {
    // SAFETY: the pre_exec closure only calls the async-signal-safe
    // sigprocmask between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                .map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

/// Forward one output stream into the log, line by line.
pub fn scrape_output<R: Read + Send + 'static>(reader: R, label: &'static str, strip_empty: bool) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if strip_empty && line.is_empty() {
                continue;
            }
            debug!("({}) {}", label, line);
        }
    });
}

/// Serialize the profile into a wrapper's stdin, then close it.
fn feed_profile(child: &mut Child, profile: &Profile) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| InitError::Ipc("wrapper stdin not piped".to_string()))?;
    let data = serde_json::to_vec(profile)?;
    stdin.write_all(&data)?;
    Ok(())
}

struct SpawnOptions<'a> {
    pwd: &'a str,
    extra_env: Vec<(String, String)>,
    tracked: bool,
    strip_empty: bool,
}

/// Shared tail of every launch: credentials, environment, cwd, output
/// scraping, profile feeding, and registry insertion.
fn spawn_logged(app: &App, plan: &CommandPlan, opts: SpawnOptions<'_>) -> Result<i32> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .env_clear()
        .envs(oz_environ())
        .envs(app.launch_env.iter().map(|(k, v)| (k, v)))
        .envs(opts.extra_env)
        .current_dir(working_dir(opts.pwd, &app.user.home_dir))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if plan.feed_profile {
        cmd.stdin(Stdio::piped());
    }
    drop_credentials(&mut cmd, app.uid, app.gid, group_list(app.gid, &app.gids));
    reset_signal_mask(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| InitError::Spawn {
        program: plan.program.clone(),
        source: e,
    })?;
    if plan.feed_profile {
        feed_profile(&mut child, &app.profile)?;
    }

    let pid = child.id() as i32;
    app.registry.insert(pid, opts.tracked);
    if let Some(stdout) = child.stdout.take() {
        scrape_output(stdout, "stdout", opts.strip_empty);
    }
    if let Some(stderr) = child.stderr.take() {
        scrape_output(stderr, "stderr", opts.strip_empty);
    }
    Ok(pid)
}

/// Launch the profile's application (or an explicit path) directly.
pub fn launch_application(app: &App, path: &str, pwd: &str, args: &[String]) -> Result<i32> {
    let cpath = if path.is_empty() {
        app.profile.path.clone()
    } else {
        path.to_string()
    };
    let cpath = divert(&app.config, &cpath);
    let args = effective_args(&app.profile, args);
    let plan = seccomp_plan(&app.config, &app.profile, &cpath, &args);
    if app.profile.seccomp.mode != SeccompMode::Disabled {
        info!(
            "Enabling seccomp {} for: {}",
            app.profile.seccomp.mode.flag_name(),
            cpath
        );
    }
    spawn_logged(
        app,
        &plan,
        SpawnOptions {
            pwd,
            extra_env: Vec::new(),
            tracked: true,
            strip_empty: false,
        },
    )
}

/// Launch an application inside the shared terminal.
pub fn launch_terminal_application(
    app: &App,
    path: &str,
    pwd: &str,
    args: &[String],
    no_exec: bool,
) -> Result<i32> {
    let cpath = if path.is_empty() {
        app.profile.path.clone()
    } else {
        path.to_string()
    };
    let cpath = divert(&app.config, &cpath);
    let args = effective_args(&app.profile, args);

    if !app.profile.dconf_path.is_empty() {
        info!(
            "Loading dconf configuration from: {}",
            app.profile.dconf_path
        );
        dconf_load(app)?;
    }

    let mut argv = vec!["--hide-menubar".to_string(), "--".to_string()];
    if no_exec {
        argv.push(app.config.shell_path.clone());
    } else {
        argv.push(cpath);
        argv.extend(args);
    }
    let plan = CommandPlan {
        program: GNOME_TERMINAL.to_string(),
        args: argv,
        feed_profile: false,
    };
    spawn_logged(
        app,
        &plan,
        SpawnOptions {
            pwd,
            extra_env: vec![("PS1".to_string(), "[\\h] $ ".to_string())],
            tracked: true,
            strip_empty: false,
        },
    )
}

/// Launch the shared gnome-terminal server, seccomp-wrapped like a primary
/// application but registered as an auxiliary: the applications it hosts
/// gate auto-shutdown, the server itself does not.
pub fn launch_terminal_server(app: &App) -> Result<i32> {
    let plan = seccomp_plan(&app.config, &app.profile, GNOME_TERMINAL_SERVER, &[]);
    spawn_logged(
        app,
        &plan,
        SpawnOptions {
            pwd: "",
            extra_env: vec![(
                "PS1".to_string(),
                format!("[{}] $ ", app.profile.name),
            )],
            tracked: false,
            strip_empty: true,
        },
    )
}

/// Run `dconf load` with the profile's keyfile on stdin, under the sandbox
/// credentials. A failure aborts the terminal launch.
fn dconf_load(app: &App) -> Result<()> {
    let path = PathBuf::from(&app.profile.dconf_path);
    let file = std::fs::File::open(&path).map_err(|e| InitError::DconfLoad {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let mut cmd = Command::new(DCONF);
    cmd.arg("load")
        .arg("/")
        .env_clear()
        .envs(app.launch_env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::from(file))
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    drop_credentials(&mut cmd, app.uid, app.gid, group_list(app.gid, &app.gids));
    reset_signal_mask(&mut cmd);

    // The reaper owns wait() for the whole pid namespace, so the exit
    // status arrives through the registry rather than Child::wait.
    let mut child = cmd.spawn().map_err(|e| InitError::DconfLoad {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let exit = app.registry.await_exit(child.id() as i32);
    if let Some(stderr) = child.stderr.take() {
        scrape_output(stderr, "dconf", true);
    }
    let status = exit.recv().map_err(|_| InitError::DconfLoad {
        path: path.clone(),
        reason: "reaper stopped before dconf exited".to_string(),
    })?;
    if status != 0 {
        return Err(InitError::DconfLoad {
            path,
            reason: format!("exited with status {status}"),
        });
    }
    Ok(())
}

/// A running dbus-monitor watching for the terminal server's bus name.
pub struct TerminalReadyWatch {
    monitor: Child,
    ready: mpsc::Receiver<()>,
}

impl TerminalReadyWatch {
    /// Block until a scanner reports the name acquisition (or its stream
    /// ends), then kill the monitor.
    pub fn wait(mut self) {
        let _ = self.ready.recv();
        if let Err(e) = self.monitor.kill() {
            debug!("Failed to kill dbus-monitor... {}", e);
        }
    }
}

/// Start `dbus-monitor` with a NameAcquired match and scan both of its
/// output streams for the terminal server's name. Either scanner firing
/// releases the watch.
pub fn watch_terminal_server_ready(app: &App) -> Result<TerminalReadyWatch> {
    let query = "type='signal',sender='org.freedesktop.DBus',\
                 path='/org/freedesktop/DBus',interface='org.freedesktop.DBus',\
                 member='NameAcquired'";
    let mut cmd = Command::new(DBUS_MONITOR);
    cmd.arg("--session")
        .arg(query)
        .env_clear()
        .envs(app.launch_env.iter().map(|(k, v)| (k, v)))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    drop_credentials(&mut cmd, app.uid, app.gid, group_list(app.gid, &app.gids));
    reset_signal_mask(&mut cmd);

    let mut monitor = cmd.spawn().map_err(|e| InitError::Spawn {
        program: DBUS_MONITOR.to_string(),
        source: e,
    })?;
    app.registry.insert(monitor.id() as i32, false);

    let (tx, ready) = mpsc::channel();
    if let Some(stdout) = monitor.stdout.take() {
        scan_for_terminal_name(stdout, tx.clone());
    }
    if let Some(stderr) = monitor.stderr.take() {
        scan_for_terminal_name(stderr, tx);
    }
    Ok(TerminalReadyWatch { monitor, ready })
}

fn scan_for_terminal_name<R: Read + Send + 'static>(reader: R, tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.contains("\"org.gnome.Terminal\"") {
                break;
            }
        }
        // Fires on match or on stream end; either way the waiter must not
        // block forever.
        let _ = tx.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_divert_suffix() {
        let mut cfg = config();
        cfg.divert_suffix = "real".into();
        assert_eq!(divert(&cfg, "/usr/bin/editor"), "/usr/bin/editor.real");
    }

    #[test]
    fn test_divert_path_keeps_basename() {
        let mut cfg = config();
        cfg.divert_path = true;
        assert_eq!(divert(&cfg, "/usr/bin/editor"), "/usr/bin-oz/editor");
    }

    #[test]
    fn test_divert_both() {
        let mut cfg = config();
        cfg.divert_suffix = "real".into();
        cfg.divert_path = true;
        assert_eq!(divert(&cfg, "/usr/bin/editor"), "/usr/bin-oz/editor.real");
    }

    #[test]
    fn test_divert_disabled_is_identity() {
        assert_eq!(divert(&config(), "/usr/bin/editor"), "/usr/bin/editor");
    }

    #[test]
    fn test_reject_user_args_discards_then_prepends_defaults() {
        let profile = Profile {
            reject_user_args: true,
            default_params: vec!["--safe".into()],
            ..Default::default()
        };
        let args = effective_args(&profile, &["--unsafe".into()]);
        assert_eq!(args, vec!["--safe".to_string()]);
    }

    #[test]
    fn test_default_params_prepended() {
        let profile = Profile {
            default_params: vec!["--flag".into()],
            ..Default::default()
        };
        let args = effective_args(&profile, &["a.txt".into()]);
        assert_eq!(args, vec!["--flag".to_string(), "a.txt".to_string()]);
    }

    fn seccomp_profile(mode: SeccompMode, enforce: bool) -> Profile {
        Profile {
            seccomp: crate::profile::SeccompConf { mode, enforce },
            ..Default::default()
        }
    }

    #[test]
    fn test_seccomp_disabled_runs_target_directly() {
        let plan = seccomp_plan(
            &config(),
            &seccomp_profile(SeccompMode::Disabled, false),
            "/usr/bin/editor",
            &["a.txt".into()],
        );
        assert_eq!(plan.program, "/usr/bin/editor");
        assert_eq!(plan.args, vec!["a.txt".to_string()]);
        assert!(!plan.feed_profile);
        assert!(!plan.program.contains("oz-seccomp"));
    }

    #[test]
    fn test_seccomp_whitelist_enforced() {
        let plan = seccomp_plan(
            &config(),
            &seccomp_profile(SeccompMode::Whitelist, true),
            "/usr/bin/editor",
            &["a.txt".into()],
        );
        assert_eq!(
            Path::new(&plan.program).file_name().unwrap(),
            "oz-seccomp"
        );
        assert_eq!(plan.args[0], "-mode=whitelist");
        assert_eq!(plan.args[1], "/usr/bin/editor");
        assert_eq!(plan.args[2], "a.txt");
        assert!(plan.feed_profile);
    }

    #[test]
    fn test_seccomp_whitelist_unenforced_uses_tracer() {
        let plan = seccomp_plan(
            &config(),
            &seccomp_profile(SeccompMode::Whitelist, false),
            "/usr/bin/editor",
            &[],
        );
        assert_eq!(
            Path::new(&plan.program).file_name().unwrap(),
            "oz-seccomp-tracer"
        );
        assert_eq!(
            Path::new(&plan.args[0]).file_name().unwrap(),
            "oz-seccomp"
        );
        assert_eq!(plan.args[1], "-mode=whitelist");
        assert_eq!(plan.args[2], "/usr/bin/editor");
        assert!(plan.feed_profile);
    }

    #[test]
    fn test_seccomp_train_uses_tracer() {
        let plan = seccomp_plan(
            &config(),
            &seccomp_profile(SeccompMode::Train, false),
            "/bin/x",
            &[],
        );
        assert_eq!(
            Path::new(&plan.program).file_name().unwrap(),
            "oz-seccomp-tracer"
        );
        assert_eq!(plan.args[1], "-mode=train");
    }

    #[test]
    fn test_seccomp_blacklist_enforced() {
        let plan = seccomp_plan(
            &config(),
            &seccomp_profile(SeccompMode::Blacklist, true),
            "/bin/x",
            &[],
        );
        assert_eq!(
            Path::new(&plan.program).file_name().unwrap(),
            "oz-seccomp"
        );
        assert_eq!(plan.args[0], "-mode=blacklist");
    }

    #[test]
    fn test_working_dir_falls_back_to_home() {
        let home = Path::new("/home/user");
        assert_eq!(
            working_dir("/nonexistent-dir-xyz", home),
            PathBuf::from("/home/user")
        );
        assert_eq!(working_dir("", home), PathBuf::from("/home/user"));
        assert_eq!(working_dir("/tmp", home), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_oz_environ_filters_prefix() {
        std::env::set_var("OZ_TEST_MARKER", "1");
        std::env::set_var("NOT_OZ_MARKER", "1");
        let env = oz_environ();
        assert!(env.contains(&("OZ_TEST_MARKER".to_string(), "1".to_string())));
        assert!(!env.iter().any(|(k, _)| k == "NOT_OZ_MARKER"));
    }

    #[test]
    fn test_group_list_includes_gid_and_mapped() {
        let mut gids = HashMap::new();
        gids.insert("video".to_string(), 44);
        let groups = group_list(1000, &gids);
        assert!(groups.contains(&1000));
        assert!(groups.contains(&44));
    }
}
