//! Sandbox profile definitions.
//!
//! A profile describes one sandbox type: the application it runs, the
//! filesystem items bound into its root, and the session services it needs.
//! Profiles are loaded and validated by the daemon; init receives one fully
//! resolved profile in the stdin handshake and treats it as immutable.
//!
//! The whole profile also serializes back to JSON: wrapped launches feed it
//! to the seccomp helper over stdin so the filter list travels with the
//! process being confined.

use serde::{Deserialize, Serialize};

/// A single whitelist entry describing one bind mount into the sandbox.
///
/// An empty `path` disables the item. `allow_setuid` implies `read_only`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistItem {
    /// Host source path. May contain `${...}` variables and a shell glob in
    /// the final components.
    pub path: String,
    /// In-sandbox mount point; empty means mount at `path`.
    pub target: String,
    /// When non-empty, create a symlink at this path pointing at the bind
    /// destination.
    pub symlink: String,
    pub read_only: bool,
    /// Create the source (and ownership-correct parents) when missing.
    pub can_create: bool,
    /// Silently skip the item when the source does not exist.
    pub ignore: bool,
    /// Keep setuid honored on the mount; forces `read_only`.
    pub allow_setuid: bool,
    /// Unlink a pre-existing non-directory target before binding.
    pub force: bool,
    /// Refuse to traverse a symlink in the final component.
    pub no_follow: bool,
}

/// A path masked inside the sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistItem {
    pub path: String,
}

/// Audio plumbing mode for X-enabled sandboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    #[default]
    None,
    Speaker,
    Full,
    Pulse,
}

/// X server (xpra) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XServerConf {
    pub enabled: bool,
    pub audio_mode: AudioMode,
    pub enable_notifications: bool,
}

/// Seccomp confinement mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompMode {
    #[default]
    Disabled,
    Train,
    Whitelist,
    Blacklist,
}

impl SeccompMode {
    /// Value passed to the helper's `-mode=` flag.
    pub fn flag_name(self) -> &'static str {
        match self {
            SeccompMode::Disabled => "disabled",
            SeccompMode::Train => "train",
            SeccompMode::Whitelist => "whitelist",
            SeccompMode::Blacklist => "blacklist",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeccompConf {
    pub mode: SeccompMode,
    /// Apply the filter directly instead of running under the tracer.
    pub enforce: bool,
}

/// Network attachment type. Wiring happens outside init; the type only
/// controls daemon-side behavior and the hosts file content here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    #[default]
    Host,
    Bridge,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkProfile {
    pub nettype: NetType,
    /// Extra lines appended to the sandbox /etc/hosts.
    pub hosts: String,
}

/// Auto-shutdown policy after the last tracked child exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    #[default]
    No,
    Yes,
}

/// Immutable configuration for one sandbox type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Display name; also the sandbox hostname.
    pub name: String,
    /// Default executable path when RunProgram supplies none.
    pub path: String,
    /// Arguments prepended to every launch.
    pub default_params: Vec<String>,
    /// Discard caller-supplied arguments entirely.
    pub reject_user_args: bool,
    /// Route RunProgram through the shared gnome-terminal server.
    pub sandboxed_terminal: bool,
    /// Process basenames that keep the sandbox alive after the last tracked
    /// child exits.
    pub watchdog: Vec<String>,
    pub auto_shutdown: ShutdownMode,
    /// dconf keyfile loaded before terminal application launches.
    pub dconf_path: String,
    /// Skip mounting /proc and /sys.
    pub no_sys_proc: bool,
    pub whitelist: Vec<WhitelistItem>,
    pub blacklist: Vec<BlacklistItem>,
    /// `${HOME}`-relative folders surfaced read-write inside the sandbox.
    pub shared_folders: Vec<String>,
    pub networking: NetworkProfile,
    pub xserver: XServerConf,
    pub seccomp: SeccompConf,
}

fn item_is_ephemeral(path: &str, target: &str) -> bool {
    let probe = if target.is_empty() { path } else { target };
    probe.starts_with("${HOME}") || probe.starts_with("${XDG_")
}

impl WhitelistItem {
    /// True when the item binds something under the user's home or an XDG
    /// directory, judged by `target` when set, else by `path`.
    pub fn is_ephemeral(&self) -> bool {
        if self.path.is_empty() {
            return false;
        }
        item_is_ephemeral(&self.path, &self.target)
    }
}

impl Profile {
    /// True when the profile whitelists or shares anything under the user's
    /// home directory. Throwaway sandboxes strip exactly these items.
    pub fn has_ephemerals(&self) -> bool {
        self.whitelist.iter().any(WhitelistItem::is_ephemeral)
            || self
                .shared_folders
                .iter()
                .any(|sf| sf.starts_with("${HOME}") || sf.starts_with("${XDG_"))
    }
}
