//! Daemon-shared configuration.
//!
//! The daemon decodes its config file once and forwards the result to every
//! init it spawns as part of the stdin handshake, so this struct only needs
//! to deserialize. Every field carries a default so a partial config from
//! an older daemon still decodes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Built-in control socket name, used when the environment supplies an
/// invalid override.
pub const DEFAULT_SOCKET_NAME: &str = "@oz-control";

fn default_sandbox_path() -> PathBuf {
    PathBuf::from("/srv/oz")
}

fn default_prefix_path() -> PathBuf {
    PathBuf::from("/usr/local")
}

fn default_shell_path() -> String {
    "/bin/bash".to_string()
}

/// Global sandbox configuration shared between the daemon and init.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which sandbox root filesystems are assembled.
    pub sandbox_path: PathBuf,
    /// Install prefix for the seccomp helper binaries.
    pub prefix_path: PathBuf,
    /// Shell spawned for RunShell requests.
    pub shell_path: String,
    /// Permit RunShell from peers with uid 0 or gid 0.
    pub allow_root_shell: bool,
    /// Mount a full devtmpfs instead of the minimal device node set.
    pub use_full_dev: bool,
    /// Keep forwarding xpra server output after the ready line.
    pub log_xpra: bool,
    /// Suffix appended to diverted executable paths.
    pub divert_suffix: String,
    /// Rewrite the executable's directory component to `<dir>-oz`.
    pub divert_path: bool,
    /// Host /etc entries copied into the sandbox /etc during scaffold.
    pub etc_includes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sandbox_path: default_sandbox_path(),
            prefix_path: default_prefix_path(),
            shell_path: default_shell_path(),
            allow_root_shell: false,
            use_full_dev: false,
            log_xpra: false,
            divert_suffix: String::new(),
            divert_path: false,
            etc_includes: Vec::new(),
        }
    }
}

impl Config {
    /// Path of a helper binary under the install prefix.
    pub fn helper_path(&self, name: &str) -> PathBuf {
        self.prefix_path.join("bin").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: Config = serde_json::from_str("{}").expect("decode empty config");
        assert_eq!(config.sandbox_path, PathBuf::from("/srv/oz"));
        assert_eq!(config.shell_path, "/bin/bash");
        assert!(!config.allow_root_shell);
        assert!(!config.divert_path);
    }

    #[test]
    fn test_helper_path_uses_prefix() {
        let config: Config =
            serde_json::from_str(r#"{"prefix_path": "/opt/oz"}"#).expect("decode config");
        assert_eq!(
            config.helper_path("oz-seccomp"),
            PathBuf::from("/opt/oz/bin/oz-seccomp")
        );
    }
}
