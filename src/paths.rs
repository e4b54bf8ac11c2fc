//! Path variable expansion against the sandbox user.
//!
//! Whitelist, blacklist, and shared-folder paths may reference `${HOME}`,
//! `${UID}`, and the `${XDG_*}` directory set. XDG directories come from the
//! user's `user-dirs.dirs` file when present, with the conventional defaults
//! otherwise. Mount sources may additionally carry a shell glob in their
//! final component; symlink and target resolution never globs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::Glob;

use crate::error::{InitError, Result};
use crate::handshake::SandboxUser;

/// Resolved XDG directory table for one user, keyed by variable name
/// (`XDG_DOWNLOAD_DIR`, `XDG_CONFIG_HOME`, ...).
#[derive(Debug, Clone)]
pub struct XdgDirs {
    dirs: HashMap<String, PathBuf>,
}

const USER_DIR_DEFAULTS: &[(&str, &str)] = &[
    ("XDG_DESKTOP_DIR", "Desktop"),
    ("XDG_DOWNLOAD_DIR", "Downloads"),
    ("XDG_TEMPLATES_DIR", "Templates"),
    ("XDG_PUBLICSHARE_DIR", "Public"),
    ("XDG_DOCUMENTS_DIR", "Documents"),
    ("XDG_MUSIC_DIR", "Music"),
    ("XDG_PICTURES_DIR", "Pictures"),
    ("XDG_VIDEOS_DIR", "Videos"),
];

impl XdgDirs {
    /// Build the table for `user`, overlaying `~/.config/user-dirs.dirs`
    /// on the defaults when it exists and parses.
    pub fn for_user(user: &SandboxUser) -> Self {
        let mut table = Self::defaults(&user.home_dir);
        let config = user.home_dir.join(".config/user-dirs.dirs");
        if let Ok(content) = std::fs::read_to_string(&config) {
            for (name, path) in parse_user_dirs(&content, &user.home_dir) {
                table.insert(name, path);
            }
        }
        XdgDirs { dirs: table }
    }

    fn defaults(home: &Path) -> HashMap<String, PathBuf> {
        let mut table = HashMap::new();
        for (name, rel) in USER_DIR_DEFAULTS {
            table.insert((*name).to_string(), home.join(rel));
        }
        table.insert("XDG_CONFIG_HOME".to_string(), home.join(".config"));
        table.insert("XDG_CACHE_HOME".to_string(), home.join(".cache"));
        table.insert("XDG_DATA_HOME".to_string(), home.join(".local/share"));
        table
    }

    pub fn lookup(&self, name: &str) -> Option<&PathBuf> {
        self.dirs.get(name)
    }
}

/// Parse `user-dirs.dirs` lines of the form `XDG_X_DIR="$HOME/X"`.
fn parse_user_dirs(content: &str, home: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if !name.starts_with("XDG_") || !name.ends_with("_DIR") {
            continue;
        }
        let value = value.trim_matches('"');
        let path = if let Some(rel) = value.strip_prefix("$HOME/") {
            home.join(rel)
        } else if value == "$HOME" || value == "$HOME/" {
            home.to_path_buf()
        } else if value.starts_with('/') {
            PathBuf::from(value)
        } else {
            continue;
        };
        out.push((name.to_string(), path));
    }
    out
}

/// Expand every `${...}` token in `input`.
fn expand(input: &str, user: &SandboxUser, xdg: &XdgDirs) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(InitError::BadPath {
                path: input.to_string(),
                token: after.to_string(),
            });
        };
        let token = &after[..end];
        match token {
            "HOME" => out.push_str(&user.home_dir.to_string_lossy()),
            "UID" => out.push_str(&user.uid.to_string()),
            name if name.starts_with("XDG_") => match xdg.lookup(name) {
                Some(path) => out.push_str(&path.to_string_lossy()),
                None => {
                    return Err(InitError::BadPath {
                        path: input.to_string(),
                        token: token.to_string(),
                    })
                }
            },
            _ => {
                return Err(InitError::BadPath {
                    path: input.to_string(),
                    token: token.to_string(),
                })
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve a path that must name exactly one file: variables expanded,
/// globs not interpreted.
pub fn resolve_no_glob(input: &str, user: &SandboxUser, xdg: &XdgDirs) -> Result<PathBuf> {
    Ok(PathBuf::from(expand(input, user, xdg)?))
}

fn has_glob_meta(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Resolve a mount source, expanding a shell glob in the final component.
///
/// Returns every existing match; a glob over a missing directory yields no
/// matches rather than an error (the whitelist item's `ignore` flag decides
/// what that means). Globs are only honored in the last component.
pub fn resolve_glob(input: &str, user: &SandboxUser, xdg: &XdgDirs) -> Result<Vec<PathBuf>> {
    let expanded = expand(input, user, xdg)?;
    if !has_glob_meta(&expanded) {
        return Ok(vec![PathBuf::from(expanded)]);
    }

    let path = PathBuf::from(&expanded);
    let (parent, pattern) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_string_lossy().into_owned()),
        _ => {
            return Err(InitError::Rootfs(format!(
                "cannot glob path without a parent: {expanded}"
            )))
        }
    };
    if has_glob_meta(&parent.to_string_lossy()) {
        return Err(InitError::Rootfs(format!(
            "glob only allowed in the final path component: {expanded}"
        )));
    }

    let matcher = Glob::new(&pattern)
        .map_err(|e| InitError::Rootfs(format!("bad glob `{pattern}`: {e}")))?
        .compile_matcher();

    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(_) => return Ok(matches),
    };
    for entry in entries.flatten() {
        if matcher.is_match(entry.file_name().to_string_lossy().as_ref()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> SandboxUser {
        SandboxUser {
            uid: 1000,
            gid: 1000,
            name: "user".into(),
            home_dir: PathBuf::from("/home/user"),
        }
    }

    fn xdg() -> XdgDirs {
        XdgDirs {
            dirs: XdgDirs::defaults(Path::new("/home/user")),
        }
    }

    #[test]
    fn test_expand_home_and_uid() {
        let resolved = resolve_no_glob("${HOME}/.config/app", &user(), &xdg()).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/home/user/.config/app"));

        let resolved = resolve_no_glob("/run/user/${UID}/pulse", &user(), &xdg()).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/run/user/1000/pulse"));
    }

    #[test]
    fn test_expand_xdg_defaults() {
        let resolved = resolve_no_glob("${XDG_DOWNLOAD_DIR}/x", &user(), &xdg()).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/home/user/Downloads/x"));
    }

    #[test]
    fn test_unknown_token_is_bad_path() {
        let err = resolve_no_glob("${WAT}/x", &user(), &xdg()).unwrap_err();
        assert!(matches!(err, InitError::BadPath { .. }));

        let err = resolve_no_glob("${XDG_NOPE_DIR}/x", &user(), &xdg()).unwrap_err();
        assert!(matches!(err, InitError::BadPath { .. }));
    }

    #[test]
    fn test_unterminated_token_is_bad_path() {
        let err = resolve_no_glob("${HOME/x", &user(), &xdg()).unwrap_err();
        assert!(matches!(err, InitError::BadPath { .. }));
    }

    #[test]
    fn test_parse_user_dirs_overrides() {
        let content = r#"
# comment
XDG_DOWNLOAD_DIR="$HOME/dl"
XDG_MUSIC_DIR="/mnt/music"
NOT_A_DIR="$HOME/x"
"#;
        let parsed = parse_user_dirs(content, Path::new("/home/user"));
        assert!(parsed.contains(&("XDG_DOWNLOAD_DIR".into(), PathBuf::from("/home/user/dl"))));
        assert!(parsed.contains(&("XDG_MUSIC_DIR".into(), PathBuf::from("/mnt/music"))));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_resolve_glob_passthrough_without_meta() {
        let matches = resolve_glob("${HOME}/.cache", &user(), &xdg()).expect("resolve");
        assert_eq!(matches, vec![PathBuf::from("/home/user/.cache")]);
    }

    #[test]
    fn test_resolve_glob_matches_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["pulse-shm-1", "pulse-shm-2", "other"] {
            std::fs::write(dir.path().join(name), b"").expect("touch");
        }
        let pattern = format!("{}/pulse-shm-*", dir.path().display());
        let matches = resolve_glob(&pattern, &user(), &xdg()).expect("glob");
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|p| p
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("pulse-shm-")));
    }

    #[test]
    fn test_resolve_glob_missing_dir_is_empty() {
        let matches = resolve_glob("/nonexistent-dir-xyz/*", &user(), &xdg()).expect("glob");
        assert!(matches.is_empty());
    }
}
