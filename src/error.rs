//! Error types for the oz-init library

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while bringing up or serving a sandbox.
///
/// Bootstrap-phase errors bubble up to `main`, which logs them and exits
/// with status 1. Errors raised inside an IPC handler are converted to an
/// `Error{msg}` reply on the same exchange and never terminate the server.
#[derive(Error, Debug)]
pub enum InitError {
    // Handshake errors
    #[error("oz-init must run as root")]
    NotRoot,

    #[error("oz-init must be launched in a new pid namespace")]
    NotPidOne,

    #[error("unable to decode init data: {0}")]
    BadHandshake(String),

    #[error("invalid uid or user passed to init")]
    BadUser,

    // Path resolution errors
    #[error("unknown variable `{token}` in path {path}")]
    BadPath { path: String, token: String },

    // Filesystem errors
    #[error("failed to mount {path}: {source}")]
    Mount {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    #[error("whitelist source does not exist: {0}")]
    SourceNotFound(PathBuf),

    #[error("refusing to follow symlink at {0}")]
    SymlinkRefused(PathBuf),

    #[error("rootfs error: {0}")]
    Rootfs(String),

    #[error("failed to set hostname to {0}")]
    HostnameSet(String),

    // Session service errors
    #[error("dbus error: {0}")]
    Dbus(String),

    #[error("xpra error: {0}")]
    Xpra(String),

    #[error("dconf load of {path} failed: {reason}")]
    DconfLoad { path: PathBuf, reason: String },

    // IPC errors
    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("message too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("{0} message received, but no file descriptor included")]
    MissingFd(&'static str),

    #[error("Unexpected message received {0}")]
    UnexpectedMessage(String),

    // Launch errors
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("No credentials received for RunShell command")]
    NoShellCreds,

    #[error("Cannot open shell because allowRootShell is disabled")]
    RootShellDenied,

    #[error("unsupported forwarder protocol: {0}")]
    BadForwarderProto(String),

    // Pass-through OS errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for oz-init operations
pub type Result<T> = std::result::Result<T, InitError>;
