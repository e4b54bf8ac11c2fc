//! oz-init - PID-1 supervisor for oz application sandboxes
//!
//! This library implements the init process that runs as PID 1 inside a
//! freshly created PID/mount/UTS/IPC namespace. It assembles the sandbox
//! root filesystem from a profile's whitelist and blacklist, drops
//! privileges to launch the confined application (optionally under a
//! seccomp filter or tracer), serves the daemon's control socket
//! (programs, shells, TCP forwarders, post-hoc mounts), and supervises
//! every child in the namespace until the shutdown policy fires.
//!
//! The binary target drives [`app::run`] with the handshake decoded from
//! stdin; everything else is exposed for the daemon-side crates and for
//! tests.

pub mod app;
pub mod config;
pub mod dbus;
pub mod error;
pub mod etcfiles;
pub mod forwarder;
pub mod handshake;
pub mod ipc;
pub mod launch;
pub mod logging;
pub mod messages;
pub mod network;
pub mod paths;
pub mod profile;
pub mod registry;
pub mod rootfs;
pub mod server;
pub mod shell;
pub mod supervisor;
pub mod xpra;

// Re-exports for convenience
pub use app::App;
pub use config::Config;
pub use error::{InitError, Result};
pub use handshake::{InitHandshake, SandboxUser};
pub use messages::{Body, Envelope};
pub use profile::{BlacklistItem, Profile, WhitelistItem};
