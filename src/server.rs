//! Control-channel dispatch.
//!
//! One thread accepts connections; each connection thread decodes frames
//! serially and hands every request to its own handler thread. Responses
//! are sequenced through a gate so the reply order on a connection always
//! matches the request order, whatever the handlers' relative timing. A
//! panicking handler produces an `Error` reply; it never takes the server
//! down.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info, warn};

use crate::app::App;
use crate::error::{InitError, Result};
use crate::forwarder;
use crate::ipc::{FrameStream, PeerCreds};
use crate::launch;
use crate::messages::{self, Body, Envelope};
use crate::paths;
use crate::rootfs;
use crate::shell;

/// Accept loop. Returns when the listener is shut down.
pub fn serve(app: &Arc<App>) -> Result<()> {
    loop {
        match app.listener().accept()? {
            None => return Ok(()),
            Some(stream) => {
                let app = Arc::clone(app);
                std::thread::spawn(move || connection(app, stream));
            }
        }
    }
}

/// Orders responses by arrival ticket within one connection.
struct ResponseGate {
    next: Mutex<u64>,
    ready: Condvar,
}

impl ResponseGate {
    fn new() -> Self {
        ResponseGate {
            next: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    /// Run `write` once every earlier ticket has written.
    fn send_in_order(&self, ticket: u64, write: impl FnOnce()) {
        let mut next = self.next.lock().expect("response gate poisoned");
        while *next != ticket {
            next = self.ready.wait(next).expect("response gate poisoned");
        }
        write();
        *next += 1;
        self.ready.notify_all();
    }
}

fn connection(app: Arc<App>, stream: FrameStream) {
    let creds = match stream.peer_creds() {
        Ok(creds) => Some(creds),
        Err(e) => {
            warn!("Could not read peer credentials: {}", e);
            None
        }
    };
    let stream = Arc::new(stream);
    let gate = Arc::new(ResponseGate::new());
    let mut ticket = 0u64;

    loop {
        let (payload, fds) = match stream.recv() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("Control connection error: {}", e);
                break;
            }
        };

        let app = Arc::clone(&app);
        let stream = Arc::clone(&stream);
        let gate = Arc::clone(&gate);
        let this_ticket = ticket;
        ticket += 1;

        std::thread::spawn(move || {
            let (id, body) = messages::decode(&payload);
            let outcome = catch_unwind(AssertUnwindSafe(|| handle(&app, body, fds, creds)));
            let (reply, reply_fds) = outcome.unwrap_or_else(|_| {
                (
                    Body::Error {
                        msg: "internal error in handler".to_string(),
                    },
                    Vec::new(),
                )
            });
            gate.send_in_order(this_ticket, || {
                let raw_fds: Vec<RawFd> = reply_fds.iter().map(|fd| fd.as_raw_fd()).collect();
                match messages::encode(&Envelope { id, body: reply }) {
                    Ok(bytes) => {
                        if let Err(e) = stream.send(&bytes, &raw_fds) {
                            debug!("Failed to send response: {}", e);
                        }
                    }
                    Err(e) => debug!("Failed to encode response: {}", e),
                }
            });
        });
    }
}

/// Dispatch one decoded request to its handler.
fn handle(
    app: &App,
    body: Result<Body>,
    fds: Vec<OwnedFd>,
    creds: Option<PeerCreds>,
) -> (Body, Vec<OwnedFd>) {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            return (
                Body::Error { msg: e.to_string() },
                Vec::new(),
            )
        }
    };
    match body {
        Body::Ping { data } => (Body::Ping { data }, Vec::new()),
        Body::RunProgram {
            path,
            pwd,
            args,
            no_exec,
        } => reply(run_program(app, &path, &pwd, &args, no_exec)),
        Body::RunShell { term } => match run_shell(app, &term, creds) {
            Ok(master) => (Body::Ok, vec![master]),
            Err(e) => (Body::Error { msg: e.to_string() }, Vec::new()),
        },
        Body::SetupForwarder { addr, proto } => reply(setup_forwarder(fds, &proto, &addr)),
        Body::MountFiles { files, read_only } => reply(mount_files(app, &files, read_only)),
        Body::UnmountFile { file } => reply(unmount_file(app, &file)),
        other @ (Body::Ok | Body::NotOk | Body::Error { .. }) => (
            Body::Error {
                msg: format!("Unexpected message received {}", other.kind()),
            },
            Vec::new(),
        ),
    }
}

fn reply(result: Result<()>) -> (Body, Vec<OwnedFd>) {
    match result {
        Ok(()) => (Body::Ok, Vec::new()),
        Err(e) => (Body::Error { msg: e.to_string() }, Vec::new()),
    }
}

fn run_program(app: &App, path: &str, pwd: &str, args: &[String], no_exec: bool) -> Result<()> {
    info!(
        "Run program message received: path={} args={:?}",
        path, args
    );
    if app.profile.sandboxed_terminal {
        launch::launch_terminal_application(app, path, pwd, args, no_exec)?;
    } else if !no_exec {
        launch::launch_application(app, path, pwd, args)?;
    }
    Ok(())
}

fn run_shell(app: &App, term: &str, creds: Option<PeerCreds>) -> Result<OwnedFd> {
    let creds = shell::authorize(creds, app.config.allow_root_shell)?;
    shell::open_shell(app, term, &creds)
}

fn setup_forwarder(mut fds: Vec<OwnedFd>, proto: &str, addr: &str) -> Result<()> {
    if fds.is_empty() {
        return Err(InitError::MissingFd("SetupForwarder"));
    }
    if fds.len() > 1 {
        return Err(InitError::Ipc(format!(
            "SetupForwarder expects exactly one fd, got {}",
            fds.len()
        )));
    }
    forwarder::setup_forwarder(fds.pop().expect("one fd"), proto, addr)
}

fn mount_files(app: &App, files: &[String], read_only: bool) -> Result<()> {
    for file in files {
        let path = paths::resolve_no_glob(file, &app.user, &app.xdg)?;
        info!("Mounting file into sandbox: {}", path.display());
        rootfs::mount_file(&path, read_only)?;
    }
    Ok(())
}

fn unmount_file(app: &App, file: &str) -> Result<()> {
    let path = paths::resolve_no_glob(file, &app.user, &app.xdg)?;
    info!("Unmounting file from sandbox: {}", path.display());
    rootfs::unmount_file(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_response_gate_orders_writes() {
        let gate = Arc::new(ResponseGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        // Later tickets start first to force out-of-order completion.
        for ticket in (0u64..4).rev() {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(5 * (4 - ticket)));
                gate.send_in_order(ticket, || {
                    order.lock().expect("order").push(ticket);
                });
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_response_gate_single_ticket() {
        let gate = ResponseGate::new();
        let fired = AtomicU64::new(0);
        gate.send_in_order(0, || {
            fired.store(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    fn test_app() -> Arc<App> {
        crate::app::App::for_tests()
    }

    #[test]
    fn test_handle_ping_echoes_payload() {
        let app = test_app();
        let (reply, fds) = handle(
            &app,
            Ok(Body::Ping {
                data: "heartbeat".into(),
            }),
            Vec::new(),
            None,
        );
        assert_eq!(
            reply,
            Body::Ping {
                data: "heartbeat".into()
            }
        );
        assert!(fds.is_empty());
    }

    #[test]
    fn test_handle_reply_body_is_unexpected() {
        let app = test_app();
        let (reply, _) = handle(&app, Ok(Body::Ok), Vec::new(), None);
        match reply {
            Body::Error { msg } => {
                assert!(msg.starts_with("Unexpected message received"));
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn test_handle_decode_error_becomes_error_reply() {
        let app = test_app();
        let (reply, _) = handle(
            &app,
            Err(InitError::UnexpectedMessage("{\"type\":\"Nope\"}".into())),
            Vec::new(),
            None,
        );
        assert!(matches!(reply, Body::Error { .. }));
    }

    #[test]
    fn test_handle_run_shell_requires_creds() {
        let app = test_app();
        let (reply, fds) = handle(
            &app,
            Ok(Body::RunShell { term: "xterm".into() }),
            Vec::new(),
            None,
        );
        assert_eq!(
            reply,
            Body::Error {
                msg: "No credentials received for RunShell command".into()
            }
        );
        assert!(fds.is_empty());
    }

    #[test]
    fn test_handle_root_shell_denied() {
        let app = test_app();
        let creds = PeerCreds {
            pid: 9,
            uid: 0,
            gid: 0,
        };
        let (reply, _) = handle(
            &app,
            Ok(Body::RunShell { term: String::new() }),
            Vec::new(),
            Some(creds),
        );
        assert_eq!(
            reply,
            Body::Error {
                msg: "Cannot open shell because allowRootShell is disabled".into()
            }
        );
    }

    #[test]
    fn test_handle_forwarder_without_fd() {
        let app = test_app();
        let (reply, _) = handle(
            &app,
            Ok(Body::SetupForwarder {
                addr: "127.0.0.1:9050".into(),
                proto: "tcp".into(),
            }),
            Vec::new(),
            None,
        );
        assert_eq!(
            reply,
            Body::Error {
                msg: "SetupForwarder message received, but no file descriptor included".into()
            }
        );
    }
}
