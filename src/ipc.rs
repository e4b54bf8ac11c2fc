//! Control-socket transport.
//!
//! Frames are length-prefixed JSON:
//!
//! ```text
//! [4 bytes: u32 big-endian length][N bytes: JSON payload]
//! ```
//!
//! File descriptors ride as `SCM_RIGHTS` ancillary data on the `sendmsg`
//! carrying the frame, so they are always delivered with the first segment
//! of that frame. Peer credentials come from `SO_PEERCRED` and are captured
//! once per connection.
//!
//! The listener lives in the abstract socket namespace; names arrive
//! `@`-prefixed and the leading `@` is stripped to form the kernel name.

use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::unistd::{Gid, Uid};
use tracing::warn;

use crate::error::{InitError, Result};

/// Length prefix size: 4 bytes (u32 big-endian)
const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload: 128 KiB. Profiles travel in frames, so the cap is
/// above the daemon's largest profile but still bounds a hostile peer.
pub const MAX_FRAME_SIZE: u32 = 128 * 1024;

/// Maximum file descriptors accepted with one frame.
pub const MAX_FRAME_FDS: usize = 4;

/// Credentials of the connected peer, from `SO_PEERCRED`.
#[derive(Debug, Clone, Copy)]
pub struct PeerCreds {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// A connected control-channel stream with frame and fd transfer.
pub struct FrameStream {
    stream: UnixStream,
}

impl FrameStream {
    pub fn new(stream: UnixStream) -> Self {
        FrameStream { stream }
    }

    /// Read the peer's credentials.
    pub fn peer_creds(&self) -> Result<PeerCreds> {
        use libc::{getsockopt, socklen_t, ucred, SOL_SOCKET, SO_PEERCRED};
        use std::mem;

        let mut cred: ucred = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<ucred>() as socklen_t;

        // SAFETY: getsockopt with SO_PEERCRED writes a ucred struct. We
        // provide a valid buffer and length.
        let ret = unsafe {
            getsockopt(
                self.stream.as_raw_fd(),
                SOL_SOCKET,
                SO_PEERCRED,
                &mut cred as *mut ucred as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(InitError::Ipc(format!(
                "SO_PEERCRED failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(PeerCreds {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    }

    /// Write one frame, attaching `fds` as `SCM_RIGHTS` ancillary data.
    pub fn send(&self, payload: &[u8], fds: &[RawFd]) -> Result<()> {
        use libc::{c_void, cmsghdr, iovec, msghdr, sendmsg, CMSG_DATA, CMSG_LEN, CMSG_SPACE};
        use std::mem;

        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(InitError::FrameTooLarge {
                len: payload.len() as u32,
                max: MAX_FRAME_SIZE,
            });
        }
        if fds.len() > MAX_FRAME_FDS {
            return Err(InitError::Ipc(format!(
                "too many fds for one frame: {}",
                fds.len()
            )));
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let iov = iovec {
            iov_base: frame.as_ptr() as *mut c_void,
            iov_len: frame.len(),
        };

        let fd_bytes = std::mem::size_of_val(fds);
        let cmsg_space = if fds.is_empty() {
            0
        } else {
            unsafe { CMSG_SPACE(fd_bytes as u32) as usize }
        };
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &iov as *const iovec as *mut iovec;
        msg.msg_iovlen = 1;
        if !fds.is_empty() {
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = cmsg_space as _;

            // SAFETY: the cmsg buffer was sized with CMSG_SPACE for exactly
            // fd_bytes of SCM_RIGHTS data; we write within its bounds.
            let cmsg: &mut cmsghdr = unsafe { &mut *(cmsg_buf.as_mut_ptr().cast::<cmsghdr>()) };
            cmsg.cmsg_level = libc::SOL_SOCKET;
            cmsg.cmsg_type = libc::SCM_RIGHTS;
            cmsg.cmsg_len = unsafe { CMSG_LEN(fd_bytes as u32) } as _;

            // SAFETY: CMSG_DATA points into the cmsg buffer we own; the copy
            // length matches CMSG_LEN above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr() as *const u8,
                    CMSG_DATA(cmsg),
                    fd_bytes,
                );
            }
        }

        // SAFETY: msg is fully initialized with a valid iovec and (when fds
        // are present) a valid control buffer; the socket fd is live.
        let sent = unsafe { sendmsg(self.stream.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if sent < 0 {
            return Err(InitError::Ipc(format!(
                "sendmsg failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // The ancillary data went out with the first byte; any remainder of
        // the frame is plain stream data.
        if (sent as usize) < frame.len() {
            (&self.stream).write_all(&frame[sent as usize..])?;
        }
        Ok(())
    }

    /// Read one frame. Returns `None` on clean EOF at a frame boundary.
    /// Ancillary fds received with any segment of the frame are returned
    /// alongside the payload.
    pub fn recv(&self) -> Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
        let mut fds = Vec::new();

        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        if !self.recv_exact(&mut len_bytes, &mut fds, true)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_SIZE {
            return Err(InitError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut payload = vec![0u8; len as usize];
        if !self.recv_exact(&mut payload, &mut fds, false)? {
            return Err(InitError::Ipc("connection closed mid-frame".to_string()));
        }
        Ok(Some((payload, fds)))
    }

    /// Fill `buf` from the stream, collecting any ancillary fds seen along
    /// the way. Returns false on EOF; EOF before the first byte is only
    /// tolerated when `allow_eof` is set.
    fn recv_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, allow_eof: bool) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv_chunk(&mut buf[filled..], fds)?;
            if n == 0 {
                if filled == 0 && allow_eof {
                    return Ok(false);
                }
                return Err(InitError::Ipc("connection closed mid-frame".to_string()));
            }
            filled += n;
        }
        Ok(true)
    }

    /// One `recvmsg` with room for ancillary data.
    fn recv_chunk(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
        use libc::{c_void, cmsghdr, iovec, msghdr, recvmsg, CMSG_DATA, CMSG_FIRSTHDR, CMSG_NXTHDR};
        use std::mem;

        let mut iov = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        let cmsg_space =
            unsafe { libc::CMSG_SPACE((MAX_FRAME_FDS * mem::size_of::<RawFd>()) as u32) as usize };
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov as *mut iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_space as _;

        // SAFETY: msg is fully initialized with valid iov and cmsg buffers;
        // MSG_CMSG_CLOEXEC keeps received fds from leaking across exec.
        let received =
            unsafe { recvmsg(self.stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if received < 0 {
            return Err(InitError::Ipc(format!(
                "recvmsg failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Walk every SCM_RIGHTS control message and take ownership of the
        // delivered descriptors.
        // SAFETY: CMSG_FIRSTHDR/CMSG_NXTHDR stay within the control buffer
        // the kernel just filled; cmsg_len bounds each data region.
        unsafe {
            let mut cmsg: *mut cmsghdr = CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = data_len / mem::size_of::<RawFd>();
                    let data = CMSG_DATA(cmsg) as *const RawFd;
                    for i in 0..count {
                        let fd = std::ptr::read_unaligned(data.add(i));
                        if fd >= 0 {
                            fds.push(OwnedFd::from_raw_fd(fd));
                        }
                    }
                }
                cmsg = CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(received as usize)
    }
}

/// Listening side of the control socket.
pub struct IpcListener {
    listener: UnixListener,
    closed: AtomicBool,
}

impl IpcListener {
    /// Bind the abstract-namespace socket `name` (with or without the
    /// conventional `@` prefix).
    pub fn bind(name: &str) -> Result<Self> {
        let abstract_name = name.strip_prefix('@').unwrap_or(name);
        let addr = SocketAddr::from_abstract_name(abstract_name)
            .map_err(|e| InitError::Ipc(format!("bad socket name `{name}`: {e}")))?;
        let listener = UnixListener::bind_addr(&addr)
            .map_err(|e| InitError::Ipc(format!("failed to listen on `{name}`: {e}")))?;
        Ok(IpcListener {
            listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Accept one connection; `None` once the listener has been shut down.
    pub fn accept(&self) -> Result<Option<FrameStream>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(FrameStream::new(stream))),
            Err(_) if self.closed.load(Ordering::SeqCst) => Ok(None),
            Err(e) => Err(InitError::Ipc(format!("accept failed: {e}"))),
        }
    }

    /// Unblock any pending accept and refuse further connections.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // SAFETY: shutting down a listening socket fd is always safe; it
        // forces blocked accept() calls to return.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

/// Chown the control socket to the sandbox user so unprivileged clients can
/// connect. Abstract names have no inode, so this can fail; the failure is
/// a warning, not an error.
pub fn chown_control_socket(name: &str, uid: u32, gid: u32) {
    if let Err(e) = nix::unistd::chown(
        name,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
    ) {
        warn!("Failed to chown oz-init control socket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    fn pair() -> (FrameStream, FrameStream) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (FrameStream::new(a), FrameStream::new(b))
    }

    #[test]
    fn test_frame_roundtrip() {
        let (client, server) = pair();
        client.send(b"{\"id\":1}", &[]).expect("send");
        let (payload, fds) = server.recv().expect("recv").expect("frame");
        assert_eq!(payload, b"{\"id\":1}");
        assert!(fds.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let (client, server) = pair();
        for i in 0..3u8 {
            client.send(&[i; 16], &[]).expect("send");
        }
        for i in 0..3u8 {
            let (payload, _) = server.recv().expect("recv").expect("frame");
            assert_eq!(payload, vec![i; 16]);
        }
    }

    #[test]
    fn test_eof_at_boundary_is_none() {
        let (client, server) = pair();
        drop(client);
        assert!(server.recv().expect("recv").is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let (client, _server) = pair();
        let huge = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        assert!(matches!(
            client.send(&huge, &[]),
            Err(InitError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_fd_passing_with_frame() {
        let (client, server) = pair();

        let mut tmp = tempfile::tempfile().expect("tempfile");
        use std::io::Write as _;
        tmp.write_all(b"through the wire").expect("write");
        tmp.flush().expect("flush");

        client
            .send(b"fd attached", &[tmp.as_raw_fd()])
            .expect("send");
        let (payload, mut fds) = server.recv().expect("recv").expect("frame");
        assert_eq!(payload, b"fd attached");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.pop().expect("fd"));
        received.seek(SeekFrom::Start(0)).expect("seek");
        let mut content = String::new();
        received.read_to_string(&mut content).expect("read");
        assert_eq!(content, "through the wire");
    }

    #[test]
    fn test_peer_creds_of_socketpair() {
        let (client, _server) = pair();
        let creds = client.peer_creds().expect("creds");
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
    }

    #[test]
    fn test_listener_shutdown_unblocks_accept() {
        let listener =
            IpcListener::bind(&format!("@oz-test-{}", std::process::id())).expect("bind");
        let listener = std::sync::Arc::new(listener);
        let accepting = listener.clone();
        let handle = std::thread::spawn(move || accepting.accept());
        std::thread::sleep(std::time::Duration::from_millis(50));
        listener.shutdown();
        let accepted = handle.join().expect("join").expect("accept result");
        assert!(accepted.is_none());
    }
}
