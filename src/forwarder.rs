//! TCP forwarders into the sandbox.
//!
//! The daemon opens a listening socket on the host side and hands it over
//! the control channel; init adopts it and proxies every accepted client
//! to a target address reachable inside the namespace. Each direction is
//! copied independently and half-closes its destination on read EOF, so
//! resources are released as soon as either side finishes.

use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::OwnedFd;

use tracing::{debug, error, info, warn};

use crate::error::{InitError, Result};

/// Adopt `listener` and start the accept loop proxying to `proto://addr`.
/// Returns once the loop is armed; the reply to the daemon goes out
/// immediately after.
pub fn setup_forwarder(listener: OwnedFd, proto: &str, addr: &str) -> Result<()> {
    if proto != "tcp" {
        return Err(InitError::BadForwarderProto(proto.to_string()));
    }
    let listener = TcpListener::from(listener);
    let addr = addr.to_string();
    info!("Setting up forwarder to: {}", addr);
    std::thread::spawn(move || accept_loop(listener, &addr));
    Ok(())
}

fn accept_loop(listener: TcpListener, addr: &str) {
    loop {
        match listener.accept() {
            Ok((client, _peer)) => {
                info!("Forwarder to {} accepted incoming client.", addr);
                let addr = addr.to_string();
                std::thread::spawn(move || proxy(client, &addr));
            }
            Err(e) => {
                error!("Forwarder accept failed: {}", e);
                return;
            }
        }
    }
}

/// Dial the target and run both copy directions. A dial failure drops the
/// accepted client.
fn proxy(client: TcpStream, addr: &str) {
    let target = match TcpStream::connect(addr) {
        Ok(target) => target,
        Err(e) => {
            warn!("Forwarder dial to {} failed: {}", addr, e);
            return;
        }
    };

    let (client_r, client_w) = match (client.try_clone(), target.try_clone()) {
        (Ok(cr), Ok(tr)) => {
            std::thread::spawn(move || copy_half(cr, tr));
            (target, client)
        }
        _ => {
            debug!("Forwarder failed to clone streams");
            return;
        }
    };
    copy_half(client_r, client_w);
}

/// One direction: copy until read EOF, then close the peer's write end.
fn copy_half(mut src: TcpStream, mut dst: TcpStream) {
    let _ = io::copy(&mut src, &mut dst);
    let _ = dst.shutdown(Shutdown::Write);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_rejects_unknown_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let err = setup_forwarder(listener.into(), "udp", "127.0.0.1:1").unwrap_err();
        assert!(matches!(err, InitError::BadForwarderProto(_)));
    }

    #[test]
    fn test_bytes_roundtrip_through_forwarder() {
        // Target service: echoes everything back, uppercased markers
        // excluded so equality is byte-for-byte.
        let target = TcpListener::bind("127.0.0.1:0").expect("bind target");
        let target_addr = target.local_addr().expect("addr");
        std::thread::spawn(move || {
            let (mut conn, _) = target.accept().expect("accept");
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).expect("read");
            conn.write_all(&buf).expect("write");
        });

        let inbound = TcpListener::bind("127.0.0.1:0").expect("bind inbound");
        let inbound_addr = inbound.local_addr().expect("addr");
        setup_forwarder(inbound.into(), "tcp", &target_addr.to_string()).expect("arm forwarder");

        let mut client = TcpStream::connect(inbound_addr).expect("connect");
        let payload = b"forwarded payload \x00\x01\x02";
        client.write_all(payload).expect("send");
        client.shutdown(Shutdown::Write).expect("half-close");

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).expect("recv");
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_dial_failure_closes_client() {
        let inbound = TcpListener::bind("127.0.0.1:0").expect("bind inbound");
        let inbound_addr = inbound.local_addr().expect("addr");
        // Port 1 on loopback is almost certainly closed.
        setup_forwarder(inbound.into(), "tcp", "127.0.0.1:1").expect("arm forwarder");

        let mut client = TcpStream::connect(inbound_addr).expect("connect");
        let mut buf = [0u8; 1];
        // The proxy drops the accepted socket after the failed dial, so the
        // client observes EOF.
        let n = client.read(&mut buf).expect("read");
        assert_eq!(n, 0);
    }
}
