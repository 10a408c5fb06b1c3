//! Owned TCP endpoints.
//!
//! A `SocketHandle` owns at most one OS descriptor. Every operation reports its outcome as a
//! `SocketStatus` or a bool rather than an error, so a failed syscall degrades the handle instead
//! of unwinding through the server.

use libc;

use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use mio::unix::EventedFd;

use socket2::{Domain, SockAddr, Socket, TcpKeepalive, Type};

use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use config::KeepAliveConfig;

/// Descriptor value held by a handle that owns nothing.
pub const NO_SOCKET: RawFd = -1;

/// Lifecycle of a socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Connected,
    ErrSocketInit,
    ErrSocketBind,
    ErrSocketConnect,
    Disconnected,
    ErrSocketType,
    ErrSocketListening,
}

bitflags! {
    /// How a handle should be initialised.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u16 {
        const CLIENT = 1;
        const SERVER = 2;
        const BLOCKING = 4;
        const NONBLOCKING = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Read,
    Write,
    ReadWrite,
}

/// The full socket contract shared by raw handles and connection handlers.
///
/// Implementors only point at the handle they wrap; every operation is forwarded to it.
pub trait Endpoint {
    fn socket(&self) -> &SocketHandle;

    fn socket_mut(&mut self) -> &mut SocketHandle;

    fn host(&self) -> Ipv4Addr {
        self.socket().host()
    }

    fn port(&self) -> u16 {
        self.socket().port()
    }

    fn status(&self) -> SocketStatus {
        self.socket().status()
    }

    fn fd(&self) -> RawFd {
        self.socket().fd()
    }

    fn send_to(&self, buffer: &[u8]) -> bool {
        self.socket().send_to(buffer)
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> Option<usize> {
        self.socket_mut().recv_from(buffer)
    }

    fn disconnect(&mut self) -> SocketStatus {
        self.socket_mut().disconnect()
    }

    fn is_allow_to_read(&self, timeout: Duration) -> bool {
        self.socket().is_allow_to_read(timeout)
    }

    fn is_allow_to_write(&self, timeout: Duration) -> bool {
        self.socket().is_allow_to_write(timeout)
    }

    fn is_allow_to_rwrite(&self, timeout: Duration) -> bool {
        self.socket().is_allow_to_rwrite(timeout)
    }
}

/// A move-only owner of one TCP descriptor.
#[derive(Debug)]
pub struct SocketHandle {
    sock: Option<Socket>,
    status: SocketStatus,
    address: SocketAddrV4,
    mode: Mode,
}

impl Default for SocketHandle {
    fn default() -> Self {
        SocketHandle {
            sock: None,
            status: SocketStatus::Disconnected,
            address: SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0),
            mode: Mode::empty(),
        }
    }
}

impl SocketHandle {
    pub fn new() -> Self {
        SocketHandle::default()
    }

    /// Open the handle as a listening server or as a connected client, depending on `mode`.
    /// An already connected handle is disconnected first.
    pub fn init(&mut self, host: Ipv4Addr, port: u16, mode: Mode) -> SocketStatus {
        if self.status == SocketStatus::Connected {
            self.disconnect();
        }

        if mode.contains(Mode::SERVER) {
            self.init_as_server(host, port, mode)
        } else if mode.contains(Mode::CLIENT) {
            self.init_as_client(host, port, mode)
        } else {
            self.status = SocketStatus::ErrSocketType;
            self.status
        }
    }

    fn init_as_server(&mut self, host: Ipv4Addr, port: u16, mode: Mode) -> SocketStatus {
        let addr = SocketAddrV4::new(host, port);
        let sock = match Socket::new(Domain::IPV4, Type::STREAM, None) {
            Ok(sock) => sock,
            Err(e) => return self.fail(SocketStatus::ErrSocketInit, e),
        };
        if let Err(e) = sock.set_nonblocking(mode.contains(Mode::NONBLOCKING)) {
            return self.fail(SocketStatus::ErrSocketInit, e);
        }
        if let Err(e) = sock.set_reuse_address(true) {
            return self.fail(SocketStatus::ErrSocketBind, e);
        }
        if let Err(e) = sock.bind(&SockAddr::from(addr)) {
            return self.fail(SocketStatus::ErrSocketBind, e);
        }
        if let Err(e) = sock.listen(libc::SOMAXCONN) {
            return self.fail(SocketStatus::ErrSocketListening, e);
        }

        // Port 0 asks the OS to pick, so record what it picked.
        self.address = sock
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket_ipv4())
            .unwrap_or(addr);
        self.sock = Some(sock);
        self.mode = mode;
        self.status = SocketStatus::Connected;
        self.status
    }

    fn init_as_client(&mut self, host: Ipv4Addr, port: u16, mode: Mode) -> SocketStatus {
        let addr = SocketAddrV4::new(host, port);
        let sock = match Socket::new(Domain::IPV4, Type::STREAM, None) {
            Ok(sock) => sock,
            Err(e) => return self.fail(SocketStatus::ErrSocketInit, e),
        };
        if let Err(e) = sock.connect(&SockAddr::from(addr)) {
            return self.fail(SocketStatus::ErrSocketConnect, e);
        }
        if let Err(e) = sock.set_nonblocking(mode.contains(Mode::NONBLOCKING)) {
            return self.fail(SocketStatus::ErrSocketInit, e);
        }

        self.address = addr;
        self.sock = Some(sock);
        self.mode = mode;
        self.status = SocketStatus::Connected;
        self.status
    }

    fn fail(&mut self, status: SocketStatus, err: io::Error) -> SocketStatus {
        debug!("Socket init failed with {:?}: {}", status, err);
        self.status = status;
        self.status
    }

    /// Take one pending connection off `listener`. Never blocks; with nothing pending, or on any
    /// failure, this handle ends up disconnected.
    pub fn accept(&mut self, listener: &SocketHandle) -> SocketStatus {
        if self.status == SocketStatus::Connected {
            self.disconnect();
        }

        let accepted = listener
            .sock
            .as_ref()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
            .and_then(|sock| sock.accept())
            .and_then(|(sock, addr)| sock.set_nonblocking(true).map(|_| (sock, addr)));

        match accepted {
            Ok((sock, addr)) => {
                if let Some(addr) = addr.as_socket_ipv4() {
                    self.address = addr;
                }
                self.sock = Some(sock);
                self.mode = Mode::CLIENT | Mode::NONBLOCKING;
                self.status = SocketStatus::Connected;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("Nothing to accept");
                self.status = SocketStatus::Disconnected;
            }
            Err(e) => {
                debug!("Accept failed: {}", e);
                self.status = SocketStatus::Disconnected;
            }
        }
        self.status
    }

    /// Read whatever is available into `buffer`.
    ///
    /// Returns the number of bytes read. `None` means nothing was read: either there was nothing
    /// to read yet on a nonblocking handle, or the connection is gone, in which case the status
    /// becomes `Disconnected`. The descriptor stays owned until `disconnect()` or drop.
    pub fn recv_from(&mut self, buffer: &mut [u8]) -> Option<usize> {
        if self.status != SocketStatus::Connected || buffer.is_empty() {
            return None;
        }

        let result = match self.sock {
            Some(ref sock) => (&*sock).read(buffer),
            None => return None,
        };

        match result {
            Ok(0) => {
                trace!("Peer closed descriptor {}", self.fd());
                self.status = SocketStatus::Disconnected;
                None
            }
            Ok(n) => Some(n),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                None
            }
            Err(e) => {
                debug!("Receive on descriptor {} failed: {}", self.fd(), e);
                self.status = SocketStatus::Disconnected;
                None
            }
        }
    }

    /// Send once. A short write still counts as success; use `send_all` for full delivery.
    pub fn send_to(&self, buffer: &[u8]) -> bool {
        self.send_some(buffer).is_some()
    }

    fn send_some(&self, buffer: &[u8]) -> Option<usize> {
        if self.status != SocketStatus::Connected {
            return None;
        }

        match self.sock {
            Some(ref sock) => (&*sock).write(buffer).ok(),
            None => None,
        }
    }

    /// Send the whole buffer, waiting for writability between partial writes.
    pub fn send_all(&self, mut buffer: &[u8]) -> bool {
        const WRITE_WAIT: Duration = Duration::from_secs(5);

        while !buffer.is_empty() {
            if self.status != SocketStatus::Connected {
                return false;
            }

            let sent = match self.sock {
                Some(ref sock) => (&*sock).write(buffer),
                None => return false,
            };

            match sent {
                Ok(0) => return false,
                Ok(n) => buffer = &buffer[n..],
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if !self.is_allow_to_write(WRITE_WAIT) {
                        return false;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    debug!("Send on descriptor {} failed: {}", self.fd(), e);
                    return false;
                }
            }
        }

        true
    }

    /// Shut down and close the descriptor. Safe to call any number of times.
    pub fn disconnect(&mut self) -> SocketStatus {
        self.status = SocketStatus::Disconnected;

        if let Some(sock) = self.sock.take() {
            // The peer may already be gone, in which case shutdown has nothing to do.
            let _ = sock.shutdown(Shutdown::Both);
        }

        self.status
    }

    /// Move the descriptor out, leaving this handle disconnected and empty.
    pub fn take(&mut self) -> SocketHandle {
        mem::replace(self, SocketHandle::default())
    }

    /// Enable keep-alive probing on the descriptor.
    pub fn set_keep_alive(&self, config: &KeepAliveConfig) -> io::Result<()> {
        let sock = match self.sock {
            Some(ref sock) => sock,
            None => return Err(ErrorKind::NotConnected.into()),
        };

        let params = TcpKeepalive::new()
            .with_time(config.idle_time())
            .with_interval(config.interval_time())
            .with_retries(config.count);
        sock.set_tcp_keepalive(&params)
    }

    pub fn is_allow_to_read(&self, timeout: Duration) -> bool {
        self.wait_for(Readiness::Read, timeout)
    }

    pub fn is_allow_to_write(&self, timeout: Duration) -> bool {
        self.wait_for(Readiness::Write, timeout)
    }

    /// True only if the handle is readable and writable within `timeout`.
    pub fn is_allow_to_rwrite(&self, timeout: Duration) -> bool {
        self.wait_for(Readiness::ReadWrite, timeout)
    }

    /// Probe with a throwaway readiness queue, so the descriptor's own registration is untouched.
    fn wait_for(&self, readiness: Readiness, timeout: Duration) -> bool {
        if self.status != SocketStatus::Connected {
            return false;
        }

        let wanted = match readiness {
            Readiness::Read => Ready::readable(),
            Readiness::Write => Ready::writable(),
            Readiness::ReadWrite => Ready::readable() | Ready::writable(),
        };

        let probe = match Poll::new() {
            Ok(probe) => probe,
            Err(e) => {
                debug!("Could not create readiness probe: {}", e);
                return false;
            }
        };
        let fd = self.fd();
        if let Err(e) = probe.register(&EventedFd(&fd), Token(0), wanted, PollOpt::level()) {
            debug!("Could not probe descriptor {}: {}", fd, e);
            return false;
        }

        let mut events = Events::with_capacity(1);
        match probe.poll(&mut events, Some(timeout)) {
            Ok(_) => events.iter().any(|event| event.readiness().contains(wanted)),
            Err(_) => false,
        }
    }

    pub fn status(&self) -> SocketStatus {
        self.status
    }

    /// The raw descriptor, or `NO_SOCKET` when the handle owns nothing.
    pub fn fd(&self) -> RawFd {
        self.sock.as_ref().map(|sock| sock.as_raw_fd()).unwrap_or(NO_SOCKET)
    }

    pub fn host(&self) -> Ipv4Addr {
        *self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Port the descriptor is actually bound to locally.
    pub fn local_port(&self) -> Option<u16> {
        self.sock
            .as_ref()
            .and_then(|sock| sock.local_addr().ok())
            .and_then(|addr| addr.as_socket())
            .map(|addr: SocketAddr| addr.port())
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Endpoint for SocketHandle {
    fn socket(&self) -> &SocketHandle {
        self
    }

    fn socket_mut(&mut self) -> &mut SocketHandle {
        self
    }
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Evented for SocketHandle {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd()).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(&self.fd()).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(&self.fd()).deregister(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn listening() -> SocketHandle {
        let mut server = SocketHandle::new();
        assert_eq!(
            server.init(LOCALHOST, 0, Mode::SERVER | Mode::BLOCKING),
            SocketStatus::Connected
        );
        server
    }

    #[test]
    fn fresh_handle_owns_nothing() {
        let handle = SocketHandle::new();
        assert_eq!(handle.status(), SocketStatus::Disconnected);
        assert_eq!(handle.fd(), NO_SOCKET);
    }

    #[test]
    fn init_without_role_is_a_type_error() {
        let mut handle = SocketHandle::new();
        assert_eq!(handle.init(LOCALHOST, 0, Mode::BLOCKING), SocketStatus::ErrSocketType);
        assert_eq!(handle.fd(), NO_SOCKET);
    }

    #[test]
    fn server_records_the_port_it_was_given() {
        let server = listening();
        assert!(server.port() > 0);
        assert_eq!(server.local_port(), Some(server.port()));
        assert_eq!(server.address(), SocketAddrV4::new(LOCALHOST, server.port()));
    }

    #[test]
    fn bind_conflict_reports_bind_error() {
        let taken = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut handle = SocketHandle::new();
        assert_eq!(
            handle.init(Ipv4Addr::new(0, 0, 0, 0), port, Mode::SERVER),
            SocketStatus::ErrSocketBind
        );
        assert_ne!(handle.status(), SocketStatus::Connected);
    }

    #[test]
    fn client_connect_failure() {
        // Grab a free port and release it so nothing is listening there.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let mut handle = SocketHandle::new();
        assert_eq!(
            handle.init(LOCALHOST, port, Mode::CLIENT | Mode::BLOCKING),
            SocketStatus::ErrSocketConnect
        );
    }

    #[test]
    fn client_talks_to_std_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut client = SocketHandle::new();
        assert_eq!(
            client.init(LOCALHOST, port, Mode::CLIENT | Mode::BLOCKING),
            SocketStatus::Connected
        );
        assert_eq!(client.port(), port);
        assert!(client.send_all(b"ping"));

        let mut buf = [0u8; 4];
        assert_eq!(client.recv_from(&mut buf), Some(4));
        assert_eq!(&buf, b"ping");
        peer.join().unwrap();
    }

    #[test]
    fn accept_is_nonblocking() {
        let mut server = SocketHandle::new();
        server.init(LOCALHOST, 0, Mode::SERVER | Mode::NONBLOCKING);

        let mut conn = SocketHandle::new();
        assert_eq!(conn.accept(&server), SocketStatus::Disconnected);

        let _client = TcpStream::connect((LOCALHOST, server.port())).unwrap();
        assert!(server.is_allow_to_read(Duration::from_secs(5)));
        assert_eq!(conn.accept(&server), SocketStatus::Connected);
        assert!(conn.mode().contains(Mode::NONBLOCKING));
        assert_eq!(conn.host(), LOCALHOST);
    }

    #[test]
    fn recv_reports_orderly_close() {
        let server = listening();
        let client = TcpStream::connect((LOCALHOST, server.port())).unwrap();
        let mut conn = SocketHandle::new();
        conn.accept(&server);

        // Nothing sent yet.
        assert_eq!(conn.recv_from(&mut [0u8; 8]), None);
        assert_eq!(conn.status(), SocketStatus::Connected);
        assert_eq!(conn.recv_from(&mut [0u8; 0]), None);

        drop(client);
        assert!(conn.is_allow_to_read(Duration::from_secs(5)));
        assert_eq!(conn.recv_from(&mut [0u8; 8]), None);
        assert_eq!(conn.status(), SocketStatus::Disconnected);
        // Closed by the peer, but still ours to release.
        assert_ne!(conn.fd(), NO_SOCKET);
        conn.disconnect();
        assert_eq!(conn.fd(), NO_SOCKET);
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let mut server = listening();
        assert_eq!(server.disconnect(), SocketStatus::Disconnected);
        assert_eq!(server.fd(), NO_SOCKET);
        assert_eq!(server.disconnect(), SocketStatus::Disconnected);
        assert!(!server.send_to(b"x"));
        assert!(!server.is_allow_to_read(Duration::from_millis(1)));
    }

    #[test]
    fn take_leaves_source_empty() {
        let mut server = listening();
        let fd = server.fd();
        let moved = server.take();
        assert_eq!(moved.fd(), fd);
        assert_eq!(moved.status(), SocketStatus::Connected);
        assert_eq!(server.fd(), NO_SOCKET);
        assert_eq!(server.status(), SocketStatus::Disconnected);
        drop(server);
        assert_eq!(moved.status(), SocketStatus::Connected);
    }

    #[test]
    fn readiness_probe_times_out() {
        let server = listening();
        let _client = TcpStream::connect((LOCALHOST, server.port())).unwrap();
        let mut conn = SocketHandle::new();
        conn.accept(&server);

        assert!(!conn.is_allow_to_read(Duration::from_millis(20)));
        assert!(conn.is_allow_to_write(Duration::from_millis(20)));
        assert!(!conn.is_allow_to_rwrite(Duration::from_millis(20)));
    }

    #[test]
    fn keep_alive_needs_a_descriptor() {
        let handle = SocketHandle::new();
        assert!(handle.set_keep_alive(&KeepAliveConfig::default()).is_err());
        let server = listening();
        assert!(server.set_keep_alive(&KeepAliveConfig::default()).is_ok());
    }
}
