//! Non-blocking sockets on top of `Handle`.
//!
//! System calls go through a `socket2::SockRef` borrowed from the handle, so the handle
//! stays the only owner of the descriptor. Per-call failures are plain `io::Error`s;
//! only socket creation reports through the crate `Error`.

use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::fd::OwnedFd;

use socket2::{SockRef, Type};

use crate::address::{Family, SocketAddress};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::watchable::Watchable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
    SeqPacket,
}

impl SocketType {
    fn as_type(self) -> Type {
        match self {
            SocketType::Stream => Type::STREAM,
            SocketType::Datagram => Type::DGRAM,
            SocketType::SeqPacket => Type::SEQPACKET,
        }
    }
}

fn invalid_input(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// Copies share the descriptor; it closes when the last copy (or the loop's entry) drops.
#[derive(Debug, Clone)]
pub struct Socket {
    handle: Handle,
    family: Family,
    listening: bool,
}

impl Socket {
    /// New non-blocking, close-on-exec socket.
    pub fn new(family: Family, ty: SocketType) -> Result<Socket> {
        let socket = socket2::Socket::new(family.domain(), ty.as_type(), None).map_err(|source| {
            Error::Acquisition {
                op: "socket",
                source,
            }
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| Error::Acquisition {
                op: "fcntl(O_NONBLOCK)",
                source,
            })?;
        Ok(Socket::from_owned(OwnedFd::from(socket), family))
    }

    /// Connected pair of Unix stream sockets, both non-blocking.
    pub fn pair() -> Result<(Socket, Socket)> {
        let (a, b) = socket2::Socket::pair(socket2::Domain::UNIX, Type::STREAM, None).map_err(
            |source| Error::Acquisition {
                op: "socketpair",
                source,
            },
        )?;
        let wrap = |s: socket2::Socket| -> Result<Socket> {
            s.set_nonblocking(true).map_err(|source| Error::Acquisition {
                op: "fcntl(O_NONBLOCK)",
                source,
            })?;
            Ok(Socket::from_owned(OwnedFd::from(s), Family::Unix))
        };
        Ok((wrap(a)?, wrap(b)?))
    }

    fn from_owned(fd: OwnedFd, family: Family) -> Socket {
        Socket {
            handle: Handle::from(fd),
            family,
            listening: false,
        }
    }

    fn with_sock<T>(&self, f: impl FnOnce(SockRef<'_>) -> io::Result<T>) -> io::Result<T> {
        let fd = self
            .handle
            .borrow()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        f(SockRef::from(&fd))
    }

    fn native(&self, addr: &SocketAddress) -> io::Result<socket2::SockAddr> {
        if addr.family() != self.family {
            return Err(invalid_input(crate::address::AddressError::FamilyMismatch {
                expected: self.family,
                found: addr.family(),
            }));
        }
        addr.to_sock_addr().map_err(invalid_input)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn bind(&self, addr: &SocketAddress) -> io::Result<()> {
        let native = self.native(addr)?;
        self.with_sock(|s| s.bind(&native))
    }

    /// SO_REUSEADDR (inet families), bind, listen.
    pub fn listen(&mut self, addr: &SocketAddress, backlog: i32) -> io::Result<()> {
        let native = self.native(addr)?;
        let family = self.family;
        self.with_sock(|s| {
            if family != Family::Unix {
                s.set_reuse_address(true)?;
            }
            s.bind(&native)?;
            s.listen(backlog)
        })?;
        self.listening = true;
        tracing::debug!(fd = self.handle.fd(), %addr, backlog, "listening");
        Ok(())
    }

    /// `Ok(true)` when connected immediately, `Ok(false)` while the connect is in progress;
    /// the socket turns writable once it completes.
    pub fn connect(&self, addr: &SocketAddress) -> io::Result<bool> {
        let native = self.native(addr)?;
        match self.with_sock(|s| s.connect(&native)) {
            Ok(()) => Ok(true),
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Accepted sockets are non-blocking.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddress)> {
        let (socket, peer) = self.with_sock(|s| s.accept())?;
        socket.set_nonblocking(true)?;
        let peer = SocketAddress::from_sock_addr(&peer).map_err(invalid_input)?;
        Ok((Socket::from_owned(OwnedFd::from(socket), self.family), peer))
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.with_sock(|s| s.shutdown(how))
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.with_sock(|s| (&*s).write(buf))
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_sock(|s| (&*s).read(buf))
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddress) -> io::Result<usize> {
        let native = self.native(addr)?;
        self.with_sock(|s| s.send_to(buf, &native))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddress)> {
        // SAFETY: recv_from only writes initialized bytes into the buffer.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, from) = self.with_sock(|s| s.recv_from(uninit))?;
        let from = SocketAddress::from_sock_addr(&from).map_err(invalid_input)?;
        Ok((n, from))
    }

    pub fn local_address(&self) -> io::Result<SocketAddress> {
        let addr = self.with_sock(|s| s.local_addr())?;
        SocketAddress::from_sock_addr(&addr).map_err(invalid_input)
    }

    pub fn remote_address(&self) -> io::Result<SocketAddress> {
        let addr = self.with_sock(|s| s.peer_addr())?;
        SocketAddress::from_sock_addr(&addr).map_err(invalid_input)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.with_sock(|s| s.set_nonblocking(nonblocking))
    }

    /// TCP_NODELAY; inet stream sockets only.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.with_sock(|s| s.set_nodelay(nodelay))
    }

    /// Pending socket error (SO_ERROR), e.g. the outcome of a non-blocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.with_sock(|s| s.take_error())
    }

    /// Drop this copy's ownership; other copies keep the descriptor open.
    pub fn close(&mut self) {
        self.handle.close();
        self.listening = false;
    }
}

impl Watchable for Socket {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_moves_bytes_both_ways() {
        let (a, b) = Socket::pair().unwrap();
        assert_eq!(a.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        let err = a.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn family_mismatch_is_invalid_input() {
        let sock = Socket::new(Family::Ipv4, SocketType::Stream).unwrap();
        let addr: SocketAddress = "[::1]:1".parse().unwrap();
        let err = sock.bind(&addr).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn closed_socket_fails_with_ebadf() {
        let mut sock = Socket::new(Family::Ipv4, SocketType::Datagram).unwrap();
        sock.close();
        assert!(!sock.handle().is_valid());
        let err = sock.send(b"x").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn listen_on_ephemeral_port_reports_bound_address() {
        let mut sock = Socket::new(Family::Ipv4, SocketType::Stream).unwrap();
        let addr: SocketAddress = "127.0.0.1:0".parse().unwrap();
        sock.listen(&addr, 16).unwrap();
        assert!(sock.is_listening());
        let local = sock.local_address().unwrap();
        assert_ne!(local.port(), Some(0));
        assert_eq!(local.family(), Family::Ipv4);
    }

    #[test]
    fn datagram_recv_from_reports_sender() {
        let any: SocketAddress = "127.0.0.1:0".parse().unwrap();
        let rx = Socket::new(Family::Ipv4, SocketType::Datagram).unwrap();
        rx.bind(&any).unwrap();
        let tx = Socket::new(Family::Ipv4, SocketType::Datagram).unwrap();
        tx.bind(&any).unwrap();

        tx.send_to(b"hello", &rx.local_address().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = loop {
            match rx.recv_from(&mut buf) {
                Ok(r) => break r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("recv_from: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, tx.local_address().unwrap());
    }
}
