//! Non-blocking TCP socket plumbing.
//!
//! Thin wrappers over the socket syscalls: everything here is a direct
//! kernel operation; policy (retries, buffering, state) lives in the
//! components that own the sockets.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::{socket_addr, to_socket_addr};

/// An owned, non-blocking TCP socket descriptor.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec stream socket for the address
    /// family of `addr`.
    pub(crate) fn new_nonblocking(addr: SocketAddr) -> io::Result<Socket> {
        new_nonblocking(addr).map(|fd| Socket { fd })
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind_address(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw, len) = socket_addr(&addr);
        syscall!(bind(self.fd(), raw.as_ptr(), len)).map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection, non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let addr = unsafe { to_socket_addr(&storage) }?;
        Ok((fd, addr))
    }

    /// Closes the write side, leaving the read side open (half-close).
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let value: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Creates a non-blocking, close-on-exec TCP socket for `addr`'s family.
pub(crate) fn new_nonblocking(addr: SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Initiates a connection; a pending non-blocking connect reports
/// `EINPROGRESS` through the returned error.
pub(crate) fn connect(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr(&addr);
    syscall!(connect(fd, raw.as_ptr(), len)).map(|_| ())
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len())).map(|n| n as usize)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

/// Retrieves and clears the pending error on a socket.
pub(crate) fn socket_error(fd: RawFd) -> libc::c_int {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ));
    match res {
        Ok(_) => err,
        Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
    }
}

/// A transient loopback connect can land on its own ephemeral port.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_connect() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new_nonblocking(addr).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind_address(addr).unwrap();
        listener.listen().unwrap();
        let bound = local_addr(listener.fd()).unwrap();
        assert_ne!(bound.port(), 0);

        // Nothing pending yet.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let client = new_nonblocking(bound).unwrap();
        match connect(client.as_raw_fd(), bound) {
            Ok(()) => {}
            Err(err) => assert_eq!(err.raw_os_error(), Some(libc::EINPROGRESS)),
        }

        // Loopback accepts promptly; poll the listener briefly.
        let mut pfd = libc::pollfd {
            fd: listener.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        syscall!(poll(&mut pfd, 1, 1000)).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(peer, local_addr(client.as_raw_fd()).unwrap());
        assert_eq!(socket_error(accepted.as_raw_fd()), 0);
    }
}
