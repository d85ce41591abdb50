//! Raw syscall plumbing shared by the rest of the crate.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// A `sockaddr` of either address family, in a form the kernel accepts.
///
/// `std`'s socket address types no longer guarantee a C-compatible layout,
/// so the raw structures are built by hand.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Converts a `SocketAddr` into its system representation plus length.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            let len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            (SocketAddrCRepr { v4: sockaddr_in }, len)
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_flowinfo: addr.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_scope_id: addr.scope_id(),
            };
            let len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            (SocketAddrCRepr { v6: sockaddr_in6 }, len)
        }
    }
}

/// Converts a populated `sockaddr_storage` back into a `SocketAddr`.
///
/// # Safety
///
/// `storage` must point to a structure the kernel filled in for an AF_INET
/// or AF_INET6 socket.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:6543".parse().unwrap();
        let (raw, _len) = socket_addr(&addr);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                mem::size_of::<libc::sockaddr_in>(),
            );
        }
        let back = unsafe { to_socket_addr(&storage) }.unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn round_trip_v6() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let (raw, _len) = socket_addr(&addr);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                mem::size_of::<libc::sockaddr_in6>(),
            );
        }
        let back = unsafe { to_socket_addr(&storage) }.unwrap();
        assert_eq!(back, addr);
    }
}
