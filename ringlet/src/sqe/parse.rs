use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// C representation of a socket address, owned by a request so the kernel
/// can read it after submission.
#[repr(C)]
pub(crate) union SockAddrRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SockAddrRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        std::ptr::from_ref(self).cast()
    }
}

pub(crate) fn socket_addr_to_c(addr: &SocketAddr) -> (SockAddrRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (
            SockAddrRepr {
                v4: socket_addr_v4_to_c(a),
            },
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ),
        SocketAddr::V6(a) => (
            SockAddrRepr {
                v6: socket_addr_v6_to_c(a),
            },
            size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        ),
    }
}

/// Peer address storage filled in by the kernel on accept.
pub(crate) struct PeerAddr {
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl PeerAddr {
    pub(crate) fn new() -> Self {
        Self {
            storage: unsafe { std::mem::zeroed() },
            len: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub(crate) fn to_socket_addr(&self) -> Option<SocketAddr> {
        let len = self.len as usize;
        let ptr = std::ptr::from_ref(&self.storage);

        // SAFETY: `sockaddr_storage` is large and aligned enough for every
        // family, and the length check guards the casts.
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET if len >= size_of::<libc::sockaddr_in>() => {
                let addr = unsafe { *ptr.cast::<libc::sockaddr_in>() };
                Some(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be(addr.sin_port),
                )))
            }
            libc::AF_INET6 if len >= size_of::<libc::sockaddr_in6>() => {
                let addr = unsafe { *ptr.cast::<libc::sockaddr_in6>() };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(addr.sin6_addr.s6_addr),
                    u16::from_be(addr.sin6_port),
                    addr.sin6_flowinfo,
                    addr.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

fn socket_addr_v4_to_c(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        // `s_addr` is big endian and `octets()` already is, so no swap.
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        ..unsafe { std::mem::zeroed() }
    }
}

fn socket_addr_v6_to_c(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_flowinfo: addr.flowinfo(),
        sin6_scope_id: addr.scope_id(),
    }
}
