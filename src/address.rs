//! Socket addresses as a checked tagged union.
//!
//! `serialize` produces the native `sockaddr_*` bytes for the variant; `deserialize`
//! accepts exactly that many bytes back. Family-specific accessors check the tag.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use socket2::{Domain, SockAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Ipv4,
    Ipv6,
    Unix,
}

impl Family {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
            Family::Unix => libc::AF_UNIX,
        }
    }

    pub fn from_raw(family: libc::c_int) -> Option<Self> {
        match family {
            libc::AF_INET => Some(Family::Ipv4),
            libc::AF_INET6 => Some(Family::Ipv6),
            libc::AF_UNIX => Some(Family::Unix),
            _ => None,
        }
    }

    pub fn domain(self) -> Domain {
        match self {
            Family::Ipv4 => Domain::IPV4,
            Family::Ipv6 => Domain::IPV6,
            Family::Unix => Domain::UNIX,
        }
    }

    /// Byte length of this family's native address structure.
    pub fn native_size(self) -> usize {
        match self {
            Family::Ipv4 => mem::size_of::<libc::sockaddr_in>(),
            Family::Ipv6 => mem::size_of::<libc::sockaddr_in6>(),
            Family::Unix => mem::size_of::<libc::sockaddr_un>(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
            Family::Unix => "unix",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    FamilyMismatch { expected: Family, found: Family },
    UnknownFamily(libc::c_int),
    InvalidLength { family: Family, expected: usize, found: usize },
    /// Unix path does not fit in `sun_path` with its terminating NUL.
    PathTooLong(usize),
    Parse(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::FamilyMismatch { expected, found } => {
                write!(f, "expected {expected} address, found {found}")
            }
            AddressError::UnknownFamily(raw) => write!(f, "unknown address family {raw}"),
            AddressError::InvalidLength {
                family,
                expected,
                found,
            } => write!(f, "{family} address needs {expected} bytes, got {found}"),
            AddressError::PathTooLong(len) => write!(f, "unix socket path too long ({len} bytes)"),
            AddressError::Parse(input) => write!(f, "invalid socket address {input:?}"),
        }
    }
}

impl std::error::Error for AddressError {}

fn sun_path_capacity() -> usize {
    // SAFETY: sockaddr_un is plain old data.
    let raw: libc::sockaddr_un = unsafe { mem::zeroed() };
    raw.sun_path.len()
}

fn struct_bytes<T>(raw: &T) -> Vec<u8> {
    // SAFETY: only called with padding-free libc sockaddr structs that were zeroed first.
    unsafe { std::slice::from_raw_parts((raw as *const T).cast::<u8>(), mem::size_of::<T>()) }
        .to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketAddress {
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Unix(PathBuf),
}

impl SocketAddress {
    pub fn unix(path: impl Into<PathBuf>) -> Result<Self, AddressError> {
        let path = path.into();
        let len = path.as_os_str().len();
        if len >= sun_path_capacity() {
            return Err(AddressError::PathTooLong(len));
        }
        Ok(SocketAddress::Unix(path))
    }

    pub fn family(&self) -> Family {
        match self {
            SocketAddress::Ipv4(_) => Family::Ipv4,
            SocketAddress::Ipv6(_) => Family::Ipv6,
            SocketAddress::Unix(_) => Family::Unix,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            SocketAddress::Ipv4(a) => Some(a.port()),
            SocketAddress::Ipv6(a) => Some(a.port()),
            SocketAddress::Unix(_) => None,
        }
    }

    pub fn as_ipv4(&self) -> Result<&SocketAddrV4, AddressError> {
        match self {
            SocketAddress::Ipv4(a) => Ok(a),
            other => Err(other.mismatch(Family::Ipv4)),
        }
    }

    pub fn as_ipv6(&self) -> Result<&SocketAddrV6, AddressError> {
        match self {
            SocketAddress::Ipv6(a) => Ok(a),
            other => Err(other.mismatch(Family::Ipv6)),
        }
    }

    pub fn as_unix(&self) -> Result<&Path, AddressError> {
        match self {
            SocketAddress::Unix(p) => Ok(p),
            other => Err(other.mismatch(Family::Unix)),
        }
    }

    fn mismatch(&self, expected: Family) -> AddressError {
        AddressError::FamilyMismatch {
            expected,
            found: self.family(),
        }
    }

    /// Size of the native address structure for this variant.
    pub fn size(&self) -> usize {
        self.family().native_size()
    }

    /// Native `sockaddr_in` / `sockaddr_in6` / `sockaddr_un` bytes, `size()` long.
    pub fn serialize(&self) -> Result<Vec<u8>, AddressError> {
        match self {
            SocketAddress::Ipv4(a) => {
                // SAFETY: all-zero is a valid sockaddr_in.
                let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
                raw.sin_family = libc::AF_INET as libc::sa_family_t;
                raw.sin_port = a.port().to_be();
                raw.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
                Ok(struct_bytes(&raw))
            }
            SocketAddress::Ipv6(a) => {
                // SAFETY: all-zero is a valid sockaddr_in6.
                let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                raw.sin6_port = a.port().to_be();
                raw.sin6_flowinfo = a.flowinfo().to_be();
                raw.sin6_addr.s6_addr = a.ip().octets();
                raw.sin6_scope_id = a.scope_id();
                Ok(struct_bytes(&raw))
            }
            SocketAddress::Unix(path) => {
                use std::os::unix::ffi::OsStrExt;

                // SAFETY: all-zero is a valid sockaddr_un.
                let mut raw: libc::sockaddr_un = unsafe { mem::zeroed() };
                raw.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let bytes = path.as_os_str().as_bytes();
                if bytes.len() >= raw.sun_path.len() {
                    return Err(AddressError::PathTooLong(bytes.len()));
                }
                for (dst, &src) in raw.sun_path.iter_mut().zip(bytes) {
                    *dst = src as libc::c_char;
                }
                Ok(struct_bytes(&raw))
            }
        }
    }

    /// Inverse of `serialize`. The family comes from the bytes themselves.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, AddressError> {
        // SAFETY: all-zero is a valid sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let capacity = mem::size_of::<libc::sockaddr_storage>();
        if bytes.len() > capacity || bytes.len() < mem::size_of::<libc::sa_family_t>() {
            return Err(AddressError::Parse(format!("{} address bytes", bytes.len())));
        }
        // SAFETY: bytes.len() <= size_of::<sockaddr_storage>().
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<u8>(),
                bytes.len(),
            );
        }
        let raw_family = storage.ss_family as libc::c_int;
        let family = Family::from_raw(raw_family).ok_or(AddressError::UnknownFamily(raw_family))?;
        if bytes.len() != family.native_size() {
            return Err(AddressError::InvalidLength {
                family,
                expected: family.native_size(),
                found: bytes.len(),
            });
        }

        let storage_ptr = &storage as *const libc::sockaddr_storage;
        // SAFETY: the family tag selects the struct; storage is large enough and aligned for all.
        Ok(match family {
            Family::Ipv4 => {
                let raw = unsafe { &*storage_ptr.cast::<libc::sockaddr_in>() };
                SocketAddress::Ipv4(SocketAddrV4::new(
                    Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes()),
                    u16::from_be(raw.sin_port),
                ))
            }
            Family::Ipv6 => {
                let raw = unsafe { &*storage_ptr.cast::<libc::sockaddr_in6>() };
                SocketAddress::Ipv6(SocketAddrV6::new(
                    Ipv6Addr::from(raw.sin6_addr.s6_addr),
                    u16::from_be(raw.sin6_port),
                    u32::from_be(raw.sin6_flowinfo),
                    raw.sin6_scope_id,
                ))
            }
            Family::Unix => {
                use std::os::unix::ffi::OsStrExt;

                let raw = unsafe { &*storage_ptr.cast::<libc::sockaddr_un>() };
                let path: Vec<u8> = raw
                    .sun_path
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                SocketAddress::Unix(PathBuf::from(std::ffi::OsStr::from_bytes(&path)))
            }
        })
    }

    pub(crate) fn to_sock_addr(&self) -> Result<SockAddr, AddressError> {
        match self {
            SocketAddress::Ipv4(a) => Ok(SockAddr::from(*a)),
            SocketAddress::Ipv6(a) => Ok(SockAddr::from(*a)),
            SocketAddress::Unix(path) => SockAddr::unix(path)
                .map_err(|_| AddressError::PathTooLong(path.as_os_str().len())),
        }
    }

    /// Unnamed Unix peers (unbound clients) come back as an empty path.
    pub(crate) fn from_sock_addr(addr: &SockAddr) -> Result<Self, AddressError> {
        if let Some(inet) = addr.as_socket() {
            return Ok(inet.into());
        }
        if addr.is_unix() {
            return Ok(SocketAddress::Unix(
                addr.as_pathname().map(Path::to_path_buf).unwrap_or_default(),
            ));
        }
        Err(AddressError::UnknownFamily(addr.family() as libc::c_int))
    }
}

impl From<SocketAddrV4> for SocketAddress {
    fn from(a: SocketAddrV4) -> Self {
        SocketAddress::Ipv4(a)
    }
}

impl From<SocketAddrV6> for SocketAddress {
    fn from(a: SocketAddrV6) -> Self {
        SocketAddress::Ipv6(a)
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(a: SocketAddr) -> Self {
        match a {
            SocketAddr::V4(a) => SocketAddress::Ipv4(a),
            SocketAddr::V6(a) => SocketAddress::Ipv6(a),
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Ipv4(a) => write!(f, "{a}"),
            SocketAddress::Ipv6(a) => write!(f, "{a}"),
            SocketAddress::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// `a.b.c.d:port`, `[v6]:port`, or a filesystem path (absolute or `./`-relative).
impl FromStr for SocketAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') || s.starts_with('.') {
            return SocketAddress::unix(s);
        }
        s.parse::<SocketAddr>()
            .map(Into::into)
            .map_err(|_| AddressError::Parse(s.to_string()))
    }
}
