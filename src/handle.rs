//! Owned OS descriptor with explicit shared ownership.
//!
//! A `Handle` is either empty or one of N owners of a descriptor. Cloning adds an owner,
//! dropping or `close`-ing removes one, and the descriptor is released exactly once when
//! the owner count reaches zero. Moving (or `take`) transfers ownership without touching
//! the count and leaves the source empty.

use std::ffi::CString;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Descriptor value reported by an empty handle.
pub const EMPTY_FD: RawFd = -1;

#[derive(Clone, Default)]
pub struct Handle {
    // The Arc strong count is the live-owner count; OwnedFd closes on the last drop.
    shared: Option<Arc<OwnedFd>>,
}

impl Handle {
    pub const fn empty() -> Self {
        Self { shared: None }
    }

    /// Open `path` with `open(2)` flags. `O_CLOEXEC` is always added.
    pub fn open(path: impl AsRef<Path>, flags: libc::c_int) -> Result<Handle> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| {
            Error::Acquisition {
                op: "open",
                source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
            }
        })?;
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Error::acquisition("open"));
        }
        Ok(unsafe { Handle::from_raw_fd(fd) })
    }

    /// Raw descriptor, or `EMPTY_FD` when empty.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.shared.as_ref().map_or(EMPTY_FD, |fd| fd.as_raw_fd())
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Number of live handles sharing this descriptor (0 when empty).
    pub fn owner_count(&self) -> usize {
        self.shared.as_ref().map_or(0, Arc::strong_count)
    }

    /// Give up this owner. The descriptor is released only if this was the last one.
    /// Safe to call repeatedly; closing an empty handle does nothing.
    pub fn close(&mut self) {
        self.shared = None;
    }

    /// Move ownership out, leaving `self` empty.
    pub fn take(&mut self) -> Handle {
        std::mem::take(self)
    }

    /// Recover exclusive ownership. Fails (returning the handle) while other owners exist.
    pub fn try_into_owned(self) -> std::result::Result<OwnedFd, Handle> {
        match self.shared {
            None => Err(Handle::empty()),
            Some(shared) => Arc::try_unwrap(shared).map_err(|shared| Handle {
                shared: Some(shared),
            }),
        }
    }

    pub fn borrow(&self) -> Option<BorrowedFd<'_>> {
        self.shared.as_deref().map(AsFd::as_fd)
    }

    pub(crate) fn require(&self) -> io::Result<RawFd> {
        match &self.shared {
            Some(fd) => Ok(fd.as_raw_fd()),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// One `read(2)`. `Ok(0)` means end of stream / peer closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.require()?;
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// One `write(2)`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.require()?;
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Read until `buf` is full or the peer reports end of stream.
    /// Returns the number of bytes read; short only on end of stream.
    pub fn read_all(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Write all of `buf` unless the descriptor stops accepting bytes.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.write(&buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.require()?;
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl From<OwnedFd> for Handle {
    fn from(fd: OwnedFd) -> Self {
        Self {
            shared: Some(Arc::new(fd)),
        }
    }
}

impl FromRawFd for Handle {
    /// Negative descriptors yield an empty handle.
    ///
    /// # Safety
    /// A non-negative `fd` must be open and not owned by anything else.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        if fd < 0 {
            return Handle::empty();
        }
        Handle::from(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.fd() == other.fd()
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fd().hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.fd())
            .field("owners", &self.owner_count())
            .finish()
    }
}
