//! Readiness backends.
//!
//! `Backend` is a closed set of strategies chosen once, at loop construction:
//! - `Epoll`: kernel-assisted, O(1) registration, wait cost proportional to ready fds (Linux).
//! - `Poll`: portable poll(2) over an interest list rebuilt on every wait.
//! - `Uring`: io_uring one-shot POLL_ADD requests, re-armed after each completion (Linux).
//!
//! All three are level-triggered and report readiness as `Interest` bits.
//! `unregister` of an unknown descriptor is a no-op everywhere. `update` of an unknown
//! descriptor is an error on the kernel-assisted strategies and an implicit register on `Poll`.

#[cfg(target_os = "linux")]
mod epoll;
mod poll;
#[cfg(target_os = "linux")]
mod uring;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
pub use epoll::{Epoll, epoll_to_interest, interest_to_epoll};
pub use poll::{Poll, interest_to_poll, poll_to_interest};
#[cfg(target_os = "linux")]
pub use uring::Uring;

use crate::error::{Error, Result};
use crate::interest::Interest;

/// One readiness report: a descriptor and the conditions it is ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readiness: Interest,
}

/// Registration and wait contract shared by every strategy.
pub trait Poller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    fn update(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Unknown descriptors are ignored.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;

    /// Block until at least one descriptor is ready or `timeout` elapses (`None` = forever).
    /// Clears `events` and fills it with the ready set in backend order; returns its length.
    /// Signal interruption is retried internally and never surfaces.
    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[cfg(target_os = "linux")]
    Epoll,
    Poll,
    #[cfg(target_os = "linux")]
    Uring,
}

impl BackendKind {
    /// Every strategy compiled into this build.
    pub const AVAILABLE: &'static [BackendKind] = &[
        #[cfg(target_os = "linux")]
        BackendKind::Epoll,
        BackendKind::Poll,
        #[cfg(target_os = "linux")]
        BackendKind::Uring,
    ];

    pub fn name(self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => "epoll",
            BackendKind::Poll => "poll",
            #[cfg(target_os = "linux")]
            BackendKind::Uring => "uring",
        }
    }
}

impl Default for BackendKind {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        BackendKind::Epoll
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        BackendKind::Poll
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BackendKind::AVAILABLE
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<_> = BackendKind::AVAILABLE.iter().map(|k| k.name()).collect();
                format!("unknown backend {s:?} (available: {})", names.join(", "))
            })
    }
}

pub enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(Epoll),
    Poll(Poll),
    #[cfg(target_os = "linux")]
    Uring(Uring),
}

impl Backend {
    pub fn new(kind: BackendKind, max_events: usize) -> Result<Backend> {
        let backend = match kind {
            #[cfg(target_os = "linux")]
            BackendKind::Epoll => Backend::Epoll(Epoll::new(max_events)?),
            BackendKind::Poll => Backend::Poll(Poll::new()),
            #[cfg(target_os = "linux")]
            BackendKind::Uring => Backend::Uring(Uring::new(max_events)?),
        };
        tracing::debug!(backend = %kind, max_events, "readiness backend created");
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => BackendKind::Epoll,
            Backend::Poll(_) => BackendKind::Poll,
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => BackendKind::Uring,
        }
    }
}

impl Poller for Backend {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.register(fd, interest),
            Backend::Poll(b) => b.register(fd, interest),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.register(fd, interest),
        }
    }

    fn update(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.update(fd, interest),
            Backend::Poll(b) => b.update(fd, interest),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.update(fd, interest),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.unregister(fd),
            Backend::Poll(b) => b.unregister(fd),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.unregister(fd),
        }
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<usize> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.wait(events, timeout),
            Backend::Poll(b) => b.wait(events, timeout),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.wait(events, timeout),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

/// Negative descriptors never reach the OS.
pub(crate) fn check_fd(op: &'static str, fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::registration(
            op,
            fd,
            io::Error::from_raw_os_error(libc::EBADF),
        ));
    }
    Ok(())
}

/// Milliseconds left until `deadline`, rounded up so a sub-millisecond remainder
/// still blocks instead of spinning. `None` maps to -1 (block forever).
pub(crate) fn remaining_ms(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            let ms = left.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Errors a wait retries instead of surfacing.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use std::os::fd::FromRawFd;

    fn pipe() -> (Handle, Handle) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = unsafe { (Handle::from_raw_fd(fds[0]), Handle::from_raw_fd(fds[1])) };
        r.set_nonblocking(true).unwrap();
        w.set_nonblocking(true).unwrap();
        (r, w)
    }

    /// io_uring may be unavailable (old kernel, seccomp); such backends are skipped.
    fn backends() -> Vec<Backend> {
        BackendKind::AVAILABLE
            .iter()
            .filter_map(|&kind| Backend::new(kind, 16).ok())
            .collect()
    }

    #[test]
    fn readable_pipe_is_reported() {
        for mut backend in backends() {
            let (r, w) = pipe();
            backend.register(r.fd(), Interest::READABLE).unwrap();
            w.write(b"abc").unwrap();

            let mut events = Vec::new();
            let n = backend.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(n, 1, "{:?}", backend.kind());
            assert_eq!(events[0].fd, r.fd());
            assert!(events[0].readiness.is_readable());
            backend.unregister(r.fd()).unwrap();
        }
    }

    #[test]
    fn wait_times_out_with_nothing_ready() {
        for mut backend in backends() {
            let (r, _w) = pipe();
            backend.register(r.fd(), Interest::READABLE).unwrap();
            let mut events = vec![ReadyEvent {
                fd: 99,
                readiness: Interest::ALL,
            }];
            let n = backend.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
            assert_eq!(n, 0, "{:?}", backend.kind());
            assert!(events.is_empty());
        }
    }

    #[test]
    fn level_triggered_until_drained() {
        for mut backend in backends() {
            let (r, w) = pipe();
            backend.register(r.fd(), Interest::READABLE).unwrap();
            w.write(b"x").unwrap();

            let mut events = Vec::new();
            for _ in 0..2 {
                let n = backend.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
                assert_eq!(n, 1, "{:?}", backend.kind());
            }
            r.read(&mut [0u8; 1]).unwrap();
            let n = backend.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
            assert_eq!(n, 0, "{:?}", backend.kind());
        }
    }

    #[test]
    fn update_changes_reported_interest() {
        for mut backend in backends() {
            let (r, w) = pipe();
            backend.register(w.fd(), Interest::NONE).unwrap();
            let mut events = Vec::new();
            let n = backend.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
            assert_eq!(n, 0, "{:?}", backend.kind());

            backend.update(w.fd(), Interest::WRITABLE).unwrap();
            let n = backend.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(n, 1, "{:?}", backend.kind());
            assert!(events[0].readiness.is_writable());
            drop(r);
        }
    }

    #[test]
    fn unregister_unknown_is_noop() {
        for mut backend in backends() {
            let (r, _w) = pipe();
            backend.unregister(r.fd()).unwrap();
            backend.register(r.fd(), Interest::READABLE).unwrap();
            backend.unregister(r.fd()).unwrap();
            backend.unregister(r.fd()).unwrap();
        }
    }

    #[test]
    fn unregistered_descriptor_is_not_reported() {
        for mut backend in backends() {
            let (r, w) = pipe();
            backend.register(r.fd(), Interest::READABLE).unwrap();
            backend.unregister(r.fd()).unwrap();
            w.write(b"x").unwrap();
            let mut events = Vec::new();
            let n = backend.wait(&mut events, Some(Duration::from_millis(20))).unwrap();
            assert_eq!(n, 0, "{:?}", backend.kind());
        }
    }

    #[test]
    fn negative_descriptor_is_rejected() {
        for mut backend in backends() {
            let err = backend.register(-1, Interest::READABLE).unwrap_err();
            assert!(matches!(err, Error::Registration { fd: -1, .. }));
            assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        }
    }

    #[test]
    fn kernel_backends_require_registration_before_update() {
        for mut backend in backends() {
            let (r, _w) = pipe();
            let result = backend.update(r.fd(), Interest::READABLE);
            match backend.kind() {
                BackendKind::Poll => assert!(result.is_ok()),
                #[cfg(target_os = "linux")]
                _ => assert_eq!(result.unwrap_err().raw_os_error(), Some(libc::ENOENT)),
            }
        }
    }

    #[test]
    fn backend_kind_parses_names() {
        for &kind in BackendKind::AVAILABLE {
            assert_eq!(kind.name().parse::<BackendKind>().unwrap(), kind);
            assert_eq!(kind.to_string().to_uppercase().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("select".parse::<BackendKind>().is_err());
    }

    #[test]
    fn remaining_ms_rounds_up() {
        assert_eq!(remaining_ms(None), -1);
        let deadline = Instant::now() + Duration::from_micros(10);
        assert!(remaining_ms(Some(deadline)) <= 1);
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(remaining_ms(Some(past)), 0);
    }
}
