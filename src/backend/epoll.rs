use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::{Poller, ReadyEvent, check_fd, deadline_after, is_transient, remaining_ms};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::metrics;

pub fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    if interest.is_error() {
        bits |= libc::EPOLLERR as u32;
    }
    if interest.is_hangup() {
        bits |= (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
    }
    bits
}

pub fn epoll_to_interest(bits: u32) -> Interest {
    let mut ready = Interest::NONE;
    if bits & libc::EPOLLIN as u32 != 0 {
        ready |= Interest::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        ready |= Interest::WRITABLE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        ready |= Interest::ERROR;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        ready |= Interest::HANGUP;
    }
    ready
}

/// Level-triggered epoll instance. The descriptor itself rides in the event payload.
pub struct Epoll {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new(max_events: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::acquisition("epoll_create1"));
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for Epoll {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("EPOLL_CTL_ADD", fd)?;
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
            .map_err(|e| Error::registration("EPOLL_CTL_ADD", fd, e))
    }

    fn update(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("EPOLL_CTL_MOD", fd)?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
            .map_err(|e| Error::registration("EPOLL_CTL_MOD", fd, e))
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if fd < 0 {
            return Ok(());
        }
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Not registered, or already closed by the time we got here.
            if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                tracing::trace!(fd, error = %err, "EPOLL_CTL_DEL on unwatched fd ignored");
                return Ok(());
            }
            return Err(Error::registration("EPOLL_CTL_DEL", fd, err));
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<usize> {
        events.clear();
        let deadline = deadline_after(timeout);
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    remaining_ms(deadline),
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                metrics::inc_wait_retries();
                continue;
            }
            return Err(Error::Wait(err));
        };

        for ev in &self.events[..n] {
            // Copy out of the (possibly packed) kernel struct before use.
            let bits = ev.events;
            let data = ev.u64;
            events.push(ReadyEvent {
                fd: data as RawFd,
                readiness: epoll_to_interest(bits),
            });
        }
        Ok(n)
    }
}
