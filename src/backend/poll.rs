use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Poller, ReadyEvent, check_fd, deadline_after, is_transient, remaining_ms};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::metrics;

pub fn interest_to_poll(interest: Interest) -> libc::c_short {
    let mut bits: libc::c_short = 0;
    if interest.is_readable() {
        bits |= libc::POLLIN;
    }
    if interest.is_writable() {
        bits |= libc::POLLOUT;
    }
    if interest.is_error() {
        bits |= libc::POLLERR;
    }
    if interest.is_hangup() {
        bits |= libc::POLLHUP;
    }
    bits
}

/// `POLLNVAL` (descriptor not open) is reported as an error condition.
pub fn poll_to_interest(bits: libc::c_short) -> Interest {
    let mut ready = Interest::NONE;
    if bits & libc::POLLIN != 0 {
        ready |= Interest::READABLE;
    }
    if bits & libc::POLLOUT != 0 {
        ready |= Interest::WRITABLE;
    }
    if bits & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    if bits & libc::POLLHUP != 0 {
        ready |= Interest::HANGUP;
    }
    ready
}

/// poll(2) strategy. The pollfd list is rebuilt from the interest map on every wait,
/// ordered by descriptor.
#[derive(Default)]
pub struct Poll {
    interests: BTreeMap<RawFd, Interest>,
    pollfds: Vec<libc::pollfd>,
}

impl Poll {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }

    fn rebuild(&mut self) {
        self.pollfds.clear();
        self.pollfds
            .extend(self.interests.iter().map(|(&fd, &interest)| libc::pollfd {
                fd,
                events: interest_to_poll(interest),
                revents: 0,
            }));
    }
}

impl Poller for Poll {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("poll register", fd)?;
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("poll update", fd)?;
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<usize> {
        events.clear();
        self.rebuild();
        let deadline = deadline_after(timeout);
        loop {
            let rc = unsafe {
                libc::poll(
                    self.pollfds.as_mut_ptr(),
                    self.pollfds.len() as libc::nfds_t,
                    remaining_ms(deadline),
                )
            };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                metrics::inc_wait_retries();
                continue;
            }
            return Err(Error::Wait(err));
        }

        events.extend(
            self.pollfds
                .iter()
                .filter(|p| p.revents != 0)
                .map(|p| ReadyEvent {
                    fd: p.fd,
                    readiness: poll_to_interest(p.revents),
                }),
        );
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_round_trips_every_set() {
        for bits in 0..=Interest::ALL.bits() {
            let interest = Interest::from_bits(bits);
            assert_eq!(poll_to_interest(interest_to_poll(interest)), interest);
        }
    }

    #[test]
    fn nval_is_an_error() {
        assert_eq!(poll_to_interest(libc::POLLNVAL), Interest::ERROR);
    }

    #[test]
    fn register_same_fd_replaces_interest() {
        let mut poll = Poll::new();
        poll.register(3, Interest::READABLE).unwrap();
        poll.register(3, Interest::WRITABLE).unwrap();
        assert_eq!(poll.len(), 1);
        poll.rebuild();
        assert_eq!(poll.pollfds.len(), 1);
        assert_eq!(poll.pollfds[0].events, libc::POLLOUT);
    }

    #[test]
    fn interest_list_is_ordered_by_descriptor() {
        let mut poll = Poll::new();
        for fd in [9, 4, 7] {
            poll.register(fd, Interest::READABLE).unwrap();
        }
        poll.rebuild();
        let fds: Vec<_> = poll.pollfds.iter().map(|p| p.fd).collect();
        assert_eq!(fds, vec![4, 7, 9]);
        poll.unregister(7).unwrap();
        poll.unregister(7).unwrap();
        assert_eq!(poll.len(), 2);
    }
}
