//! io_uring readiness strategy.
//!
//! Each watched descriptor has one in-flight one-shot POLL_ADD. A completion is reported
//! and the request is re-armed right away, so a descriptor that stays ready completes
//! again on the next wait (level-triggered, like epoll and poll).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use io_uring::{IoUring, opcode, squeue::Entry, types};

use super::{Poller, ReadyEvent, check_fd, interest_to_poll, is_transient, poll_to_interest};
use crate::config::{URING_ENTRIES, URING_MAX_ENTRIES};
use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::metrics;

/// user_data of POLL_REMOVE requests; their completions carry no readiness.
const CANCEL_USER_DATA: u64 = u64::MAX;

/// Encode request generation + descriptor into io_uring user_data.
fn encode_user_data(generation: u32, fd: RawFd) -> u64 {
    ((generation as u64) << 32) | fd as u32 as u64
}

fn decode_user_data(user_data: u64) -> (u32, RawFd) {
    ((user_data >> 32) as u32, user_data as u32 as RawFd)
}

struct Arm {
    interest: Interest,
    generation: u32,
    /// False after a failed poll request; cleared by the next `update`.
    armed: bool,
}

impl Arm {
    fn user_data(&self, fd: RawFd) -> u64 {
        encode_user_data(self.generation, fd)
    }
}

/// Push an SQE, flushing the submission queue if full.
fn push_sqe(ring: &mut IoUring, sqe: &Entry) -> io::Result<()> {
    loop {
        // POLL_ADD and POLL_REMOVE reference no user memory.
        let result = unsafe { ring.submission().push(sqe) };
        match result {
            Ok(()) => return Ok(()),
            Err(_) => {
                // SQ full, flush pending submissions to kernel and retry
                ring.submit()?;
            }
        }
    }
}

fn poll_add(fd: RawFd, arm: &Arm) -> Entry {
    opcode::PollAdd::new(types::Fd(fd), interest_to_poll(arm.interest) as u16 as u32)
        .build()
        .user_data(arm.user_data(fd))
}

fn poll_remove(user_data: u64) -> Entry {
    opcode::PollRemove::new(user_data)
        .build()
        .user_data(CANCEL_USER_DATA)
}

/// Queue depth for a wait that reports up to `max_events` readiness changes.
fn ring_entries(max_events: usize) -> u32 {
    let wanted = u32::try_from(max_events).unwrap_or(u32::MAX);
    wanted
        .clamp(URING_ENTRIES, URING_MAX_ENTRIES)
        .next_power_of_two()
}

pub struct Uring {
    ring: IoUring,
    armed: HashMap<RawFd, Arm>,
    next_generation: u32,
    completions: Vec<(u64, i32)>,
}

impl Uring {
    pub fn new(max_events: usize) -> Result<Self> {
        let entries = ring_entries(max_events);
        let ring = IoUring::new(entries).map_err(|source| Error::Acquisition {
            op: "io_uring_setup",
            source,
        })?;
        if !ring.params().is_feature_ext_arg() {
            return Err(Error::Acquisition {
                op: "io_uring_setup",
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "kernel lacks IORING_FEAT_EXT_ARG (timed waits)",
                ),
            });
        }
        Ok(Self {
            ring,
            armed: HashMap::new(),
            next_generation: 0,
            completions: Vec::with_capacity(entries as usize),
        })
    }

    fn generation(&mut self) -> u32 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }

    fn submit_wait(&mut self, deadline: Option<Instant>) -> io::Result<bool> {
        let result = match deadline {
            None => self.ring.submit_and_wait(1),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                let ts = types::Timespec::new()
                    .sec(left.as_secs())
                    .nsec(left.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
        };
        match result {
            Ok(_) => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(true),
            // Completion queue overflowed; drain it before waiting again.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn reap(&mut self, events: &mut Vec<ReadyEvent>) -> io::Result<()> {
        self.completions.clear();
        self.completions.extend(
            self.ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result())),
        );

        for i in 0..self.completions.len() {
            let (user_data, result) = self.completions[i];
            if user_data == CANCEL_USER_DATA {
                continue;
            }
            let (generation, fd) = decode_user_data(user_data);
            let Some(arm) = self.armed.get_mut(&fd) else {
                tracing::trace!(fd, "completion for unregistered fd dropped");
                continue;
            };
            if arm.generation != generation || result == -libc::ECANCELED {
                tracing::trace!(fd, generation, "superseded poll completion dropped");
                continue;
            }
            if result < 0 {
                tracing::warn!(
                    fd,
                    error = %io::Error::from_raw_os_error(-result),
                    "poll request failed, reporting error readiness"
                );
                arm.armed = false;
                events.push(ReadyEvent {
                    fd,
                    readiness: Interest::ERROR,
                });
                continue;
            }
            events.push(ReadyEvent {
                fd,
                readiness: poll_to_interest(result as libc::c_short),
            });
            let sqe = poll_add(fd, arm);
            push_sqe(&mut self.ring, &sqe)?;
        }
        Ok(())
    }
}

impl Poller for Uring {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("IORING_OP_POLL_ADD", fd)?;
        if self.armed.contains_key(&fd) {
            return Err(Error::registration(
                "IORING_OP_POLL_ADD",
                fd,
                io::Error::from_raw_os_error(libc::EEXIST),
            ));
        }
        let arm = Arm {
            interest,
            generation: self.generation(),
            armed: true,
        };
        push_sqe(&mut self.ring, &poll_add(fd, &arm))
            .map_err(|e| Error::registration("IORING_OP_POLL_ADD", fd, e))?;
        self.armed.insert(fd, arm);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        check_fd("IORING_OP_POLL_UPDATE", fd)?;
        let generation = self.generation();
        let Some(arm) = self.armed.get_mut(&fd) else {
            return Err(Error::registration(
                "IORING_OP_POLL_UPDATE",
                fd,
                io::Error::from_raw_os_error(libc::ENOENT),
            ));
        };
        let old = arm.user_data(fd);
        let was_armed = arm.armed;
        arm.interest = interest;
        arm.generation = generation;
        arm.armed = true;
        let add = poll_add(fd, arm);

        if was_armed {
            push_sqe(&mut self.ring, &poll_remove(old))
                .map_err(|e| Error::registration("IORING_OP_POLL_REMOVE", fd, e))?;
        }
        push_sqe(&mut self.ring, &add)
            .map_err(|e| Error::registration("IORING_OP_POLL_ADD", fd, e))
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        let Some(arm) = self.armed.remove(&fd) else {
            return Ok(());
        };
        if !arm.armed {
            return Ok(());
        }
        push_sqe(&mut self.ring, &poll_remove(arm.user_data(fd)))
            .map_err(|e| Error::registration("IORING_OP_POLL_REMOVE", fd, e))
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> Result<usize> {
        events.clear();
        let deadline = super::deadline_after(timeout);
        loop {
            let timed_out = match self.submit_wait(deadline) {
                Ok(timed_out) => timed_out,
                Err(e) if is_transient(&e) => {
                    metrics::inc_wait_retries();
                    false
                }
                Err(e) => return Err(Error::Wait(e)),
            };
            self.reap(events).map_err(Error::Wait)?;
            // Cancellations and superseded requests complete without readiness.
            if !events.is_empty() || timed_out {
                return Ok(events.len());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_depth_stays_within_kernel_limits() {
        assert_eq!(ring_entries(1), URING_ENTRIES);
        assert_eq!(ring_entries(300), 512);
        assert_eq!(ring_entries(i32::MAX as usize), URING_MAX_ENTRIES);
        assert_eq!(ring_entries(usize::MAX), URING_MAX_ENTRIES);
    }

    #[test]
    fn user_data_round_trips() {
        for (generation, fd) in [(0u32, 0), (1, 7), (u32::MAX, i32::MAX), (42, 65_535)] {
            assert_eq!(
                decode_user_data(encode_user_data(generation, fd)),
                (generation, fd)
            );
        }
    }

    #[test]
    fn cancel_tag_never_collides_with_poll_requests() {
        // fd is non-negative, so the low half of a poll tag never has the sign bit set.
        let max = encode_user_data(u32::MAX, i32::MAX);
        assert_ne!(max, CANCEL_USER_DATA);
    }
}
