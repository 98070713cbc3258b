//! timerfd-backed timer. Watch it for `Interest::READABLE`; each dispatch should `read`
//! the expiration count, otherwise the level-triggered backends report it again.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::watchable::Watchable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    Monotonic,
    Realtime,
    Boottime,
}

impl Clock {
    fn as_raw(self) -> libc::clockid_t {
        match self {
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::Boottime => libc::CLOCK_BOOTTIME,
        }
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

#[derive(Debug, Clone)]
pub struct Timer {
    handle: Handle,
}

impl Timer {
    /// Non-blocking, close-on-exec timer, initially disarmed.
    pub fn new(clock: Clock) -> Result<Timer> {
        let fd = unsafe {
            libc::timerfd_create(clock.as_raw(), libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::acquisition("timerfd_create"));
        }
        Ok(Timer {
            handle: Handle::from(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    fn settime(&self, value: Duration, interval: Duration) -> io::Result<()> {
        let fd = self.handle.require()?;
        let spec = libc::itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };
        if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Fire every `period`, first after one `period`. A zero period disarms.
    pub fn set_interval(&self, period: Duration) -> io::Result<()> {
        self.settime(period, period)
    }

    /// Fire once after `delay`. A zero delay disarms.
    pub fn set_timeout(&self, delay: Duration) -> io::Result<()> {
        self.settime(delay, Duration::ZERO)
    }

    pub fn stop(&self) -> io::Result<()> {
        self.settime(Duration::ZERO, Duration::ZERO)
    }

    /// Time until the next expiration; `None` when disarmed.
    pub fn remaining(&self) -> io::Result<Option<Duration>> {
        let fd = self.handle.require()?;
        // SAFETY: itimerspec is plain old data.
        let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
        if unsafe { libc::timerfd_gettime(fd, &mut spec) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let left = Duration::new(spec.it_value.tv_sec as u64, spec.it_value.tv_nsec as u32);
        Ok((!left.is_zero()).then_some(left))
    }

    /// Expirations since the last read; `None` if the timer has not fired.
    pub fn read(&self) -> io::Result<Option<u64>> {
        let mut buf = [0u8; 8];
        match self.handle.read(&mut buf) {
            Ok(8) => Ok(Some(u64::from_ne_bytes(buf))),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short timerfd read ({n} bytes)"),
            )),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Watchable for Timer {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}
