#![allow(dead_code)]

use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use readyloop::{BackendKind, EventLoop, Handle, LoopConfig};

/// Wait bound used by tests; long enough for loopback traffic, short enough for idle cases.
pub const TEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Non-blocking pipe as (read end, write end).
pub fn pipe() -> (Handle, Handle) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe failed");
    let (r, w) = unsafe { (Handle::from_raw_fd(fds[0]), Handle::from_raw_fd(fds[1])) };
    r.set_nonblocking(true).unwrap();
    w.set_nonblocking(true).unwrap();
    (r, w)
}

/// One loop per backend that can be constructed here. io_uring may be compiled in
/// but refused by the kernel or a seccomp profile; such backends are skipped.
pub fn loops<C>() -> Vec<EventLoop<C>> {
    BackendKind::AVAILABLE
        .iter()
        .filter_map(|&kind| {
            EventLoop::with_config(
                LoopConfig::default()
                    .backend(kind)
                    .idle_timeout(Some(TEST_TIMEOUT)),
            )
            .ok()
        })
        .collect()
}
