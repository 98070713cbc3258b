#![allow(dead_code)]

use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;

use readyloop::{BackendKind, EventLoop, Handle, LoopConfig};

/// Non-blocking pipe as (read end, write end).
pub fn pipe() -> (Handle, Handle) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe failed");
    let (r, w) = unsafe { (Handle::from_raw_fd(fds[0]), Handle::from_raw_fd(fds[1])) };
    r.set_nonblocking(true).unwrap();
    w.set_nonblocking(true).unwrap();
    (r, w)
}

/// Every backend this machine accepts, in `BackendKind::AVAILABLE` order.
pub fn backends() -> Vec<BackendKind> {
    BackendKind::AVAILABLE
        .iter()
        .copied()
        .filter(|&kind| EventLoop::<()>::with_config(LoopConfig::default().backend(kind)).is_ok())
        .collect()
}
