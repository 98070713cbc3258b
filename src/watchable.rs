use std::os::unix::io::RawFd;

use crate::handle::Handle;

/// Anything backed by a `Handle` that the event loop can watch.
///
/// The loop keeps its own clone of the handle for as long as the descriptor is
/// registered, so the descriptor outlives the caller's copy while watched.
pub trait Watchable {
    fn handle(&self) -> &Handle;

    fn raw_fd(&self) -> RawFd {
        self.handle().fd()
    }
}

impl Watchable for Handle {
    fn handle(&self) -> &Handle {
        self
    }
}

impl<W: Watchable + ?Sized> Watchable for &W {
    fn handle(&self) -> &Handle {
        (**self).handle()
    }
}
