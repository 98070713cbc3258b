//! Loop sizing and operational defaults.
//!
//! Compile-time defaults live here as constants; `LoopConfig` carries the per-loop
//! choices made at construction time.

use std::time::Duration;

use crate::backend::BackendKind;

/// How long a wait blocks before the idle hook fires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Readiness reports collected per wait.
pub const DEFAULT_MAX_EVENTS: usize = 128;

/// Listen backlog used by `Socket::listen` callers that have no preference.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 256;

/// Submission/completion queue depth of the io_uring backend.
pub const URING_ENTRIES: u32 = 256;

/// Largest queue depth the kernel accepts (IORING_MAX_ENTRIES).
pub const URING_MAX_ENTRIES: u32 = 32768;

// Compile-time sanity checks
const _: () = assert!(DEFAULT_MAX_EVENTS > 0, "a wait must report at least one event");
const _: () = assert!(
    DEFAULT_MAX_EVENTS <= i32::MAX as usize,
    "epoll_wait takes the event count as c_int"
);
const _: () = assert!(URING_ENTRIES <= URING_MAX_ENTRIES);
const _: () = assert!(
    URING_ENTRIES.is_power_of_two(),
    "io_uring rounds queue depth to a power of two"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub backend: BackendKind,
    /// `None` blocks until a descriptor is ready.
    pub idle_timeout: Option<Duration>,
    pub max_events: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl LoopConfig {
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Zero is bumped to one.
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.clamp(1, i32::MAX as usize);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = LoopConfig::default();
        assert_eq!(config.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(config.max_events, DEFAULT_MAX_EVENTS);
        assert_eq!(config.backend, BackendKind::default());
    }

    #[test]
    fn max_events_is_never_zero() {
        assert_eq!(LoopConfig::default().max_events(0).max_events, 1);
    }
}
