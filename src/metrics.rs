#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Wait cycle outcomes (cumulative counts)
    static WAITS: AtomicU64 = AtomicU64::new(0);
    static WAIT_RETRIES: AtomicU64 = AtomicU64::new(0);
    static IDLE_WAKEUPS: AtomicU64 = AtomicU64::new(0);
    // Dispatch (cumulative)
    static EVENTS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
    static STALE_EVENTS: AtomicU64 = AtomicU64::new(0);
    // Watch table churn (cumulative)
    static REGISTRATIONS: AtomicU64 = AtomicU64::new(0);
    static REMOVALS: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static WATCHED_MAX: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub waits: u64,
        pub wait_retries: u64,
        pub idle_wakeups: u64,
        pub events_dispatched: u64,
        pub stale_events: u64,
        pub registrations: u64,
        pub removals: u64,
        pub watched_max: usize,
    }

    pub fn inc_waits() {
        WAITS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_retries() {
        WAIT_RETRIES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idle_wakeups() {
        IDLE_WAKEUPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_dispatched() {
        EVENTS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_events() {
        STALE_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_registrations() {
        REGISTRATIONS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_removals() {
        REMOVALS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_watched(value: usize) {
        let mut prev = WATCHED_MAX.load(Ordering::Relaxed);
        while value > prev {
            match WATCHED_MAX.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            waits: WAITS.load(Ordering::Relaxed),
            wait_retries: WAIT_RETRIES.load(Ordering::Relaxed),
            idle_wakeups: IDLE_WAKEUPS.load(Ordering::Relaxed),
            events_dispatched: EVENTS_DISPATCHED.load(Ordering::Relaxed),
            stale_events: STALE_EVENTS.load(Ordering::Relaxed),
            registrations: REGISTRATIONS.load(Ordering::Relaxed),
            removals: REMOVALS.load(Ordering::Relaxed),
            watched_max: WATCHED_MAX.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last_snap = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                tracing::info!(
                    interval_secs = INTERVAL_SECS,
                    waits = snap.waits.saturating_sub(last_snap.waits),
                    wait_retries = snap.wait_retries.saturating_sub(last_snap.wait_retries),
                    idle = snap.idle_wakeups.saturating_sub(last_snap.idle_wakeups),
                    dispatched = snap.events_dispatched.saturating_sub(last_snap.events_dispatched),
                    stale = snap.stale_events.saturating_sub(last_snap.stale_events),
                    registrations = snap.registrations.saturating_sub(last_snap.registrations),
                    removals = snap.removals.saturating_sub(last_snap.removals),
                    watched_max = snap.watched_max,
                    "metrics delta"
                );
                last_snap = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub waits: u64,
        pub wait_retries: u64,
        pub idle_wakeups: u64,
        pub events_dispatched: u64,
        pub stale_events: u64,
        pub registrations: u64,
        pub removals: u64,
        pub watched_max: usize,
    }

    pub fn inc_waits() {}
    pub fn inc_wait_retries() {}
    pub fn inc_idle_wakeups() {}
    pub fn inc_events_dispatched() {}
    pub fn inc_stale_events() {}
    pub fn inc_registrations() {}
    pub fn inc_removals() {}
    pub fn update_watched(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            waits: 0,
            wait_retries: 0,
            idle_wakeups: 0,
            events_dispatched: 0,
            stale_events: 0,
            registrations: 0,
            removals: 0,
            watched_max: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
