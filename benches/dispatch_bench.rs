//! One pipe ping through `run_once` per iteration, with N idle descriptors watched
//! alongside, per backend. The poll backend's cost grows with N; the others should not.

mod common;

use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;
use std::time::{Duration, Instant};

use readyloop::{EventLoop, Interest, LoopConfig};

use common::{backends, pipe};

const TARGET_DURATION: Duration = Duration::from_secs(2);
const WATCHED_COUNTS: &[usize] = &[1, 64, 256];

fn main() {
    eprintln!(
        "{:>8}  {:>8}  {:>12}  {:>10}",
        "backend", "watched", "ns/dispatch", "iterations"
    );
    for kind in backends() {
        for &idle in WATCHED_COUNTS {
            let mut ev: EventLoop<()> = EventLoop::with_config(
                LoopConfig::default()
                    .backend(kind)
                    .idle_timeout(Some(Duration::from_secs(1))),
            )
            .unwrap();

            // Keep the idle pipes alive for the whole run.
            let idle_pipes: Vec<_> = (0..idle.saturating_sub(1)).map(|_| pipe()).collect();
            for (r, _) in &idle_pipes {
                ev.add(r, Interest::READABLE, ()).unwrap();
            }
            let (r, w) = pipe();
            ev.add(&r, Interest::READABLE, ()).unwrap();

            let dispatched = Rc::new(Cell::new(0u64));
            let counter = dispatched.clone();
            ev.on_events(move |_reg, handle, _readiness, _ctx| {
                let mut buf = [0u8; 1];
                let _ = black_box(handle.read(&mut buf));
                counter.set(counter.get() + 1);
            });

            // Warm up
            for _ in 0..1_000 {
                w.write(b"x").unwrap();
                ev.run_once().unwrap();
            }

            dispatched.set(0);
            let start = Instant::now();
            let mut iterations: u64 = 0;
            while start.elapsed() < TARGET_DURATION {
                w.write(b"x").unwrap();
                ev.run_once().unwrap();
                iterations += 1;
            }
            let elapsed = start.elapsed();
            assert_eq!(dispatched.get(), iterations);

            eprintln!(
                "{:>8}  {:>8}  {:>12.0}  {:>10}",
                kind.name(),
                idle,
                elapsed.as_nanos() as f64 / iterations as f64,
                iterations
            );
        }
    }
}
