//! add / modify / remove churn on a set of pipes, per backend.

mod common;

use std::hint::black_box;
use std::time::{Duration, Instant};

use readyloop::{EventLoop, Interest, LoopConfig};

use common::{backends, pipe};

const TARGET_DURATION: Duration = Duration::from_secs(2);
const PIPES: usize = 256;

fn main() {
    eprintln!("{:>8}  {:>14}  {:>10}", "backend", "ns/add+mod+rm", "rounds");
    for kind in backends() {
        let mut ev: EventLoop<usize> =
            EventLoop::with_config(LoopConfig::default().backend(kind)).unwrap();
        ev.set_idle_timeout(Some(Duration::ZERO));
        let pipes: Vec<_> = (0..PIPES).map(|_| pipe()).collect();

        let churn = |ev: &mut EventLoop<usize>| {
            for (i, (r, _)) in pipes.iter().enumerate() {
                ev.add(r, Interest::READABLE, i).unwrap();
            }
            for (r, _) in &pipes {
                ev.modify(r, Interest::READABLE | Interest::HANGUP).unwrap();
            }
            for (r, _) in &pipes {
                ev.remove(r).unwrap();
            }
            black_box(ev.registry().len());
        };

        // Warm up
        for _ in 0..100 {
            churn(&mut ev);
        }

        let start = Instant::now();
        let mut rounds: u64 = 0;
        while start.elapsed() < TARGET_DURATION {
            churn(&mut ev);
            rounds += 1;
            // io_uring queues its requests until the next wait; flush them.
            if rounds % 16 == 0 {
                ev.run_once().unwrap();
            }
        }
        let elapsed = start.elapsed();

        eprintln!(
            "{:>8}  {:>14.0}  {:>10}",
            kind.name(),
            elapsed.as_nanos() as f64 / (rounds as f64 * PIPES as f64),
            rounds
        );
    }
}
