use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

const REQUEST: &[u8] = b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n";
const EXPECTED_STATUS: &str = "HTTP/1.0 200 OK";

#[derive(Parser)]
#[command(about = "Test client for the readyloop HTTP responder")]
struct Args {
    /// Server port
    #[arg(short, long, default_value_t = 8082)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send one request and verify the reply (default)
    Smoke,
    /// Fixed number of request/reply exchanges, one connection each
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per connection slot
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
    },
    /// Sustained load with per-request latency measurement
    Sustain {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Warmup duration in seconds (discarded from report)
        #[arg(short = 'W', long, default_value_t = 3)]
        warmup: u64,
        /// Measurement duration in seconds
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

/// One HTTP/1.0 exchange: connect, send, read until the server closes.
fn exchange(addr: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.write_all(REQUEST)?;
    let mut reply = Vec::with_capacity(256);
    stream.read_to_end(&mut reply)?;
    Ok(reply)
}

fn check_reply(reply: &[u8]) {
    let text = String::from_utf8_lossy(reply);
    let status = text.lines().next().unwrap_or_default();
    assert_eq!(status, EXPECTED_STATUS, "unexpected status line");
    assert!(
        text.ends_with("\r\n\r\n"),
        "reply not terminated by an empty line ({} bytes)",
        reply.len()
    );
}

fn main() {
    let args = Args::parse();
    let addr = format!("127.0.0.1:{}", args.port);

    match args.command.unwrap_or(Command::Smoke) {
        Command::Smoke => smoke_test(&addr),
        Command::Bench {
            connections,
            requests,
        } => bench_test(&addr, connections, requests),
        Command::Sustain {
            connections,
            warmup,
            duration,
        } => sustain_test(&addr, connections, warmup, duration),
    }
}

fn smoke_test(addr: &str) {
    eprintln!("smoke test: connecting to {}", addr);
    let reply = exchange(addr).expect("exchange failed");
    check_reply(&reply);
    eprintln!("  reply: OK ({} bytes, connection closed by server)", reply.len());

    // A second exchange proves the first connection was cleaned up, not wedged.
    let reply = exchange(addr).expect("second exchange failed");
    check_reply(&reply);
    eprintln!("smoke test: PASSED");
}

fn bench_test(addr: &str, num_connections: usize, requests_per_conn: usize) {
    eprintln!(
        "bench: {} connections x {} requests to {}",
        num_connections, requests_per_conn, addr
    );

    let start = Instant::now();
    let handles: Vec<_> = (0..num_connections)
        .map(|_| {
            let addr = addr.to_string();
            std::thread::spawn(move || {
                for _ in 0..requests_per_conn {
                    let reply = exchange(&addr).expect("exchange failed");
                    check_reply(&reply);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked");
    }

    let elapsed = start.elapsed();
    let total = num_connections * requests_per_conn;
    eprintln!(
        "bench: {} requests in {:.2}s = {:.0} req/s",
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn print_interval(samples: &mut [u64], elapsed: Duration) {
    samples.sort_unstable();
    let n = samples.len();
    eprintln!(
        "{:>10.0}  {:>8.1}µs  {:>8.1}µs  {:>8.1}µs  {:>8}",
        n as f64 / elapsed.as_secs_f64(),
        percentile(samples, 50.0),
        percentile(samples, 99.0),
        percentile(samples, 99.9),
        n,
    );
}

fn sustain_test(addr: &str, num_connections: usize, warmup_secs: u64, duration_secs: u64) {
    eprintln!(
        "sustain: {} connections, warmup={}s, duration={}s → {}",
        num_connections, warmup_secs, duration_secs, addr
    );

    let (tx, rx) = mpsc::channel::<u64>();
    for _ in 0..num_connections {
        let addr = addr.to_string();
        let tx = tx.clone();
        std::thread::spawn(move || {
            loop {
                let sent_at = Instant::now();
                if exchange(&addr).is_err() {
                    break;
                }
                if tx.send(sent_at.elapsed().as_nanos() as u64).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    if warmup_secs > 0 {
        eprint!("warming up ({warmup_secs}s)");
        let warmup_end = Instant::now() + Duration::from_secs(warmup_secs);
        while Instant::now() < warmup_end {
            while rx.try_recv().is_ok() {}
            std::thread::sleep(Duration::from_millis(100));
            eprint!(".");
        }
        eprintln!(" ready");
    }

    eprintln!(
        "{:>10}  {:>9}  {:>9}  {:>9}  {:>8}",
        "req/s", "p50", "p99", "p99.9", "n"
    );

    let measure_start = Instant::now();
    let measure_end = measure_start + Duration::from_secs(duration_secs);
    let mut all_samples: Vec<u64> = Vec::new();
    let mut interval_samples: Vec<u64> = Vec::new();
    let mut last_print = Instant::now();

    loop {
        let now = Instant::now();
        if now >= measure_end {
            break;
        }
        let timeout = (measure_end - now).min(Duration::from_millis(100));
        match rx.recv_timeout(timeout) {
            Ok(ns) => {
                interval_samples.push(ns);
                all_samples.push(ns);
                while let Ok(ns) = rx.try_recv() {
                    interval_samples.push(ns);
                    all_samples.push(ns);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("error: all workers stopped, is the server running?");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_print.elapsed() >= Duration::from_secs(1) && !interval_samples.is_empty() {
            print_interval(&mut interval_samples, last_print.elapsed());
            interval_samples.clear();
            last_print = Instant::now();
        }
    }

    if !interval_samples.is_empty() {
        print_interval(&mut interval_samples, last_print.elapsed());
    }

    if all_samples.is_empty() {
        eprintln!("no samples collected");
        return;
    }
    all_samples.sort_unstable();
    let n = all_samples.len();
    let elapsed = measure_start.elapsed();
    eprintln!();
    eprintln!(
        "── summary ({:.1}s, {} requests) ──",
        elapsed.as_secs_f64(),
        n
    );
    eprintln!("  req/s   {:.0}", n as f64 / elapsed.as_secs_f64());
    eprintln!("  p50     {:.1}µs", percentile(&all_samples, 50.0));
    eprintln!("  p99     {:.1}µs", percentile(&all_samples, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(&all_samples, 99.9));
    eprintln!("  max     {:.1}µs", all_samples[n - 1] as f64 / 1_000.0);
}
