use std::io;
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use readyloop::config::DEFAULT_LISTEN_BACKLOG;
use readyloop::{
    BackendKind, EventLoop, Handle, Interest, LoopConfig, Registry, Socket, SocketAddress,
    SocketType, Watchable, metrics,
};

/// Fixed reply; every connection gets exactly this and is closed.
const HTTP_REPLY: &[u8] = b"HTTP/1.0 200 OK\r\n\
Date: Thu, 07 May 2020 12:49:30 GMT\r\n\
Connection: close\r\n\
Accept-Ranges: bytes\r\n\
Last-Modified: Thu, 07 May 2020 12:49:25 GMT\r\n\
Content-Length: 0\r\n\
\r\n";

const RECV_BUF_SIZE: usize = 4096;

#[derive(Parser)]
#[command(about = "Minimal HTTP/1.0 responder on the readiness event loop")]
struct Args {
    /// Address to listen on
    #[arg(short = 'a', long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    addr: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8082)]
    port: u16,

    /// Readiness backend (epoll, poll, uring)
    #[arg(short, long, default_value_t = BackendKind::default())]
    backend: BackendKind,
}

/// Per-descriptor state carried in the loop's watch table.
enum Conn {
    Listener(Socket),
    Client { socket: Socket, written: usize },
}

fn drop_conn(reg: &mut Registry<Conn>, handle: &Handle) {
    if let Err(e) = reg.remove(handle) {
        tracing::warn!(fd = handle.fd(), error = %e, "remove failed");
    }
}

fn on_readable(reg: &mut Registry<Conn>, handle: &Handle, _: Interest, conn: &mut Conn) {
    match conn {
        Conn::Listener(listener) => loop {
            match listener.accept() {
                Ok((client, peer)) => {
                    tracing::trace!(fd = client.handle().fd(), %peer, "accepted");
                    let ctx = Conn::Client {
                        socket: client.clone(),
                        written: 0,
                    };
                    if let Err(e) = reg.add(&client, Interest::READABLE, ctx) {
                        tracing::warn!(error = %e, "failed to watch accepted connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        },
        Conn::Client { socket, .. } => {
            let mut buf = [0u8; RECV_BUF_SIZE];
            match socket.recv(&mut buf) {
                Ok(0) => drop_conn(reg, handle),
                // Any request gets the same reply; switch to writing it.
                Ok(_) => {
                    if let Err(e) = reg.modify(handle, Interest::WRITABLE) {
                        tracing::warn!(fd = handle.fd(), error = %e, "modify failed");
                        drop_conn(reg, handle);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => drop_conn(reg, handle),
            }
        }
    }
}

fn on_writable(reg: &mut Registry<Conn>, handle: &Handle, _: Interest, conn: &mut Conn) {
    let Conn::Client { socket, written } = conn else {
        return;
    };
    match socket.send(&HTTP_REPLY[*written..]) {
        Ok(n) => {
            *written += n;
            if *written == HTTP_REPLY.len() {
                if let Err(e) = socket.shutdown(Shutdown::Both) {
                    tracing::warn!(fd = handle.fd(), error = %e, "shutdown failed");
                }
                drop_conn(reg, handle);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(_) => drop_conn(reg, handle),
    }
}

/// Loop that owns `listener` and answers every connection it accepts.
fn responder(listener: Socket, config: LoopConfig) -> readyloop::Result<EventLoop<Conn>> {
    let mut ev = EventLoop::<Conn>::with_config(config)?;
    ev.add(&listener, Interest::READABLE, Conn::Listener(listener.clone()))?;

    ev.on_event(Interest::READABLE, on_readable);
    ev.on_event(Interest::WRITABLE, on_writable);
    ev.on_event(Interest::ERROR, |reg, handle, _, _| drop_conn(reg, handle));
    ev.on_event(Interest::HANGUP, |reg, handle, _, _| drop_conn(reg, handle));
    ev.on_idle(|reg| tracing::debug!(watched = reg.len(), "idle"));
    Ok(ev)
}

fn serve(args: &Args) -> readyloop::Result<()> {
    let addr = SocketAddress::from(SocketAddr::new(args.addr, args.port));
    let mut listener = Socket::new(addr.family(), SocketType::Stream)?;
    listener
        .listen(&addr, DEFAULT_LISTEN_BACKLOG)
        .map_err(|source| readyloop::Error::Acquisition {
            op: "listen",
            source,
        })?;

    let mut ev = responder(listener, LoopConfig::default().backend(args.backend))?;
    eprintln!("readyloop: {} backend, listening on {addr}", ev.backend_kind());
    ev.run()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    metrics::spawn_reporter();

    let args = Args::parse();
    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("readyloop: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    use readyloop::Family;

    #[test]
    fn answers_each_connection_and_forgets_it() {
        for &kind in BackendKind::AVAILABLE {
            let mut listener = Socket::new(Family::Ipv4, SocketType::Stream).unwrap();
            listener
                .listen(&"127.0.0.1:0".parse().unwrap(), 16)
                .unwrap();
            let addr = listener.local_address().unwrap().to_string();
            let config = LoopConfig::default()
                .backend(kind)
                .idle_timeout(Some(Duration::from_millis(50)));
            let Ok(mut ev) = responder(listener, config) else {
                continue;
            };

            for _ in 0..2 {
                let peer = std::thread::spawn({
                    let addr = addr.clone();
                    move || {
                        let mut s = std::net::TcpStream::connect(addr).unwrap();
                        s.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
                        let mut reply = Vec::new();
                        s.read_to_end(&mut reply).unwrap();
                        reply
                    }
                });
                while !peer.is_finished() {
                    ev.run_once().unwrap();
                }
                assert_eq!(peer.join().unwrap(), HTTP_REPLY, "{kind}");
            }
            // Only the listener is left once the replies went out.
            assert_eq!(ev.registry().len(), 1, "{kind}");
        }
    }
}
