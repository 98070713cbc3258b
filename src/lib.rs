//! Library crate for readyloop: a readiness-based event loop over epoll, poll(2) or io_uring,
//! plus the descriptor-owning objects it watches (sockets, timers, serial lines).
//!
//! Everything the loop watches is a [`Watchable`], i.e. something holding a shared,
//! reference-counted [`Handle`]. The loop keeps its own copy of the handle while a
//! descriptor is registered, so the descriptor closes only once the caller and the loop
//! have both let go of it.
//!
//! The binaries (`main.rs`, `bin/client.rs`) are an HTTP/1.0 responder and a load client
//! built on top of the library.

pub mod address;
pub mod backend;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod handle;
pub mod interest;
pub mod metrics;
pub mod serial;
pub mod socket;
#[cfg(target_os = "linux")]
pub mod timer;
pub mod watchable;

pub use address::{AddressError, Family, SocketAddress};
pub use backend::{Backend, BackendKind, Poller, ReadyEvent};
pub use config::LoopConfig;
pub use error::{Error, Result};
pub use event_loop::{EventHandler, EventLoop, LoopHook, Registry};
pub use handle::Handle;
pub use interest::Interest;
pub use serial::{Parity, Serial};
pub use socket::{Socket, SocketType};
#[cfg(target_os = "linux")]
pub use timer::{Clock, Timer};
pub use watchable::Watchable;
