//! The event loop: watch table + backend + handler dispatch.
//!
//! One cycle is Waiting → Dispatching → Idle. The ready set returned by the backend is
//! a snapshot; handlers may add, modify or remove any descriptor (their own included)
//! while the batch is being walked. A report whose descriptor is no longer watched when
//! its turn comes is skipped.
//!
//! While a descriptor's handler runs, its context is lent out of the table and its
//! handle is held by a local clone, so self-removal never invalidates what the handler
//! is holding. When the handler returns the context goes back, unless the entry was
//! removed, re-added, or given a new context in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{Backend, BackendKind, Poller, ReadyEvent};
use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::interest::Interest;
use crate::metrics;
use crate::watchable::Watchable;

/// Per-descriptor handler: (loop, watched handle, readiness, that descriptor's context).
pub type EventHandler<C> = Box<dyn FnMut(&mut Registry<C>, &Handle, Interest, &mut C)>;

/// Post-dispatch and idle hooks.
pub type LoopHook<C> = Box<dyn FnMut(&mut Registry<C>)>;

struct WatchEntry<C> {
    handle: Handle,
    interest: Interest,
    /// `None` only while this descriptor's handler holds the context.
    context: Option<C>,
    /// Bumped on every add; lets dispatch notice re-registration from inside a handler.
    generation: u64,
    /// Generation of the add that created this entry; re-adds keep it.
    inserted: u64,
}

/// The watch table and backend, as seen by handlers and hooks.
pub struct Registry<C> {
    backend: Backend,
    watched: HashMap<RawFd, WatchEntry<C>>,
    next_generation: u64,
    running: bool,
}

impl<C> Registry<C> {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            watched: HashMap::new(),
            next_generation: 0,
            running: false,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Watch `target`. Adding a descriptor that is already watched replaces its
    /// interest and context instead of creating a second entry.
    pub fn add<W: Watchable + ?Sized>(
        &mut self,
        target: &W,
        interest: Interest,
        context: C,
    ) -> Result<()> {
        let handle = target.handle();
        let fd = handle.fd();
        if fd < 0 {
            return Err(Error::registration(
                "add",
                fd,
                io::Error::from_raw_os_error(libc::EBADF),
            ));
        }
        self.next_generation += 1;
        let generation = self.next_generation;

        if let Some(entry) = self.watched.get_mut(&fd) {
            self.backend.update(fd, interest)?;
            entry.handle = handle.clone();
            entry.interest = interest;
            entry.context = Some(context);
            entry.generation = generation;
            tracing::debug!(fd, ?interest, "watch replaced");
        } else {
            self.backend.register(fd, interest)?;
            self.watched.insert(
                fd,
                WatchEntry {
                    handle: handle.clone(),
                    interest,
                    context: Some(context),
                    generation,
                    inserted: generation,
                },
            );
            tracing::debug!(fd, ?interest, watched = self.watched.len(), "watch added");
        }
        metrics::inc_registrations();
        metrics::update_watched(self.watched.len());
        Ok(())
    }

    /// Change interest; the context is left as is.
    pub fn modify<W: Watchable + ?Sized>(&mut self, target: &W, interest: Interest) -> Result<()> {
        let fd = target.raw_fd();
        if let Some(entry) = self.modify_entry(fd, interest)? {
            entry.interest = interest;
            tracing::debug!(fd, ?interest, "watch modified");
        }
        Ok(())
    }

    /// Change interest and replace the context.
    pub fn modify_with_context<W: Watchable + ?Sized>(
        &mut self,
        target: &W,
        interest: Interest,
        context: C,
    ) -> Result<()> {
        let fd = target.raw_fd();
        if let Some(entry) = self.modify_entry(fd, interest)? {
            entry.interest = interest;
            entry.context = Some(context);
            tracing::debug!(fd, ?interest, "watch modified with new context");
        }
        Ok(())
    }

    /// The backend update is attempted even for unwatched descriptors: kernel-assisted
    /// backends reject it with their own OS error (ENOENT). The portable backend accepts
    /// anything; there the update is rolled back and the call is a no-op.
    fn modify_entry(
        &mut self,
        fd: RawFd,
        interest: Interest,
    ) -> Result<Option<&mut WatchEntry<C>>> {
        let Some(entry) = self.watched.get_mut(&fd) else {
            self.backend.update(fd, interest)?;
            self.backend.unregister(fd)?;
            tracing::debug!(fd, "modify of unwatched fd ignored");
            return Ok(None);
        };
        self.backend.update(fd, interest)?;
        Ok(Some(entry))
    }

    /// Stop watching `target`. Unknown descriptors are a no-op. Safe from inside any
    /// handler, including the one currently running for `target`.
    pub fn remove<W: Watchable + ?Sized>(&mut self, target: &W) -> Result<()> {
        self.remove_fd(target.raw_fd())
    }

    pub fn remove_fd(&mut self, fd: RawFd) -> Result<()> {
        // The entry (and its handle) is dropped only after the backend let go of the fd.
        let entry = self.watched.remove(&fd);
        self.backend.unregister(fd)?;
        if entry.is_some() {
            metrics::inc_removals();
            tracing::debug!(fd, watched = self.watched.len(), "watch removed");
        }
        Ok(())
    }

    /// Ask `run` to return. Observed before the next wait, never inside one.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.watched.contains_key(&fd)
    }

    /// Watched, and already watched when the batch being dispatched was collected.
    fn watched_before(&self, fd: RawFd, batch_generation: u64) -> bool {
        self.watched
            .get(&fd)
            .is_some_and(|e| e.inserted <= batch_generation)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.watched.get(&fd).map(|e| e.interest)
    }

    pub fn handle(&self, fd: RawFd) -> Option<&Handle> {
        self.watched.get(&fd).map(|e| &e.handle)
    }

    /// `None` for unwatched descriptors and for the one whose handler is running.
    pub fn context(&self, fd: RawFd) -> Option<&C> {
        self.watched.get(&fd).and_then(|e| e.context.as_ref())
    }

    pub fn context_mut(&mut self, fd: RawFd) -> Option<&mut C> {
        self.watched.get_mut(&fd).and_then(|e| e.context.as_mut())
    }

    /// Watched descriptors with their handle and interest, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Handle, Interest)> {
        self.watched
            .iter()
            .map(|(&fd, e)| (fd, &e.handle, e.interest))
    }

    fn lend(&mut self, fd: RawFd) -> Option<(Handle, C, u64)> {
        let entry = self.watched.get_mut(&fd)?;
        let context = entry.context.take()?;
        Some((entry.handle.clone(), context, entry.generation))
    }

    /// Returns false if the registration the context was lent from is gone.
    fn give_back(&mut self, fd: RawFd, generation: u64, context: C) -> bool {
        match self.watched.get_mut(&fd) {
            Some(entry) if entry.generation == generation => {
                // A context set by modify_with_context during the handler wins.
                if entry.context.is_none() {
                    entry.context = Some(context);
                }
                true
            }
            _ => false,
        }
    }

    fn dispatch(
        &mut self,
        event: ReadyEvent,
        generation: Option<u64>,
        handler: &mut EventHandler<C>,
    ) -> Option<u64> {
        let Some((handle, mut context, current)) = self.lend(event.fd) else {
            return None;
        };
        if generation.is_some_and(|g| g != current) {
            self.give_back(event.fd, current, context);
            return None;
        }
        handler(self, &handle, event.readiness, &mut context);
        metrics::inc_events_dispatched();
        self.give_back(event.fd, current, context).then_some(current)
    }
}

impl<C> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend.kind())
            .field("watched", &self.watched.len())
            .field("running", &self.running)
            .finish()
    }
}

enum Dispatch<C> {
    Unset,
    /// One handler sees every report with the full readiness set.
    All(EventHandler<C>),
    /// Handlers keyed by bit-set, walked in ascending bit-pattern order.
    ByEvents(BTreeMap<Interest, EventHandler<C>>),
}

pub struct EventLoop<C = ()> {
    registry: Registry<C>,
    dispatch: Dispatch<C>,
    on_post_events: Option<LoopHook<C>>,
    on_idle: Option<LoopHook<C>>,
    idle_timeout: Option<Duration>,
    ready: Vec<ReadyEvent>,
}

impl<C> EventLoop<C> {
    /// Loop on the platform's default backend with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_backend(kind: BackendKind) -> Result<Self> {
        Self::with_config(LoopConfig::default().backend(kind))
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let backend = Backend::new(config.backend, config.max_events)?;
        Ok(Self {
            registry: Registry::new(backend),
            dispatch: Dispatch::Unset,
            on_post_events: None,
            on_idle: None,
            idle_timeout: config.idle_timeout,
            ready: Vec::with_capacity(config.max_events),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.registry.backend_kind()
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry<C> {
        &mut self.registry
    }

    pub fn add<W: Watchable + ?Sized>(
        &mut self,
        target: &W,
        interest: Interest,
        context: C,
    ) -> Result<()> {
        self.registry.add(target, interest, context)
    }

    pub fn modify<W: Watchable + ?Sized>(&mut self, target: &W, interest: Interest) -> Result<()> {
        self.registry.modify(target, interest)
    }

    pub fn modify_with_context<W: Watchable + ?Sized>(
        &mut self,
        target: &W,
        interest: Interest,
        context: C,
    ) -> Result<()> {
        self.registry.modify_with_context(target, interest, context)
    }

    pub fn remove<W: Watchable + ?Sized>(&mut self, target: &W) -> Result<()> {
        self.registry.remove(target)
    }

    pub fn stop(&mut self) {
        self.registry.stop();
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// `None` blocks each wait until something is ready.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// Install a catch-all handler. Replaces any per-bit-set handlers.
    pub fn on_events<F>(&mut self, handler: F)
    where
        F: FnMut(&mut Registry<C>, &Handle, Interest, &mut C) + 'static,
    {
        self.dispatch = Dispatch::All(Box::new(handler));
    }

    /// Install a handler for bit-set `events`. It fires for every report whose readiness
    /// contains all of `events`; several matching handlers run in ascending bit order.
    /// Replaces a catch-all handler, and any previous handler for the same set.
    /// A handler for the empty set never fires.
    pub fn on_event<F>(&mut self, events: Interest, handler: F)
    where
        F: FnMut(&mut Registry<C>, &Handle, Interest, &mut C) + 'static,
    {
        if !matches!(self.dispatch, Dispatch::ByEvents(_)) {
            self.dispatch = Dispatch::ByEvents(BTreeMap::new());
        }
        if let Dispatch::ByEvents(handlers) = &mut self.dispatch {
            handlers.insert(events, Box::new(handler));
        }
    }

    /// Runs after every cycle that dispatched at least one report.
    pub fn on_post_events<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Registry<C>) + 'static,
    {
        self.on_post_events = Some(Box::new(hook));
    }

    /// Runs once for every wait that timed out with nothing ready.
    pub fn on_idle<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Registry<C>) + 'static,
    {
        self.on_idle = Some(Box::new(hook));
    }

    /// Wait-dispatch cycles until `stop` is called or the backend fails.
    pub fn run(&mut self) -> Result<()> {
        self.registry.running = true;
        while self.registry.running {
            if let Err(e) = self.cycle() {
                self.registry.running = false;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Exactly one wait-dispatch cycle. Returns the number of readiness reports.
    pub fn run_once(&mut self) -> Result<usize> {
        self.registry.running = true;
        let result = self.cycle();
        self.registry.running = false;
        result
    }

    fn cycle(&mut self) -> Result<usize> {
        metrics::inc_waits();
        // Owned snapshot: handlers mutate the table, never this list.
        let mut ready = std::mem::take(&mut self.ready);
        let batch_generation = self.registry.next_generation;
        let n = match self.registry.backend.wait(&mut ready, self.idle_timeout) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, backend = %self.registry.backend_kind(), "wait failed");
                self.ready = ready;
                return Err(e);
            }
        };

        if n == 0 {
            metrics::inc_idle_wakeups();
            if let Some(hook) = self.on_idle.as_mut() {
                hook(&mut self.registry);
            }
        } else {
            for &event in &ready {
                self.dispatch_one(event, batch_generation);
            }
            if let Some(hook) = self.on_post_events.as_mut() {
                hook(&mut self.registry);
            }
        }

        self.ready = ready;
        Ok(n)
    }

    fn dispatch_one(&mut self, event: ReadyEvent, batch_generation: u64) {
        let Self {
            registry, dispatch, ..
        } = self;

        // A descriptor added during this batch may reuse the number of one removed
        // earlier in it; the report belongs to the old one.
        if !registry.watched_before(event.fd, batch_generation) {
            metrics::inc_stale_events();
            tracing::trace!(fd = event.fd, readiness = ?event.readiness, "stale report skipped");
            return;
        }
        tracing::trace!(fd = event.fd, readiness = ?event.readiness, "dispatch");

        match dispatch {
            Dispatch::Unset => {}
            Dispatch::All(handler) => {
                registry.dispatch(event, None, handler);
            }
            Dispatch::ByEvents(handlers) => {
                let mut generation = None;
                for (&events, handler) in handlers.iter_mut() {
                    if events.is_empty() || !event.readiness.contains(events) {
                        continue;
                    }
                    match registry.dispatch(event, generation, handler) {
                        Some(current) => generation = Some(current),
                        // Removed or re-registered by the handler: the rest is stale.
                        None => break,
                    }
                }
            }
        }
    }
}

impl<C> fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("registry", &self.registry)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
