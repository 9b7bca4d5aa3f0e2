//! # Event Dispatcher
//!
//! Per-thread multiplexer of OS readiness sources, timers and the message
//! queue wake-up, built on `mio`.
//!
//! The [`mio::Poll`] instance is only ever polled by the owning thread, but
//! registration goes through a cloned [`mio::Registry`] and is safe from any
//! thread. This is what lets an object move its sources from one thread's
//! dispatcher to another's while neither loop is involved.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::thread::ThreadRef;

const WAKER_TOKEN: Token = Token(0);

/// Allocate a process-unique dispatcher token.
pub(crate) fn next_token() -> Token {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    Token(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Readiness reported for a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub exception: bool,
    pub timeout: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            exception: event.is_error() || event.is_priority(),
            timeout: false,
        }
    }

    fn expired() -> Self {
        Self {
            timeout: true,
            ..Default::default()
        }
    }
}

/// An OS-level event source owned by an object.
///
/// Sources are registered with the dispatcher of their object's thread and
/// follow the object when it moves.
pub(crate) trait EventSource: Send + Sync {
    /// Called on the dispatcher's thread when the source is ready.
    fn dispatch(self: Arc<Self>, readiness: Readiness);

    /// Move the registration of the source to `to`'s dispatcher.
    fn relocate(self: Arc<Self>, to: &ThreadRef);
}

pub(crate) struct EventDispatcher {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    event_capacity: usize,
    sources: Mutex<HashMap<Token, Weak<dyn EventSource>>>,
    timers: Mutex<HashMap<Token, (Instant, Weak<dyn EventSource>)>>,
}

impl EventDispatcher {
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            event_capacity: event_capacity.max(1),
            sources: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Interrupt a blocking [`process_events`](Self::process_events).
    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "Failed to wake event dispatcher");
        }
    }

    pub(crate) fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        token: Token,
        source: Weak<dyn EventSource>,
    ) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, interest)?;
        self.sources.lock().unwrap().insert(token, source);
        tracing::trace!(fd, token = token.0, "Registered fd with dispatcher");
        Ok(())
    }

    pub(crate) fn deregister_fd(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.sources.lock().unwrap().remove(&token);
        self.registry.deregister(&mut SourceFd(&fd))?;
        tracing::trace!(fd, token = token.0, "Deregistered fd from dispatcher");
        Ok(())
    }

    pub(crate) fn register_timer(&self, token: Token, deadline: Instant, source: Weak<dyn EventSource>) {
        self.timers.lock().unwrap().insert(token, (deadline, source));
        // Recompute the poll timeout of a loop that may already be waiting.
        self.wake();
    }

    pub(crate) fn unregister_timer(&self, token: Token) -> bool {
        self.timers.lock().unwrap().remove(&token).is_some()
    }

    pub(crate) fn has_timer(&self, token: Token) -> bool {
        self.timers.lock().unwrap().contains_key(&token)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .lock()
            .unwrap()
            .values()
            .map(|(deadline, _)| *deadline)
            .min()
    }

    /// Wait for readiness or timer expiry and dispatch the ready sources.
    ///
    /// `timeout` bounds the wait; `None` blocks until a source is ready, a
    /// timer expires or [`wake`](Self::wake) is called. Must only be called
    /// from the owning thread.
    pub(crate) fn process_events(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = match self.next_deadline() {
            Some(deadline) => {
                let until_timer = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until_timer, |t| t.min(until_timer)))
            }
            None => timeout,
        };

        let mut ready = Vec::new();
        {
            let mut events = Events::with_capacity(self.event_capacity);
            let mut poll = self.poll.lock().unwrap();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                ready.push((event.token(), Readiness::from_event(event)));
            }
        }

        for (token, readiness) in ready {
            let source = self.sources.lock().unwrap().get(&token).cloned();
            if let Some(source) = source.and_then(|weak| weak.upgrade()) {
                dispatch_guarded(source, readiness);
            }
        }

        self.fire_timers();
        Ok(())
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let expired: Vec<Weak<dyn EventSource>> = {
            let mut timers = self.timers.lock().unwrap();
            let tokens: Vec<Token> = timers
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| timers.remove(&token).map(|(_, source)| source))
                .collect()
        };

        for source in expired.into_iter().filter_map(|weak| weak.upgrade()) {
            dispatch_guarded(source, Readiness::expired());
        }
    }
}

/// Dispatch `source`, keeping a panicking slot from tearing down the loop.
fn dispatch_guarded(source: Arc<dyn EventSource>, readiness: Readiness) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| source.dispatch(readiness)));
    if result.is_err() {
        tracing::error!(?readiness, "Event source handler panicked");
    }
}
