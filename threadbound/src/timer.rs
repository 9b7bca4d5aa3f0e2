//! Single-shot timers driven by the dispatcher of the timer's thread.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::Token;

use crate::error::EventError;
use crate::object::{HasObject, Object};
use crate::signal::Signal;
use crate::thread::dispatcher::{next_token, EventSource, Readiness};
use crate::thread::{ThreadRef, ThreadState};

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    armed_on: Option<ThreadRef>,
}

struct TimerInner {
    object: Object,
    token: Token,
    state: Mutex<TimerState>,
    timeout: Signal<Timer>,
}

/// A single-shot timer.
///
/// When the deadline passes, [`timeout`](Timer::timeout) is emitted from the
/// event loop of the timer's thread. Cloning yields another handle to the
/// same timer; the timer is stopped when the last handle is dropped.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn new(parent: Option<&Object>) -> Self {
        let object = match parent {
            Some(parent) => Object::with_parent(parent),
            None => Object::new(),
        };
        let inner = Arc::new(TimerInner {
            object,
            token: next_token(),
            state: Mutex::new(TimerState::default()),
            timeout: Signal::new(),
        });
        let source: Weak<dyn EventSource> = Arc::downgrade(&inner) as Weak<dyn EventSource>;
        inner.object.add_source(source);
        Self { inner }
    }

    pub fn timeout(&self) -> &Signal<Timer> {
        &self.inner.timeout
    }

    /// Arm the timer to expire `duration` from now, restarting it if it is
    /// already running.
    pub fn start(&self, duration: Duration) -> Result<(), EventError> {
        self.start_at(Instant::now() + duration)
    }

    /// Arm the timer to expire at `deadline`. Fails, leaving the timer
    /// stopped, if the timer's thread has stopped or its dispatcher cannot
    /// be created.
    pub fn start_at(&self, deadline: Instant) -> Result<(), EventError> {
        let mut state = self.inner.state.lock().unwrap();
        state.deadline = None;
        if let Some(thread) = state.armed_on.take() {
            unregister(&thread, self.inner.token);
        }

        let thread = self.inner.object.thread();
        self.inner.arm(&thread, deadline)?;
        state.deadline = Some(deadline);
        state.armed_on = Some(thread);
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.deadline = None;
        if let Some(thread) = state.armed_on.take() {
            unregister(&thread, self.inner.token);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.state.lock().unwrap().deadline
    }
}

impl TimerInner {
    fn source(self: &Arc<Self>) -> Weak<dyn EventSource> {
        let weak: Weak<TimerInner> = Arc::downgrade(self);
        weak
    }

    fn arm(self: &Arc<Self>, thread: &ThreadRef, deadline: Instant) -> Result<(), EventError> {
        if thread.state() == ThreadState::Stopped {
            return Err(EventError::ThreadStopped(thread.name().to_string()));
        }
        thread
            .dispatcher()
            .map_err(EventError::Dispatcher)?
            .register_timer(self.token, deadline, self.source());
        Ok(())
    }
}

fn unregister(thread: &ThreadRef, token: Token) {
    if let Some(dispatcher) = thread.existing_dispatcher() {
        dispatcher.unregister_timer(token);
    }
}

impl EventSource for TimerInner {
    fn dispatch(self: Arc<Self>, readiness: Readiness) {
        if !readiness.timeout {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.deadline.is_none() {
                return;
            }
            state.deadline = None;
            state.armed_on = None;
        }
        tracing::trace!(token = self.token.0, "Timer expired");
        self.timeout.emit(Timer {
            inner: Arc::clone(&self),
        });
    }

    fn relocate(self: Arc<Self>, to: &ThreadRef) {
        let mut state = self.state.lock().unwrap();
        let Some(old) = state.armed_on.take() else {
            return;
        };
        unregister(&old, self.token);
        let Some(deadline) = state.deadline else {
            return;
        };
        match self.arm(to, deadline) {
            Ok(()) => state.armed_on = Some(to.clone()),
            Err(e) => {
                tracing::error!(error = %e, thread = %to.name(), "Failed to re-arm timer after move");
                state.deadline = None;
            }
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        let armed_on = match self.state.get_mut() {
            Ok(state) => state.armed_on.take(),
            Err(poisoned) => poisoned.into_inner().armed_on.take(),
        };
        if let Some(thread) = armed_on {
            unregister(&thread, self.token);
        }
    }
}

impl HasObject for Timer {
    fn object(&self) -> &Object {
        &self.inner.object
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.deadline())
            .finish()
    }
}
