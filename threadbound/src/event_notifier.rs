//! # Event Notifier
//!
//! Surfaces readiness of a file descriptor as the [`activated`] signal,
//! emitted from the dispatcher of the notifier's thread.
//!
//! The file descriptor is not owned: the caller keeps it open for the
//! lifetime of the notifier and closes it after the notifier is dropped.
//!
//! [`activated`]: EventNotifier::activated

use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use mio::{Interest, Token};

use crate::error::EventError;
use crate::object::{HasObject, Object};
use crate::signal::Signal;
use crate::thread::dispatcher::{next_token, EventSource, Readiness};
use crate::thread::{ThreadRef, ThreadState};

/// Readiness condition watched by an [`EventNotifier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotifierType {
    Read,
    Write,
    Exception,
}

impl NotifierType {
    fn interest(self) -> Interest {
        match self {
            NotifierType::Read => Interest::READABLE,
            NotifierType::Write => Interest::WRITABLE,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            NotifierType::Exception => Interest::PRIORITY,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            NotifierType::Exception => Interest::READABLE,
        }
    }

    fn matches(self, readiness: Readiness) -> bool {
        match self {
            NotifierType::Read => readiness.readable,
            NotifierType::Write => readiness.writable,
            NotifierType::Exception => readiness.exception,
        }
    }
}

#[derive(Default)]
struct NotifierState {
    enabled: bool,
    registered_on: Option<ThreadRef>,
}

struct NotifierInner {
    object: Object,
    fd: RawFd,
    kind: NotifierType,
    token: Token,
    state: Mutex<NotifierState>,
    activated: Signal<EventNotifier>,
}

/// Watches a file descriptor for a readiness condition.
///
/// Cloning yields another handle to the same notifier. The registration is
/// removed when the last handle is dropped.
#[derive(Clone)]
pub struct EventNotifier {
    inner: Arc<NotifierInner>,
}

impl EventNotifier {
    /// Create an enabled notifier for `fd`, as a child of `parent` when
    /// given (and then moving together with it), living in the calling
    /// thread otherwise.
    pub fn new(fd: RawFd, kind: NotifierType, parent: Option<&Object>) -> Result<Self, EventError> {
        let object = match parent {
            Some(parent) => Object::with_parent(parent),
            None => Object::new(),
        };
        let inner = Arc::new(NotifierInner {
            object,
            fd,
            kind,
            token: next_token(),
            state: Mutex::new(NotifierState::default()),
            activated: Signal::new(),
        });
        let source: Weak<dyn EventSource> = Arc::downgrade(&inner) as Weak<dyn EventSource>;
        inner.object.add_source(source);

        let notifier = Self { inner };
        notifier.set_enabled(true)?;
        Ok(notifier)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn kind(&self) -> NotifierType {
        self.inner.kind
    }

    /// Emitted on the notifier's thread for every readiness edge observed
    /// while enabled.
    pub fn activated(&self) -> &Signal<EventNotifier> {
        &self.inner.activated
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().unwrap().enabled
    }

    /// Whether the notifier is currently registered with a dispatcher.
    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().unwrap().registered_on.is_some()
    }

    /// Enable or disable the notifier.
    ///
    /// Enabling registers the descriptor with the dispatcher of the
    /// notifier's thread; a registration failure leaves the notifier
    /// disabled and is returned to the caller. A thread that has stopped
    /// never dispatches again, so enabling a notifier living there fails
    /// with [`EventError::ThreadStopped`].
    pub fn set_enabled(&self, enable: bool) -> Result<(), EventError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.enabled == enable && (state.registered_on.is_some() == enable) {
            return Ok(());
        }

        if enable {
            let thread = self.inner.object.thread();
            self.inner.register(&thread)?;
            state.registered_on = Some(thread);
            state.enabled = true;
        } else {
            state.enabled = false;
            if let Some(thread) = state.registered_on.take() {
                self.inner.deregister(&thread)?;
            }
        }
        Ok(())
    }
}

impl NotifierInner {
    fn source(self: &Arc<Self>) -> Weak<dyn EventSource> {
        let weak: Weak<NotifierInner> = Arc::downgrade(self);
        weak
    }

    fn register(self: &Arc<Self>, thread: &ThreadRef) -> Result<(), EventError> {
        if thread.state() == ThreadState::Stopped {
            return Err(EventError::ThreadStopped(thread.name().to_string()));
        }
        thread
            .dispatcher()
            .map_err(EventError::Dispatcher)?
            .register_fd(self.fd, self.kind.interest(), self.token, self.source())
            .map_err(|source| EventError::Register {
                fd: self.fd,
                source,
            })
    }

    fn deregister(&self, thread: &ThreadRef) -> Result<(), EventError> {
        let Some(dispatcher) = thread.existing_dispatcher() else {
            return Ok(());
        };
        dispatcher
            .deregister_fd(self.fd, self.token)
            .map_err(|source| EventError::Deregister {
                fd: self.fd,
                source,
            })
    }
}

impl EventSource for NotifierInner {
    fn dispatch(self: Arc<Self>, readiness: Readiness) {
        if !self.kind.matches(readiness) || !self.state.lock().unwrap().enabled {
            return;
        }
        tracing::trace!(fd = self.fd, kind = ?self.kind, "Event notifier activated");
        self.activated.emit(EventNotifier {
            inner: Arc::clone(&self),
        });
    }

    fn relocate(self: Arc<Self>, to: &ThreadRef) {
        let mut state = self.state.lock().unwrap();
        if let Some(old) = state.registered_on.take() {
            if let Err(e) = self.deregister(&old) {
                tracing::warn!(error = %e, "Failed to deregister notifier during move");
            }
        }
        if !state.enabled {
            return;
        }

        // Registration is level-checked by the OS: readiness that became
        // true before the move is reported by the new dispatcher.
        match self.register(to) {
            Ok(()) => state.registered_on = Some(to.clone()),
            Err(e) => tracing::error!(error = %e, thread = %to.name(), "Failed to register notifier after move"),
        }
    }
}

impl Drop for NotifierInner {
    fn drop(&mut self) {
        let registered_on = match self.state.get_mut() {
            Ok(state) => state.registered_on.take(),
            Err(poisoned) => poisoned.into_inner().registered_on.take(),
        };
        if let Some(thread) = registered_on {
            if let Err(e) = self.deregister(&thread) {
                tracing::debug!(error = %e, "Failed to deregister notifier on drop");
            }
        }
    }
}

impl HasObject for EventNotifier {
    fn object(&self) -> &Object {
        &self.inner.object
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("fd", &self.inner.fd)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
