//! # Threads
//!
//! A [`Thread`] owns a FIFO message queue and an event loop that multiplexes
//! the queue with OS readiness sources and timers. Objects are bound to a
//! thread; everything addressed to them is executed by that thread's loop.
//!
//! ## Key Concepts
//! - Identity: [`Thread::current`] returns a [`ThreadRef`] for the calling
//!   context in O(1). Contexts not started by this crate (such as `main`)
//!   are adopted lazily and get an identity; their dispatcher is created
//!   the first time it is needed
//! - Lifecycle: Created -> Running -> Stopping -> Stopped
//! - Batching: each loop iteration delivers the messages queued when the
//!   iteration began, so producers that keep appending cannot starve OS
//!   events or exit requests
//!
//! ## Shutdown
//! Once the loop has observed an exit request it delivers everything queued
//! before the request. Messages arriving after that are handled per
//! [`ShutdownPolicy`]. Messages posted after the thread has
//! stopped are dropped with a warning. A dropped invoke message releases a
//! caller blocked on it.

pub(crate) mod dispatcher;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use lazy_static::lazy_static;

use crate::config::{ShutdownPolicy, ThreadConfig, DEFAULT_THREAD_NAME_PREFIX};
use crate::error::{MessageError, ThreadError};
use crate::message::Message;
use crate::signal::Signal;

use self::dispatcher::EventDispatcher;

lazy_static! {
    /// Live execution contexts known to the runtime.
    static ref CONTEXTS: Mutex<HashMap<std::thread::ThreadId, Weak<ThreadData>>> =
        Mutex::new(HashMap::new());
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadRef>> = const { RefCell::new(None) };
}

/// States a thread can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread has been created but not started yet
    Created,
    /// Event loop is running
    Running,
    /// Exit has been requested, the loop has not stopped yet
    Stopping,
    /// Event loop has stopped
    Stopped,
}

pub(crate) struct ThreadData {
    id: u64,
    name: String,
    adopted: bool,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    event_capacity: usize,
    /// Created on first use, so adopting a context never touches the OS.
    dispatcher: OnceLock<EventDispatcher>,
    state: Mutex<ThreadState>,
    state_changed: Condvar,
    exit_requested: AtomicBool,
    exit_code: AtomicI32,
    finished: Signal<ThreadRef>,
}

impl ThreadData {
    fn new(name: String, event_capacity: usize, adopted: bool) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let (sender, receiver) = flume::unbounded();
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            adopted,
            sender,
            receiver,
            event_capacity,
            dispatcher: OnceLock::new(),
            state: Mutex::new(if adopted {
                ThreadState::Running
            } else {
                ThreadState::Created
            }),
            state_changed: Condvar::new(),
            exit_requested: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            finished: Signal::new(),
        }
    }

    fn dispatcher(&self) -> std::io::Result<&EventDispatcher> {
        if let Some(dispatcher) = self.dispatcher.get() {
            return Ok(dispatcher);
        }
        let dispatcher = EventDispatcher::new(self.event_capacity)?;
        tracing::trace!(thread = %self.name, "Created event dispatcher");
        Ok(self.dispatcher.get_or_init(move || dispatcher))
    }

    /// Interrupt the dispatcher wait. Without a dispatcher nobody can be
    /// waiting in it.
    fn wake(&self) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.wake();
        }
    }

    fn set_state(&self, state: ThreadState) {
        *self.state.lock().unwrap() = state;
        self.state_changed.notify_all();
    }

    /// Deliver the messages queued at the time of the call, in FIFO order.
    fn dispatch_snapshot(&self) -> usize {
        let snapshot = self.receiver.len();
        let mut delivered = 0;
        for _ in 0..snapshot {
            let Ok(msg) = self.receiver.try_recv() else {
                break;
            };
            self.deliver(msg);
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, msg: Message) {
        let kind = msg.kind();
        let result = panic::catch_unwind(AssertUnwindSafe(|| msg.deliver()));
        if let Err(e) = result {
            let panic_msg = if let Some(s) = e.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = e.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic".to_string()
            };
            tracing::error!(
                thread = %self.name,
                kind = kind.value(),
                panic = %panic_msg,
                "Message handler panicked"
            );
        }
    }

    /// Run one dispatcher iteration: deliver the queue snapshot, then wait
    /// for OS events, timers or new messages.
    fn process_events(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.dispatch_snapshot();

        if self.exit_requested.load(Ordering::Acquire) {
            return Ok(());
        }

        let timeout = if self.receiver.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        self.dispatcher()?.process_events(timeout)
    }

    fn exec(&self, config: &ThreadConfig) {
        while !self.exit_requested.load(Ordering::Acquire) {
            if let Err(e) = self.process_events(config.idle_timeout) {
                tracing::error!(thread = %self.name, error = %e, "Event dispatcher failed, stopping loop");
                break;
            }
        }

        // Work queued before the exit request still runs.
        let delivered = self.dispatch_snapshot();
        if config.shutdown_policy == ShutdownPolicy::DrainPending {
            while self.dispatch_snapshot() > 0 {}
        }
        tracing::trace!(thread = %self.name, delivered, "Delivered messages queued before exit");
    }

    /// Drop everything left in the queue. Only called once the thread is
    /// stopped, so no further message can be enqueued.
    fn discard_pending(&self) -> usize {
        let mut dropped = 0;
        while let Ok(msg) = self.receiver.try_recv() {
            drop(msg);
            dropped += 1;
        }
        dropped
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        let mut contexts = CONTEXTS.lock().unwrap();
        contexts.retain(|_, weak| weak.strong_count() > 0);
    }
}

/// A shared handle identifying a thread.
///
/// Handles compare equal when they refer to the same thread. They are cheap
/// to clone and may be used from any thread.
#[derive(Clone)]
pub struct ThreadRef {
    data: Arc<ThreadData>,
}

impl ThreadRef {
    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Whether this handle refers to the calling thread.
    pub fn is_current(&self) -> bool {
        *self == Thread::current()
    }

    /// Whether the thread was adopted rather than started by [`Thread::start`].
    pub fn is_adopted(&self) -> bool {
        self.data.adopted
    }

    pub fn state(&self) -> ThreadState {
        *self.data.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ThreadState::Running)
    }

    pub fn exit_code(&self) -> i32 {
        self.data.exit_code.load(Ordering::Acquire)
    }

    /// Number of messages waiting in the queue (snapshot in time).
    pub fn queued_messages(&self) -> usize {
        self.data.receiver.len()
    }

    /// Signal emitted from the thread itself when its event loop ends.
    pub fn finished(&self) -> &Signal<ThreadRef> {
        &self.data.finished
    }

    /// Enqueue `msg` for delivery on this thread.
    ///
    /// Safe to call from any thread, including this one. Messages posted to
    /// a thread that has not started yet are delivered once it starts.
    /// Messages posted to a stopped thread, or addressed to an object that
    /// has been destroyed, are dropped.
    pub fn post_message(&self, msg: Message) -> Result<(), MessageError> {
        if msg.receiver_gone() {
            tracing::trace!(thread = %self.data.name, kind = msg.kind().value(), "Receiver destroyed, not posting");
            return Err(MessageError::ReceiverGone);
        }

        let state = self.data.state.lock().unwrap();
        if *state == ThreadState::Stopped {
            drop(state);
            tracing::warn!(thread = %self.data.name, kind = msg.kind().value(), "Posting message to stopped thread, dropping it");
            drop(msg);
            return Err(MessageError::ThreadStopped(self.data.name.clone()));
        }

        tracing::trace!(thread = %self.data.name, kind = msg.kind().value(), "Posting message");
        // The receiver lives as long as `data`, so the send cannot fail.
        let _ = self.data.sender.send(msg);
        drop(state);

        self.data.wake();
        Ok(())
    }

    /// Deliver the messages currently queued to this thread.
    ///
    /// Only valid from the thread itself; used by contexts that drive their
    /// own dispatcher instead of running [`Thread::start`]'s loop.
    pub fn dispatch_messages(&self) -> Result<usize, ThreadError> {
        if !self.is_current() {
            return Err(ThreadError::NotCurrent(self.data.name.clone()));
        }
        Ok(self.data.dispatch_snapshot())
    }

    /// Run a single dispatcher iteration on this thread: deliver queued
    /// messages, then wait up to `timeout` for OS events and timers.
    pub fn process_events(&self, timeout: Option<Duration>) -> Result<(), ThreadError> {
        if !self.is_current() {
            return Err(ThreadError::NotCurrent(self.data.name.clone()));
        }
        self.data.process_events(timeout)?;
        Ok(())
    }

    /// Request the event loop to stop with `code`. Idempotent; the first
    /// code wins.
    pub fn exit(&self, code: i32) {
        {
            let mut state = self.data.state.lock().unwrap();
            if self.data.exit_requested.swap(true, Ordering::AcqRel) {
                return;
            }
            self.data.exit_code.store(code, Ordering::Release);
            if *state == ThreadState::Running {
                *state = ThreadState::Stopping;
            }
        }
        tracing::debug!(thread = %self.data.name, code, "Exit requested");
        self.data.wake();
    }

    /// The dispatcher of this thread, created on first use.
    pub(crate) fn dispatcher(&self) -> std::io::Result<&EventDispatcher> {
        self.data.dispatcher()
    }

    /// The dispatcher of this thread if it has been created. Nothing can be
    /// registered with a thread that has none.
    pub(crate) fn existing_dispatcher(&self) -> Option<&EventDispatcher> {
        self.data.dispatcher.get()
    }

    fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.data.state.lock().unwrap();
        loop {
            match *state {
                ThreadState::Stopped => return true,
                // Never started: nothing to wait for
                ThreadState::Created => return true,
                _ => {}
            }
            match deadline {
                None => state = self.data.state_changed.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .data
                        .state_changed
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
        }
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for ThreadRef {}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRef")
            .field("id", &self.data.id)
            .field("name", &self.data.name)
            .field("adopted", &self.data.adopted)
            .finish()
    }
}

/// An event-loop thread.
///
/// The owner controls the lifecycle; [`ThreadRef`] handles obtained from
/// [`handle`](Self::handle) identify the thread elsewhere. Dropping a running
/// thread is a misuse: the drop requests exit and joins the thread.
pub struct Thread {
    data: ThreadRef,
    config: ThreadConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Thread {
    pub fn new() -> Result<Self, ThreadError> {
        Self::with_config(ThreadConfig::default())
    }

    pub fn with_config(config: ThreadConfig) -> Result<Self, ThreadError> {
        static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

        let name = config.name.clone().unwrap_or_else(|| {
            format!(
                "{}{}",
                DEFAULT_THREAD_NAME_PREFIX,
                NEXT_NAME.fetch_add(1, Ordering::Relaxed)
            )
        });
        let data = ThreadData::new(name, config.event_capacity, false);
        // Spawned threads always poll, so surface dispatcher failures here.
        data.dispatcher()?;

        Ok(Self {
            data: ThreadRef {
                data: Arc::new(data),
            },
            config,
            handle: Mutex::new(None),
        })
    }

    /// Handle of the calling execution context.
    ///
    /// Never fails: an adopted context only creates its event dispatcher
    /// when something is registered with it or it processes events.
    pub fn current() -> ThreadRef {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if let Some(thread) = current.as_ref() {
                return thread.clone();
            }
            let thread = Self::adopt();
            *current = Some(thread.clone());
            thread
        })
    }

    fn adopt() -> ThreadRef {
        let os_thread = std::thread::current();
        let name = os_thread
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", os_thread.id()));
        let data = Arc::new(ThreadData::new(
            name,
            crate::config::DEFAULT_EVENT_CAPACITY,
            true,
        ));

        CONTEXTS
            .lock()
            .unwrap()
            .insert(os_thread.id(), Arc::downgrade(&data));
        tracing::debug!(thread = %data.name, "Adopted execution context");

        ThreadRef { data }
    }

    /// Look up the runtime handle of an OS thread, if it is known.
    pub fn lookup(id: std::thread::ThreadId) -> Option<ThreadRef> {
        CONTEXTS
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|data| ThreadRef { data })
    }

    pub fn handle(&self) -> ThreadRef {
        self.data.clone()
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn state(&self) -> ThreadState {
        self.data.state()
    }

    pub fn is_running(&self) -> bool {
        self.data.is_running()
    }

    pub fn exit_code(&self) -> i32 {
        self.data.exit_code()
    }

    pub fn finished(&self) -> &Signal<ThreadRef> {
        self.data.finished()
    }

    pub fn post_message(&self, msg: Message) -> Result<(), MessageError> {
        self.data.post_message(msg)
    }

    /// Start the event loop on a new OS thread.
    pub fn start(&self) -> Result<(), ThreadError> {
        {
            let mut state = self.data.data.state.lock().unwrap();
            match *state {
                ThreadState::Created => *state = ThreadState::Running,
                _ => return Err(ThreadError::AlreadyStarted(self.data.name().to_string())),
            }
        }

        let thread = self.data.clone();
        let config = self.config.clone();
        let mut builder = std::thread::Builder::new().name(self.data.name().to_string());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        let spawned = builder.spawn(move || Self::thread_main(thread, config));
        match spawned {
            Ok(handle) => {
                *self.handle.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.data.data.set_state(ThreadState::Created);
                Err(ThreadError::Spawn {
                    name: self.data.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Request the event loop to stop. Idempotent.
    pub fn exit(&self, code: i32) {
        self.data.exit(code);
    }

    /// Block until the thread has stopped, or until `timeout` elapses.
    ///
    /// Returns `Ok(true)` if the thread has stopped (or was never started).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, ThreadError> {
        if self.data.is_current() {
            return Err(ThreadError::WaitFromSelf(self.data.name().to_string()));
        }

        if !self.data.wait_stopped(timeout) {
            return Ok(false);
        }

        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!(thread = %self.data.name(), "Thread terminated by panic");
            }
        }
        Ok(true)
    }

    fn thread_main(thread: ThreadRef, config: ThreadConfig) {
        let data = Arc::clone(&thread.data);
        CURRENT.with(|current| *current.borrow_mut() = Some(thread.clone()));
        CONTEXTS
            .lock()
            .unwrap()
            .insert(std::thread::current().id(), Arc::downgrade(&data));

        crate::log_lifecycle!(data.name.as_str(), "started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| data.exec(&config)));
        if result.is_err() {
            tracing::error!(thread = %data.name, "Event loop panicked");
        }

        data.finished.emit(thread.clone());

        data.set_state(ThreadState::Stopped);
        let dropped = data.discard_pending();
        if dropped > 0 {
            tracing::debug!(thread = %data.name, dropped, "Dropped messages queued at exit");
        }

        CONTEXTS
            .lock()
            .unwrap()
            .remove(&std::thread::current().id());
        CURRENT.with(|current| current.borrow_mut().take());

        crate::log_lifecycle!(data.name.as_str(), "stopped", code = data.exit_code.load(Ordering::Acquire));
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if matches!(self.state(), ThreadState::Running | ThreadState::Stopping) {
            tracing::error!(thread = %self.name(), "Thread destroyed while running");
            self.exit(0);
        }
        if !self.data.is_current() {
            let _ = self.wait(None);
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.data.name())
            .field("state", &self.state())
            .field("has_handle", &self.handle.lock().unwrap().is_some())
            .finish()
    }
}
