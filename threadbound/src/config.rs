use std::time::Duration;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "threadbound-";

// --- Configuration Enums ---

/// Determines what happens to messages posted while a thread's event loop
/// is shutting down. Messages queued before the exit request are always
/// delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Messages posted after the final delivery pass are dropped without
    /// being invoked. Blocked callers waiting on a dropped message are
    /// released.
    DropPending,
    /// Queued messages are delivered until the queue is empty before the
    /// loop stops.
    DrainPending,
}

// --- Thread Configuration ---

/// Configuration for a [`Thread`](crate::thread::Thread).
#[derive(Clone, Debug)]
pub struct ThreadConfig {
    /// Name given to the OS thread. Generated from a counter if not set.
    pub name: Option<String>,

    /// Stack size of the OS thread, platform default if not set.
    pub stack_size: Option<usize>,

    /// Number of OS events fetched per dispatcher wake-up.
    pub event_capacity: usize,

    /// Handling of queued messages at exit.
    pub shutdown_policy: ShutdownPolicy,

    /// Upper bound on a single dispatcher wait when no timer is armed.
    /// `None` blocks until woken.
    pub idle_timeout: Option<Duration>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: None,
            stack_size: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown_policy: ShutdownPolicy::DropPending,
            idle_timeout: None,
        }
    }
}

impl ThreadConfig {
    /// Create a default configuration with the given thread name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
