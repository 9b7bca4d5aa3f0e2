use std::io;

use thiserror::Error;

/// Errors related to thread lifecycle operations.
#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("Thread {0} has already been started")]
    AlreadyStarted(String),
    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Thread {0} cannot wait for itself")]
    WaitFromSelf(String),
    #[error("Thread {0} can only be driven from its own context")]
    NotCurrent(String),
    #[error("Event dispatcher error: {0}")]
    Dispatcher(#[from] io::Error),
}

/// Errors related to OS event sources (notifiers and timers).
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to register fd {fd} with the event dispatcher: {source}")]
    Register {
        fd: i32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to deregister fd {fd} from the event dispatcher: {source}")]
    Deregister {
        fd: i32,
        #[source]
        source: io::Error,
    },
    #[error("Event dispatcher unavailable: {0}")]
    Dispatcher(#[source] io::Error),
    #[error("Thread {0} has stopped, event source cannot be armed")]
    ThreadStopped(String),
}

/// Errors related to message delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Thread {0} has stopped, message dropped")]
    ThreadStopped(String),
    #[error("Message receiver no longer exists")]
    ReceiverGone,
}
