// Integration tests for error types in threadbound::error

use std::io;

use threadbound::error::*;

#[test]
fn test_thread_error_display() {
    assert_eq!(
        ThreadError::AlreadyStarted("worker".to_string()).to_string(),
        "Thread worker has already been started"
    );
    assert_eq!(
        ThreadError::WaitFromSelf("worker".to_string()).to_string(),
        "Thread worker cannot wait for itself"
    );
    assert_eq!(
        ThreadError::NotCurrent("worker".to_string()).to_string(),
        "Thread worker can only be driven from its own context"
    );

    let spawn = ThreadError::Spawn {
        name: "worker".to_string(),
        source: io::Error::new(io::ErrorKind::OutOfMemory, "no memory"),
    };
    assert_eq!(spawn.to_string(), "Failed to spawn thread worker: no memory");
    assert!(std::error::Error::source(&spawn).is_some());
}

#[test]
fn test_dispatcher_error_from_io() {
    let err: ThreadError = io::Error::new(io::ErrorKind::Other, "epoll failed").into();
    assert!(matches!(err, ThreadError::Dispatcher(_)));
    assert_eq!(err.to_string(), "Event dispatcher error: epoll failed");
}

#[test]
fn test_event_error_display() {
    let register = EventError::Register {
        fd: 7,
        source: io::Error::from_raw_os_error(libc::EBADF),
    };
    assert!(register
        .to_string()
        .starts_with("Failed to register fd 7 with the event dispatcher:"));

    let deregister = EventError::Deregister {
        fd: 7,
        source: io::Error::from_raw_os_error(libc::ENOENT),
    };
    assert!(deregister
        .to_string()
        .starts_with("Failed to deregister fd 7 from the event dispatcher:"));

    assert_eq!(
        EventError::ThreadStopped("worker".to_string()).to_string(),
        "Thread worker has stopped, event source cannot be armed"
    );
    let dispatcher = EventError::Dispatcher(io::Error::from_raw_os_error(libc::EMFILE));
    assert!(dispatcher.to_string().starts_with("Event dispatcher unavailable:"));
}

#[test]
fn test_message_error_display() {
    assert_eq!(
        MessageError::ThreadStopped("worker".to_string()).to_string(),
        "Thread worker has stopped, message dropped"
    );
    assert_eq!(MessageError::ReceiverGone.to_string(), "Message receiver no longer exists");
}
