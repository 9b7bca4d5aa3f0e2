// Integration tests for event notifiers and timers bound to worker threads


use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_helpers::{started_thread, stop, wait_until, DEFAULT_WAIT};
use threadbound::{
    EventError, EventNotifier, HasObject, NotifierType, Object, Thread, ThreadRef, Timer,
};

struct Pipe {
    read: RawFd,
    write: RawFd,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "pipe() failed");
        Self {
            read: fds[0],
            write: fds[1],
        }
    }

    fn send(&self, data: &[u8]) {
        let ret = unsafe { libc::write(self.write, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(ret, data.len() as isize);
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

fn read_fd(fd: RawFd) -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    assert!(ret >= 0, "read() failed");
    String::from_utf8_lossy(&buf[..ret as usize]).into_owned()
}

struct Handler {
    object: Object,
    notifier: EventNotifier,
    notified: AtomicUsize,
    data: Mutex<String>,
    ran_on: Mutex<Option<ThreadRef>>,
}

impl HasObject for Handler {
    fn object(&self) -> &Object {
        &self.object
    }
}

impl Handler {
    fn new(fd: RawFd) -> Arc<Self> {
        let object = Object::new();
        let notifier = EventNotifier::new(fd, NotifierType::Read, Some(&object)).unwrap();
        let handler = Arc::new(Self {
            object,
            notifier,
            notified: AtomicUsize::new(0),
            data: Mutex::new(String::new()),
            ran_on: Mutex::new(None),
        });
        handler.notifier.activated().connect(&handler, Handler::on_readable);
        handler
    }

    fn on_readable(&self, notifier: EventNotifier) {
        *self.data.lock().unwrap() = read_fd(notifier.fd());
        *self.ran_on.lock().unwrap() = Some(Thread::current());
        self.notified.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_readiness_before_move_is_observed_by_new_thread() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let handler = Handler::new(pipe.read);

    pipe.send(b"H2G2");
    handler.move_to_thread(&thread.handle());
    assert_eq!(handler.notifier.thread(), thread.handle());

    std::thread::sleep(Duration::from_millis(100));
    stop(&thread);

    assert_eq!(handler.notified.load(Ordering::SeqCst), 1);
    assert_eq!(*handler.data.lock().unwrap(), "H2G2");
    assert_eq!(*handler.ran_on.lock().unwrap(), Some(thread.handle()));

    drop(handler);
}

#[test]
fn test_notifier_on_worker_fires_per_write() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let handler = Handler::new(pipe.read);
    handler.move_to_thread(&thread.handle());

    pipe.send(b"one");
    assert!(wait_until(DEFAULT_WAIT, || handler.notified.load(Ordering::SeqCst) == 1));
    assert_eq!(*handler.data.lock().unwrap(), "one");

    pipe.send(b"two");
    assert!(wait_until(DEFAULT_WAIT, || handler.notified.load(Ordering::SeqCst) == 2));
    assert_eq!(*handler.data.lock().unwrap(), "two");

    stop(&thread);
}

#[test]
fn test_disabled_notifier_is_silent_until_enabled() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let object = Object::new();
    object.move_to_thread(&thread.handle());

    let notifier = EventNotifier::new(pipe.read, NotifierType::Read, Some(&object)).unwrap();
    assert!(notifier.is_enabled());
    assert!(notifier.is_registered());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    notifier.activated().connect_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    notifier.set_enabled(false).unwrap();
    assert!(!notifier.is_registered());
    pipe.send(b"x");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Readiness that arose while disabled is reported on enable.
    notifier.set_enabled(true).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || hits.load(Ordering::SeqCst) == 1));

    drop(notifier);
    stop(&thread);
}

#[test]
fn test_disabled_notifier_stays_unregistered_after_move() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let object = Object::new();
    let notifier = EventNotifier::new(pipe.read, NotifierType::Read, Some(&object)).unwrap();
    notifier.set_enabled(false).unwrap();

    object.move_to_thread(&thread.handle());

    assert_eq!(notifier.thread(), thread.handle());
    assert!(!notifier.is_enabled());
    assert!(!notifier.is_registered());

    notifier.set_enabled(true).unwrap();
    assert!(notifier.is_registered());

    stop(&thread);
}

#[test]
fn test_notifier_cannot_be_enabled_on_stopped_thread() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let object = Object::new();
    object.move_to_thread(&thread.handle());

    let notifier = EventNotifier::new(pipe.read, NotifierType::Read, Some(&object)).unwrap();
    notifier.set_enabled(false).unwrap();
    stop(&thread);

    assert!(matches!(
        notifier.set_enabled(true),
        Err(EventError::ThreadStopped(name)) if name == thread.name()
    ));
    assert!(!notifier.is_registered());
    drop(notifier);

    let other = Pipe::new();
    assert!(matches!(
        EventNotifier::new(other.read, NotifierType::Read, Some(&object)),
        Err(EventError::ThreadStopped(_))
    ));
}

#[test]
fn test_write_notifier_reports_writable_pipe() {
    let thread = started_thread();
    let pipe = Pipe::new();
    let object = Object::new();
    object.move_to_thread(&thread.handle());

    let notifier = EventNotifier::new(pipe.write, NotifierType::Write, Some(&object)).unwrap();
    assert_eq!(notifier.kind(), NotifierType::Write);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    notifier.activated().connect_fn(move |n: EventNotifier| {
        assert_eq!(n.kind(), NotifierType::Write);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(DEFAULT_WAIT, || hits.load(Ordering::SeqCst) >= 1));

    drop(notifier);
    stop(&thread);
}

#[test]
fn test_timer_fires_on_its_thread() {
    let thread = started_thread();
    let object = Object::new();
    object.move_to_thread(&thread.handle());

    let timer = Timer::new(Some(&object));
    let fired_on = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&fired_on);
    timer
        .timeout()
        .connect_fn(move |_| record.lock().unwrap().push(Thread::current()));

    timer.start(Duration::from_millis(10)).unwrap();
    assert!(wait_until(DEFAULT_WAIT, || !fired_on.lock().unwrap().is_empty()));
    std::thread::sleep(Duration::from_millis(30));

    assert_eq!(*fired_on.lock().unwrap(), vec![thread.handle()]);
    assert!(!timer.is_running());

    stop(&thread);
}

#[test]
fn test_armed_timer_follows_its_object() {
    let thread = started_thread();
    let object = Object::new();
    let timer = Timer::new(Some(&object));
    let fired_on = Arc::new(Mutex::new(None));
    let record = Arc::clone(&fired_on);
    timer
        .timeout()
        .connect_fn(move |_| *record.lock().unwrap() = Some(Thread::current()));

    timer.start(Duration::from_millis(30)).unwrap();
    object.move_to_thread(&thread.handle());
    assert!(timer.is_running());

    assert!(wait_until(DEFAULT_WAIT, || fired_on.lock().unwrap().is_some()));
    assert_eq!(*fired_on.lock().unwrap(), Some(thread.handle()));

    stop(&thread);
}
