//! # Bound Methods
//!
//! A [`BoundMethod`] packages a callable with the object whose thread it
//! must run in and a [`ConnectionType`]. Activating it with an
//! [`ArgumentPack`] either calls it right away or turns it into an invoke
//! message for the receiver's thread.
//!
//! The receiver is held weakly: a bound method never keeps its target
//! alive, and a target that has been destroyed is simply not invoked.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::message::Invocation;
use crate::object::{HasObject, Object, WeakObject};
use crate::semaphore::Semaphore;
use crate::thread::Thread;

/// How a bound method is activated relative to the caller's thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Direct if the caller lives in the receiver's thread, Queued otherwise.
    #[default]
    Auto,
    /// Invoked immediately and synchronously in the caller's thread.
    Direct,
    /// Invoked in the receiver's thread when control returns to its event
    /// loop. The caller does not wait.
    Queued,
    /// Invoked in the receiver's thread; the caller blocks until the
    /// invocation completes. Must not be used when the caller lives in the
    /// receiver's thread, as it would deadlock.
    Blocking,
}

/// Arguments of one invocation and the slot receiving its return value.
pub struct ArgumentPack<A, R = ()> {
    args: Mutex<Option<A>>,
    ret: Mutex<Option<R>>,
}

impl<A, R> ArgumentPack<A, R> {
    pub fn new(args: A) -> Self {
        Self {
            args: Mutex::new(Some(args)),
            ret: Mutex::new(None),
        }
    }

    /// Take the return value, if the invocation produced one.
    ///
    /// Only meaningful when [`BoundMethod::activate_pack`] returned `true`.
    pub fn take_return(&self) -> Option<R> {
        self.ret.lock().unwrap().take()
    }

    pub fn has_return(&self) -> bool {
        self.ret.lock().unwrap().is_some()
    }

    fn take_args(&self) -> Option<A> {
        self.args.lock().unwrap().take()
    }

    fn set_return(&self, value: R) {
        *self.ret.lock().unwrap() = Some(value);
    }
}

impl<A, R> fmt::Debug for ArgumentPack<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentPack")
            .field("consumed", &self.args.lock().unwrap().is_none())
            .field("has_return", &self.has_return())
            .finish()
    }
}

type Callable<A, R> = Box<dyn Fn(A) -> Option<R> + Send + Sync>;
type Liveness = Box<dyn Fn() -> bool + Send + Sync>;

/// A callable bound to a receiver object and a connection type.
pub struct BoundMethod<A, R = ()> {
    receiver: Option<WeakObject>,
    connection: ConnectionType,
    call: Callable<A, R>,
    alive: Liveness,
}

impl<A, R> BoundMethod<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Bind `method` to `target`. The method runs with a borrow of the
    /// target, which is only held weakly by the bound method.
    pub fn new<T, F>(target: &Arc<T>, method: F, connection: ConnectionType) -> Self
    where
        T: HasObject + Send + Sync + 'static,
        F: Fn(&T, A) -> R + Send + Sync + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        let probe = weak.clone();
        Self {
            receiver: Some(target.object().downgrade()),
            connection,
            call: Box::new(move |args| weak.upgrade().map(|target| method(&target, args))),
            alive: Box::new(move || probe.strong_count() > 0),
        }
    }

    /// Bind a closure to the thread affinity of `object`. The closure is not
    /// invoked once the object has been destroyed.
    pub fn with_object<F>(object: &Object, function: F, connection: ConnectionType) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let weak = object.downgrade();
        let probe = weak.clone();
        Self {
            receiver: Some(object.downgrade()),
            connection,
            call: Box::new(move |args| weak.upgrade().map(|_object| function(args))),
            alive: Box::new(move || probe.upgrade().is_some()),
        }
    }

    /// Bind a closure without thread affinity. It is always invoked
    /// directly in the caller's thread.
    pub fn free<F>(function: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Self {
            receiver: None,
            connection: ConnectionType::Direct,
            call: Box::new(move |args| Some(function(args))),
            alive: Box::new(|| true),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection
    }

    /// The receiver object, if any and still alive.
    pub fn receiver(&self) -> Option<Object> {
        self.receiver.as_ref().and_then(WeakObject::upgrade)
    }

    pub(crate) fn is_bound_to(&self, object: &Object) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|weak| weak.refers_to(object))
    }

    /// Whether the target still exists.
    pub fn is_alive(&self) -> bool {
        (self.alive)()
    }

    /// Activate the method with `pack`.
    ///
    /// Returns `true` if the return slot of `pack` may be read by the
    /// caller: the invocation ran synchronously (Direct) or the caller was
    /// blocked until it completed (Blocking). Returns `false` for Queued
    /// invocations, whose return value is written at an unspecified later
    /// time, when the receiver no longer exists, and for Blocking
    /// invocations that were dropped by the receiver's thread without
    /// running.
    ///
    /// Queued and Blocking activations hand `self` to the invoke message;
    /// a method not referenced elsewhere is released together with the
    /// message once it has been executed.
    pub fn activate_pack(self: Arc<Self>, pack: Arc<ArgumentPack<A, R>>) -> bool {
        let Some(receiver) = self.receiver.as_ref() else {
            self.invoke_pack(&pack);
            return true;
        };
        let Some(object) = receiver.upgrade() else {
            tracing::trace!("Receiver destroyed, skipping invocation");
            return false;
        };

        let thread = object.thread();
        let connection = match self.connection {
            ConnectionType::Auto if Thread::current() == thread => ConnectionType::Direct,
            ConnectionType::Auto => ConnectionType::Queued,
            other => other,
        };

        match connection {
            ConnectionType::Direct | ConnectionType::Auto => {
                self.invoke_pack(&pack);
                true
            }
            ConnectionType::Queued => {
                let msg = InvokeMessage {
                    method: self,
                    pack,
                    semaphore: None,
                };
                if let Err(e) = object.post_invocation(Box::new(msg)) {
                    tracing::debug!(error = %e, "Queued invocation not posted");
                }
                false
            }
            ConnectionType::Blocking => {
                if thread.is_current() {
                    tracing::error!(thread = %thread.name(), "Blocking invocation within the receiver's thread");
                }
                debug_assert!(
                    !thread.is_current(),
                    "blocking invocation within the receiver's thread deadlocks"
                );

                let semaphore = Arc::new(Semaphore::new(0));
                let msg = InvokeMessage {
                    method: self,
                    pack: Arc::clone(&pack),
                    semaphore: Some(Arc::clone(&semaphore)),
                };
                if let Err(e) = object.post_invocation(Box::new(msg)) {
                    tracing::debug!(error = %e, "Blocking invocation not posted");
                    return false;
                }
                // Waiting must not keep the receiver alive.
                drop(object);

                semaphore.acquire();
                // Only an invocation that ran fills the return slot.
                pack.has_return()
            }
        }
    }

    /// Invoke synchronously in the calling thread, storing the return value
    /// in `pack`.
    pub fn invoke_pack(&self, pack: &ArgumentPack<A, R>) {
        let Some(args) = pack.take_args() else {
            return;
        };
        if let Some(ret) = (self.call)(args) {
            pack.set_return(ret);
        }
    }
}

impl<A, R> fmt::Debug for BoundMethod<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("connection", &self.connection)
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// Invocation of a bound method carried by a message.
///
/// The semaphore of a blocking invocation is released when the message is
/// dropped: after the call when it was delivered, or without a call when
/// the message was discarded.
struct InvokeMessage<A, R> {
    method: Arc<BoundMethod<A, R>>,
    pack: Arc<ArgumentPack<A, R>>,
    semaphore: Option<Arc<Semaphore>>,
}

impl<A, R> Invocation for InvokeMessage<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn invoke(self: Box<Self>) {
        self.method.invoke_pack(&self.pack);
    }
}

impl<A, R> Drop for InvokeMessage<A, R> {
    fn drop(&mut self) {
        if let Some(semaphore) = self.semaphore.take() {
            semaphore.release();
        }
    }
}

/// Invoke `method` on `target` once, per `connection`.
///
/// Returns the method's return value when it is available to the caller:
/// for Direct invocations (including Auto resolving to Direct) and Blocking
/// invocations. Queued invocations return `None`.
pub fn invoke_method<T, A, R, F>(
    target: &Arc<T>,
    method: F,
    connection: ConnectionType,
    args: A,
) -> Option<R>
where
    T: HasObject + Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(&T, A) -> R + Send + Sync + 'static,
{
    let bound = Arc::new(BoundMethod::new(target, method, connection));
    let pack = Arc::new(ArgumentPack::new(args));
    if bound.activate_pack(Arc::clone(&pack)) {
        pack.take_return()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        object: Object,
        hits: AtomicUsize,
    }

    impl HasObject for Counter {
        fn object(&self) -> &Object {
            &self.object
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            object: Object::new(),
            hits: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_auto_same_thread_runs_directly() {
        let target = counter();
        let ret = invoke_method(
            &target,
            |c: &Counter, n: usize| c.hits.fetch_add(n, Ordering::SeqCst) + n,
            ConnectionType::Auto,
            5,
        );
        assert_eq!(ret, Some(5));
        assert_eq!(target.hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_free_method_is_direct() {
        let method = Arc::new(BoundMethod::free(|x: i32| x * 2));
        let pack = Arc::new(ArgumentPack::new(21));
        assert!(method.activate_pack(Arc::clone(&pack)));
        assert_eq!(pack.take_return(), Some(42));
    }

    #[test]
    fn test_destroyed_target_is_not_invoked() {
        let target = counter();
        let method = Arc::new(BoundMethod::new(
            &target,
            |c: &Counter, ()| c.hits.fetch_add(1, Ordering::SeqCst),
            ConnectionType::Direct,
        ));
        assert!(method.is_alive());
        drop(target);

        assert!(!method.is_alive());
        let pack = Arc::new(ArgumentPack::new(()));
        assert!(!method.activate_pack(Arc::clone(&pack)));
        assert!(!pack.has_return());
    }

    #[test]
    fn test_queued_same_thread_is_deferred() {
        let target = counter();
        let ret = invoke_method(
            &target,
            |c: &Counter, ()| c.hits.fetch_add(1, Ordering::SeqCst),
            ConnectionType::Queued,
            (),
        );
        assert!(ret.is_none());
        assert_eq!(target.hits.load(Ordering::SeqCst), 0);
        assert_eq!(target.object.pending_messages(), 1);

        Thread::current().dispatch_messages().unwrap();
        assert_eq!(target.hits.load(Ordering::SeqCst), 1);
        assert_eq!(target.object.pending_messages(), 0);
    }

    #[test]
    fn test_pack_args_consumed_once() {
        let method = BoundMethod::free(|x: u8| x);
        let pack = ArgumentPack::new(1u8);
        method.invoke_pack(&pack);
        assert_eq!(pack.take_return(), Some(1));

        method.invoke_pack(&pack);
        assert!(!pack.has_return());
    }
}
