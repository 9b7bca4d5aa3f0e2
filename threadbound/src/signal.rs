//! # Signals
//!
//! A [`Signal`] holds an ordered list of connections, each a
//! [`BoundMethod`] with its own [`ConnectionType`]. Emitting the signal
//! activates every connection in insertion order.
//!
//! ## Emission semantics
//! - `emit` iterates a snapshot of the list taken when it starts; slots
//!   connected during an emission are first invoked by the next one
//! - A connection removed during an emission, before the emission reached
//!   it, is skipped; no connection is invoked twice by one emission
//! - Queued connections are not waited for; Blocking connections are
//!   completed one after the other before the next connection is activated
//! - Connections whose target has been destroyed are pruned

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bound_method::{ArgumentPack, BoundMethod, ConnectionType};
use crate::object::{HasObject, Object};

/// Identifies a connection of a [`Signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

struct Connection<A> {
    id: ConnectionId,
    method: Arc<BoundMethod<A, ()>>,
    connected: Arc<AtomicBool>,
}

impl<A> Clone for Connection<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            method: Arc::clone(&self.method),
            connected: Arc::clone(&self.connected),
        }
    }
}

/// A signal carrying arguments of type `A`.
pub struct Signal<A> {
    connections: Mutex<Vec<Connection<A>>>,
    next_id: AtomicU64,
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<A> Signal<A>
where
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `slot` of `target` with [`ConnectionType::Auto`].
    pub fn connect<T, F>(&self, target: &Arc<T>, slot: F) -> ConnectionId
    where
        T: HasObject + Send + Sync + 'static,
        F: Fn(&T, A) + Send + Sync + 'static,
    {
        self.connect_with(target, slot, ConnectionType::Auto)
    }

    pub fn connect_with<T, F>(&self, target: &Arc<T>, slot: F, connection: ConnectionType) -> ConnectionId
    where
        T: HasObject + Send + Sync + 'static,
        F: Fn(&T, A) + Send + Sync + 'static,
    {
        self.add(BoundMethod::new(target, slot, connection))
    }

    /// Connect a closure executed with the thread affinity of `object`.
    pub fn connect_object<F>(&self, object: &Object, slot: F, connection: ConnectionType) -> ConnectionId
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.add(BoundMethod::with_object(object, slot, connection))
    }

    /// Connect a closure without thread affinity, always invoked directly in
    /// the emitting thread.
    pub fn connect_fn<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.add(BoundMethod::free(slot))
    }

    fn add(&self, method: BoundMethod<A, ()>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.lock().unwrap().push(Connection {
            id,
            method: Arc::new(method),
            connected: Arc::new(AtomicBool::new(true)),
        });
        id
    }

    /// Remove the connection `id`. Returns whether it was connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.remove_where(|conn| conn.id == id) > 0
    }

    /// Remove every connection whose receiver is `object`.
    pub fn disconnect_object(&self, object: &Object) -> usize {
        self.remove_where(|conn| conn.method.is_bound_to(object))
    }

    pub fn disconnect_all(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Connection<A>) -> bool,
    {
        let mut connections = self.connections.lock().unwrap();
        let before = connections.len();
        connections.retain(|conn| {
            if predicate(conn) {
                conn.connected.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        before - connections.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .any(|conn| conn.id == id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Activate every connection with a clone of `args`.
    pub fn emit(&self, args: A) {
        let snapshot: Vec<Connection<A>> = self.connections.lock().unwrap().clone();
        let mut pruned = false;

        for conn in snapshot {
            if !conn.connected.load(Ordering::Acquire) {
                continue;
            }
            if !conn.method.is_alive() {
                pruned = true;
                continue;
            }

            let pack = Arc::new(ArgumentPack::new(args.clone()));
            conn.method.activate_pack(pack);
        }

        if pruned {
            let removed = self.remove_where(|conn| !conn.method.is_alive());
            tracing::trace!(removed, "Pruned connections to destroyed receivers");
        }
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("connections", &self.connections.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        object: Object,
        seen: Mutex<Vec<i32>>,
    }

    impl HasObject for Recorder {
        fn object(&self) -> &Object {
            &self.object
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            object: Object::new(),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_emit_in_insertion_order() {
        let signal = Signal::<i32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            signal.connect_fn(move |value| order.lock().unwrap().push((tag, value)));
        }

        signal.emit(7);
        assert_eq!(*order.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_connect_object_slot_receives_args() {
        let signal = Signal::<i32>::new();
        let target = recorder();
        signal.connect(&target, |r, value| r.seen.lock().unwrap().push(value));

        signal.emit(1);
        signal.emit(2);
        assert_eq!(*target.seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_disconnect_by_id_and_object() {
        let signal = Signal::<i32>::new();
        let a = recorder();
        let b = recorder();
        let id = signal.connect(&a, |r, v| r.seen.lock().unwrap().push(v));
        signal.connect(&b, |r, v| r.seen.lock().unwrap().push(v));
        signal.connect(&b, |r, v| r.seen.lock().unwrap().push(v * 10));

        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        assert!(!signal.is_connected(id));
        assert_eq!(signal.disconnect_object(&b.object), 2);
        assert_eq!(signal.connection_count(), 0);

        signal.emit(5);
        assert!(a.seen.lock().unwrap().is_empty());
        assert!(b.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_destroyed_receiver_is_pruned() {
        let signal = Signal::<i32>::new();
        let target = recorder();
        signal.connect(&target, |r, v| r.seen.lock().unwrap().push(v));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        signal.connect_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(target);
        signal.emit(1);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.connection_count(), 1);
    }

    #[test]
    fn test_connect_during_emit_waits_for_next_emit() {
        let signal = Arc::new(Signal::<i32>::new());
        let late_hits = Arc::new(AtomicUsize::new(0));

        let sig = Arc::clone(&signal);
        let hits = Arc::clone(&late_hits);
        let added = Arc::new(AtomicBool::new(false));
        signal.connect_fn(move |_| {
            if !added.swap(true, Ordering::SeqCst) {
                let hits = Arc::clone(&hits);
                sig.connect_fn(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        signal.emit(0);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        signal.emit(0);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);

        // Break the signal -> slot -> signal reference cycle.
        signal.disconnect_all();
    }
}
