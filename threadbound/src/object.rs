//! # Objects
//!
//! [`Object`] is the thread-affinity capability embedded in every long-lived
//! entity of the framework. It records the thread the entity lives in,
//! receives messages through that thread's event loop, and carries the OS
//! event sources registered on the entity's behalf.
//!
//! ## Key Concepts
//! - Affinity: many objects share one thread; [`Object::move_to_thread`]
//!   changes it at runtime for the object and all of its children
//! - Relocation: event sources registered by an object (and its children)
//!   are moved to the new thread's dispatcher before the move returns, so
//!   readiness that is already pending is observed by the new thread
//! - Embedding: types embed an `Object` and implement [`HasObject`] to become
//!   targets of signals and [`invoke_method`](crate::invoke_method)

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::MessageError;
use crate::message::{Invocation, Message, MessagePayload, MessageType};
use crate::thread::dispatcher::EventSource;
use crate::thread::{Thread, ThreadRef};

type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

pub(crate) struct ObjectInner {
    thread: RwLock<ThreadRef>,
    parent: Option<WeakObject>,
    children: Mutex<Vec<Weak<ObjectInner>>>,
    sources: Mutex<Vec<Weak<dyn EventSource>>>,
    pending: AtomicUsize,
    handler: RwLock<Option<MessageHandler>>,
}

/// Thread-affinity capability.
///
/// Cloning an `Object` yields another handle to the same object.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

/// A non-owning reference to an [`Object`].
#[derive(Clone)]
pub struct WeakObject {
    inner: Weak<ObjectInner>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.inner.upgrade().map(|inner| Object { inner })
    }

    /// Whether this reference points to `object`.
    pub fn refers_to(&self, object: &Object) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&object.inner))
    }
}

impl fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObject")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Implemented by types that embed an [`Object`].
pub trait HasObject {
    fn object(&self) -> &Object;

    fn thread(&self) -> ThreadRef {
        self.object().thread()
    }

    fn move_to_thread(&self, thread: &ThreadRef) {
        self.object().move_to_thread(thread)
    }
}

impl HasObject for Object {
    fn object(&self) -> &Object {
        self
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl Object {
    /// Create an object living in the calling thread.
    pub fn new() -> Self {
        Self::build(Thread::current(), None)
    }

    /// Create a child of `parent`, living in the parent's thread. The child
    /// follows its parent when the parent moves.
    pub fn with_parent(parent: &Object) -> Self {
        let child = Self::build(parent.thread(), Some(parent.downgrade()));
        let mut children = parent.inner.children.lock().unwrap();
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child.inner));
        drop(children);
        child
    }

    fn build(thread: ThreadRef, parent: Option<WeakObject>) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                thread: RwLock::new(thread),
                parent,
                children: Mutex::new(Vec::new()),
                sources: Mutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
                handler: RwLock::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn thread(&self) -> ThreadRef {
        self.inner.thread.read().unwrap().clone()
    }

    pub fn parent(&self) -> Option<Object> {
        self.inner.parent.as_ref().and_then(WeakObject::upgrade)
    }

    pub fn children(&self) -> Vec<Object> {
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Object { inner })
            .collect()
    }

    /// Number of messages addressed to this object that have not been
    /// delivered or dropped yet.
    pub fn pending_messages(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Install the handler receiving user messages and thread-move
    /// notifications addressed to this object. Replaces any previous
    /// handler.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        *self.inner.handler.write().unwrap() = Some(Arc::new(handler));
    }

    /// Post a user message carrying `payload` to this object. The handler
    /// runs on the object's thread.
    pub fn post_message<P: MessagePayload>(
        &self,
        kind: MessageType,
        payload: P,
    ) -> Result<(), MessageError> {
        self.thread().post_message(Message::new(kind, self, payload))
    }

    pub(crate) fn post_invocation(&self, invocation: Box<dyn Invocation>) -> Result<(), MessageError> {
        self.thread()
            .post_message(Message::invoke(Some(self), invocation))
    }

    pub(crate) fn handle_message(&self, msg: &Message) {
        let handler = self.inner.handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(msg);
        }
    }

    pub(crate) fn message_posted(&self) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn message_finished(&self) {
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn add_source(&self, source: Weak<dyn EventSource>) {
        let mut sources = self.inner.sources.lock().unwrap();
        sources.retain(|weak| weak.strong_count() > 0);
        sources.push(source);
    }

    fn collect_subtree(&self, out: &mut Vec<Object>) {
        out.push(self.clone());
        for child in self.children() {
            child.collect_subtree(out);
        }
    }

    /// Change the thread affinity of this object and its children to
    /// `thread`.
    ///
    /// The caller must ensure no message addressed to the moved objects is
    /// in flight. Every object of the subtree is first notified with a
    /// `THREAD_MOVE` message, then re-bound to `thread`; finally the event
    /// sources of the subtree are deregistered from the old dispatcher and
    /// registered with the new one.
    pub fn move_to_thread(&self, thread: &ThreadRef) {
        let old = self.thread();
        if old == *thread {
            return;
        }

        let mut subtree = Vec::new();
        self.collect_subtree(&mut subtree);

        for object in &subtree {
            let pending = object.pending_messages();
            if pending > 0 {
                tracing::error!(pending, from = %old.name(), to = %thread.name(), "Moving object with messages in flight");
            }
            debug_assert_eq!(pending, 0, "object moved with messages in flight");
        }

        for object in &subtree {
            let notice = Message::thread_move(object);
            object.handle_message(&notice);
        }

        for object in &subtree {
            *object.inner.thread.write().unwrap() = thread.clone();
        }

        for object in &subtree {
            let sources: Vec<Arc<dyn EventSource>> = object
                .inner
                .sources
                .lock()
                .unwrap()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for source in sources {
                source.relocate(thread);
            }
        }

        tracing::debug!(
            from = %old.name(),
            to = %thread.name(),
            objects = subtree.len(),
            "Moved object to thread"
        );
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("thread", &self.thread().name())
            .field("pending", &self.pending_messages())
            .field("children", &self.inner.children.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Thread;

    #[test]
    fn test_new_object_lives_in_current_thread() {
        let object = Object::new();
        assert_eq!(object.thread(), Thread::current());
        assert!(object.parent().is_none());
    }

    #[test]
    fn test_child_inherits_parent_thread() {
        let worker = Thread::new().unwrap();
        let parent = Object::new();
        parent.move_to_thread(&worker.handle());

        let child = Object::with_parent(&parent);
        assert_eq!(child.thread(), worker.handle());
        assert_eq!(child.parent(), Some(parent.clone()));
        assert_eq!(parent.children(), vec![child]);
    }

    #[test]
    fn test_move_relocates_children() {
        let worker = Thread::new().unwrap();
        let parent = Object::new();
        let child = Object::with_parent(&parent);
        let grandchild = Object::with_parent(&child);

        parent.move_to_thread(&worker.handle());

        assert_eq!(parent.thread(), worker.handle());
        assert_eq!(child.thread(), worker.handle());
        assert_eq!(grandchild.thread(), worker.handle());
    }

    #[test]
    fn test_move_notifies_subtree() {
        let worker = Thread::new().unwrap();
        let parent = Object::new();
        let child = Object::with_parent(&parent);
        let notices = Arc::new(AtomicUsize::new(0));

        for object in [&parent, &child] {
            let notices = Arc::clone(&notices);
            object.set_message_handler(move |msg| {
                if msg.kind() == MessageType::THREAD_MOVE {
                    notices.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        parent.move_to_thread(&worker.handle());
        assert_eq!(notices.load(Ordering::SeqCst), 2);

        // Moving to the current thread again is a no-op.
        parent.move_to_thread(&worker.handle());
        assert_eq!(notices.load(Ordering::SeqCst), 2);
        assert_eq!(parent.pending_messages(), 0);
    }

    #[test]
    fn test_weak_object_does_not_keep_object_alive() {
        let object = Object::new();
        let weak = object.downgrade();
        assert!(weak.refers_to(&object));
        drop(object);
        assert!(weak.upgrade().is_none());
    }
}
