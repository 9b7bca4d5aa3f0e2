//! # Messages
//!
//! A [`Message`] is a unit of work addressed to a thread's queue. The event
//! loop of the receiving thread delivers it to its target object; invoke
//! messages carry a packaged method call and are executed directly there.
//!
//! ## Key Concepts
//! - Message types: built-in `INVOKE` and `THREAD_MOVE`, plus user types
//!   allocated with [`MessageType::register`]
//! - Receiver relation: a message holds a weak reference to its receiver and
//!   is discarded at delivery time if the receiver no longer exists
//! - In-flight accounting: each message addressed to an object is counted
//!   on that object until the message is delivered or dropped

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use downcast_rs::{impl_downcast, Downcast};

use crate::object::{Object, WeakObject};

/// Identifies the kind of a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(u32);

impl MessageType {
    /// A packaged method invocation.
    pub const INVOKE: MessageType = MessageType(0);
    /// Sent synchronously to an object and its children before they change
    /// thread affinity.
    pub const THREAD_MOVE: MessageType = MessageType(1);
    /// First value handed out by [`MessageType::register`].
    pub const USER: MessageType = MessageType(1000);

    /// Allocate a new, process-unique message type for user messages.
    pub fn register() -> MessageType {
        static NEXT: AtomicU32 = AtomicU32::new(MessageType::USER.0);
        MessageType(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_user(self) -> bool {
        self >= MessageType::USER
    }
}

/// Payload of a user message. Implemented for every `Send + 'static` type.
pub trait MessagePayload: Downcast + Send {}
impl_downcast!(MessagePayload);

impl<T: Downcast + Send> MessagePayload for T {}

/// A packaged call executed by the receiving thread.
///
/// Implementors perform the call in `invoke` and release any resources
/// (such as a blocked caller) when dropped, whether or not they were invoked.
pub(crate) trait Invocation: Send {
    fn invoke(self: Box<Self>);
}

enum MessageBody {
    Invoke(Box<dyn Invocation>),
    User(Box<dyn MessagePayload>),
    Empty,
}

/// A unit of work addressed to a thread.
pub struct Message {
    kind: MessageType,
    receiver: Option<WeakObject>,
    body: MessageBody,
}

impl Message {
    /// Create a user message carrying `payload` for `receiver`.
    pub fn new<P: MessagePayload>(kind: MessageType, receiver: &Object, payload: P) -> Self {
        Self::with_body(kind, Some(receiver), MessageBody::User(Box::new(payload)))
    }

    pub(crate) fn invoke(receiver: Option<&Object>, invocation: Box<dyn Invocation>) -> Self {
        Self::with_body(MessageType::INVOKE, receiver, MessageBody::Invoke(invocation))
    }

    pub(crate) fn thread_move(receiver: &Object) -> Self {
        Self::with_body(MessageType::THREAD_MOVE, Some(receiver), MessageBody::Empty)
    }

    fn with_body(kind: MessageType, receiver: Option<&Object>, body: MessageBody) -> Self {
        let receiver = receiver.map(|object| {
            object.message_posted();
            object.downgrade()
        });
        Self {
            kind,
            receiver,
            body,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// The receiver, if it still exists.
    pub fn receiver(&self) -> Option<Object> {
        self.receiver.as_ref().and_then(WeakObject::upgrade)
    }

    /// Whether the message was addressed to an object that no longer exists.
    pub(crate) fn receiver_gone(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|weak| weak.upgrade().is_none())
    }

    /// Borrow the payload of a user message as `T`.
    pub fn payload<T: MessagePayload>(&self) -> Option<&T> {
        match &self.body {
            MessageBody::User(payload) => payload.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Deliver the message on the current thread.
    pub(crate) fn deliver(mut self) {
        let receiver = match &self.receiver {
            Some(weak) => match weak.upgrade() {
                Some(object) => Some(object),
                None => {
                    tracing::trace!(kind = self.kind.0, "Dropping message for destroyed receiver");
                    return;
                }
            },
            None => None,
        };

        if self.kind == MessageType::INVOKE {
            if let MessageBody::Invoke(invocation) =
                std::mem::replace(&mut self.body, MessageBody::Empty)
            {
                invocation.invoke();
            }
            return;
        }

        if let Some(object) = receiver {
            object.handle_message(&self);
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Some(object) = self.receiver.as_ref().and_then(WeakObject::upgrade) {
            object.message_finished();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("has_receiver", &self.receiver.is_some())
            .finish()
    }
}
