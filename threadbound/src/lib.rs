// threadbound: thread-affine objects and cross-thread invocation
//
// Every long-lived entity of a device-control pipeline (devices, pipeline
// stages, event sources) embeds an `Object` bound to one `Thread`. Signals
// emitted anywhere are delivered to slots in the receiver's thread, either
// directly, through the thread's message queue, or through a blocking
// round-trip, so receivers never need locks of their own.

pub mod bound_method;
pub mod config;
pub mod error;
pub mod event_notifier;
pub mod logging;
pub mod message;
pub mod object;
pub mod semaphore;
pub mod signal;
pub mod thread;
pub mod timer;

// Re-export commonly used types
pub use bound_method::{invoke_method, ArgumentPack, BoundMethod, ConnectionType};
pub use config::{ShutdownPolicy, ThreadConfig};
pub use error::{EventError, MessageError, ThreadError};
pub use event_notifier::{EventNotifier, NotifierType};
pub use message::{Message, MessagePayload, MessageType};
pub use object::{HasObject, Object, WeakObject};
pub use semaphore::Semaphore;
pub use signal::{ConnectionId, Signal};
pub use thread::{Thread, ThreadRef, ThreadState};
pub use timer::Timer;
