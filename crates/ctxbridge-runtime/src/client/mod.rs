//! Client side of a service: the proxy that turns a published manifest into
//! async calls, pull-driven streams, and local event fan-out.

mod correlation;
mod events;
mod proxy;
mod stream;

pub use correlation::CorrelationRegistry;
pub use events::{EventListeners, ListenerId};
pub use proxy::ClientProxy;
pub use stream::StreamReceiver;
