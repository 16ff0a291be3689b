//! Inbound transaction feeds.
//!
//! Producers hand raw payloads to a [`FeedHandle`](crate::engine::FeedHandle);
//! node connections are adapted to that interface here.

pub mod zmq_sub;

pub use zmq_sub::start_zmq_subscriber;
