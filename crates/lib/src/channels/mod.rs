//! Reply channels: synchronous HTTP, persistent WebSocket and the broker queue.
//!
//! Each channel only moves raw payloads; turning them into transcript lines is
//! the reply adapter's job.

mod http;
mod queue;
mod socket;

pub use http::{HttpChannel, HttpError};
pub use queue::{AmqpSource, MessageStream, QueueConsumer, QueueError, QueueSource};
pub use socket::{SocketClient, SocketError};
