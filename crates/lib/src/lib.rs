//! chatrelay core library: reply adapter, shared transcript, and the HTTP,
//! WebSocket and message-queue channels used by the CLI.

pub mod adapter;
pub mod backoff;
pub mod channels;
pub mod config;
pub mod protocol;
pub mod session;
pub mod transcript;
