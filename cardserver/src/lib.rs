//! Device session orchestration for DVB card servers.
//!
//! A [`server::ServerImplementation`] front accepts one request at a time
//! and hands it to a backend: either an in-process worker thread driving a
//! [`device::Device`] or a host process reached over framed byte streams.

pub mod config;
pub mod device;
pub mod logging;
pub mod pipeline;
pub mod server;
