//! skein-core: collaborator contracts and value types for the skein RPC channel.
//!
//! This crate defines:
//! - Errors and protocol error codes ([`ChannelError`], [`ErrorCode`], [`HandlerError`])
//! - Configuration ([`ChannelOptions`], [`SubChannelOptions`])
//! - Inbound handlers ([`Handler`], [`EndpointHandler`], [`ServiceNameHandler`])
//! - The connection contract and its TCP implementation ([`Connection`], [`TcpConnection`])
//! - The peer pool contract and the default peer list ([`PeerPool`], [`PeerList`])
//! - Outbound requests ([`Request`], [`RequestOptions`], [`RequestDefaults`])
//! - Span collection ([`Tracer`], [`Span`], [`SpanReporter`])
//! - Injectable time and randomness ([`Timers`], [`Random`])
//!
//! The channel itself lives in the `skein` crate.

mod clock;
mod connection;
mod error;
mod handler;
mod options;
mod peer;
mod request;
mod tracer;

pub use clock::*;
pub use connection::*;
pub use error::*;
pub use handler::*;
pub use options::*;
pub use peer::*;
pub use request::*;
pub use tracer::*;

pub use bytes::Bytes;
