//! Channel events.

use std::fmt;
use std::sync::Arc;

use skein_core::{ChannelError, Connection, Request};

/// Something external code may want to know about a channel.
///
/// Delivered to every [`Channel::subscribe`](crate::Channel::subscribe)
/// receiver. Subscribers that fall more than the configured capacity behind
/// observe a lag and skip ahead.
#[derive(Clone)]
pub enum ChannelEvent {
    /// The listen socket is bound; `host_port` is the reachable address.
    Listening { host_port: String },
    /// An inbound connection was accepted and is now tracked.
    Connection(Arc<dyn Connection>),
    /// An outbound request was constructed.
    Request(Arc<Request>),
    /// A socket-level failure, such as a failed bind.
    Error(ChannelError),
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { host_port } => f
                .debug_struct("Listening")
                .field("host_port", host_port)
                .finish(),
            Self::Connection(conn) => f
                .debug_struct("Connection")
                .field("id", &conn.id())
                .field("direction", &conn.direction())
                .field("remote_addr", &conn.remote_addr())
                .finish(),
            Self::Request(req) => f.debug_tuple("Request").field(req).finish(),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}
