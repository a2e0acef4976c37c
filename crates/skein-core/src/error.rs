//! Error codes and error types.

use core::fmt;
use std::sync::Arc;

/// Call-level error codes carried in error responses.
///
/// Values match the codes the wire protocol reserves for error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    UnexpectedError = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    Unhealthy = 0x08,
    FatalProtocolError = 0xff,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Timeout),
            0x02 => Some(Self::Cancelled),
            0x03 => Some(Self::Busy),
            0x04 => Some(Self::Declined),
            0x05 => Some(Self::UnexpectedError),
            0x06 => Some(Self::BadRequest),
            0x07 => Some(Self::NetworkError),
            0x08 => Some(Self::Unhealthy),
            0xff => Some(Self::FatalProtocolError),
            _ => None,
        }
    }

    /// Whether a caller may retry a request that failed with this code.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Busy | Self::Declined | Self::NetworkError | Self::Unhealthy
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Busy => write!(f, "busy"),
            Self::Declined => write!(f, "declined"),
            Self::UnexpectedError => write!(f, "unexpected error"),
            Self::BadRequest => write!(f, "bad request"),
            Self::NetworkError => write!(f, "network error"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::FatalProtocolError => write!(f, "fatal protocol error"),
        }
    }
}

/// Error returned by an inbound request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedError, message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Coarse classification of [`ChannelError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Programmer error: the call violated a channel invariant.
    Precondition,
    /// The channel is not configured to handle this request or registration.
    Routing,
    /// Asynchronous socket failure, delivered through the event bus.
    Socket,
    /// A connection was superseded by a newer one from the same address.
    Displacement,
    /// The peer pool could not produce a target.
    Peer,
}

/// Channel-level errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// `listen` was called on a channel that already listened.
    AlreadyListening { host_port: Option<String> },
    /// `listen` was called without a host.
    MissingHost,
    /// `listen` was asked to bind the wildcard address.
    WildcardHost { host: String },
    /// An operation that needs a live channel was called after `close`.
    UseAfterClose { operation: &'static str },
    /// `close` was called on a channel that is already destroyed.
    DoubleClose,
    /// `create_sub_channel` was called on a sub-channel.
    HierarchyDepth { service_name: String },
    /// A sub-channel with this service name already exists.
    DuplicateSubChannel { service_name: String },
    /// Sub-channel options did not name a service.
    MissingServiceName,
    /// A top channel was asked to originate a request it cannot delegate.
    TopLevelRequest { service: Option<String> },
    /// `register` was called on a top channel using service-name dispatch.
    TopLevelRegister { endpoint: String },
    /// `register` was called on a channel whose handler cannot register endpoints.
    InvalidHandlerForRegister { handler: &'static str },
    /// A connection was closed underneath its users.
    SocketClosed { reason: String, remote_addr: String },
    /// The requested listen address is taken.
    AddrInUse { host: String, requested_port: u16 },
    /// Any other listen-socket failure.
    Listen {
        host: String,
        requested_port: u16,
        host_port: Option<String>,
        source: Arc<std::io::Error>,
    },
    /// The peer pool has no open peer to send to.
    NoPeerAvailable { service: Option<String> },
    /// The targeted peer has been closed.
    PeerClosed { host_port: String },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyListening { .. }
            | Self::MissingHost
            | Self::WildcardHost { .. }
            | Self::UseAfterClose { .. }
            | Self::DoubleClose
            | Self::HierarchyDepth { .. }
            | Self::DuplicateSubChannel { .. }
            | Self::MissingServiceName => ErrorKind::Precondition,
            Self::TopLevelRequest { .. }
            | Self::TopLevelRegister { .. }
            | Self::InvalidHandlerForRegister { .. } => ErrorKind::Routing,
            Self::SocketClosed { .. } => ErrorKind::Displacement,
            Self::AddrInUse { .. } | Self::Listen { .. } => ErrorKind::Socket,
            Self::NoPeerAvailable { .. } | Self::PeerClosed { .. } => ErrorKind::Peer,
        }
    }

    /// Translate a listen-socket I/O failure, singling out `EADDRINUSE`.
    pub fn from_listen_io(
        err: std::io::Error,
        host: &str,
        requested_port: u16,
        host_port: Option<String>,
    ) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddrInUse {
                host: host.to_owned(),
                requested_port,
            }
        } else {
            Self::Listen {
                host: host.to_owned(),
                requested_port,
                host_port,
                source: Arc::new(err),
            }
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyListening { host_port } => match host_port {
                Some(hp) => write!(f, "channel is already listening on {hp}"),
                None => write!(f, "channel is already listening"),
            },
            Self::MissingHost => write!(f, "listen requires a host"),
            Self::WildcardHost { host } => {
                write!(f, "cannot listen on {host}; bind an externally reachable address")
            }
            Self::UseAfterClose { operation } => {
                write!(f, "cannot {operation} on a destroyed channel")
            }
            Self::DoubleClose => write!(f, "channel is already closed"),
            Self::HierarchyDepth { service_name } => write!(
                f,
                "cannot create a sub-channel of sub-channel {service_name:?}; nesting is one level deep"
            ),
            Self::DuplicateSubChannel { service_name } => {
                write!(f, "sub-channel {service_name:?} already exists")
            }
            Self::MissingServiceName => write!(f, "sub-channel options must name a service"),
            Self::TopLevelRequest { service } => match service {
                Some(s) => write!(
                    f,
                    "top channel has no sub-channel for service {s:?}; create one or pin a host"
                ),
                None => write!(
                    f,
                    "top channel cannot make requests without a service or an explicit host"
                ),
            },
            Self::TopLevelRegister { endpoint } => write!(
                f,
                "cannot register endpoint {endpoint:?} on a top channel; register on a sub-channel"
            ),
            Self::InvalidHandlerForRegister { handler } => {
                write!(f, "cannot register endpoints on a {handler} handler")
            }
            Self::SocketClosed {
                reason,
                remote_addr,
            } => write!(f, "socket to {remote_addr} closed: {reason}"),
            Self::AddrInUse {
                host,
                requested_port,
            } => write!(f, "address {host}:{requested_port} is already in use"),
            Self::Listen {
                host,
                requested_port,
                host_port,
                source,
            } => match host_port {
                Some(hp) => write!(
                    f,
                    "listen socket error on {hp} (requested {host}:{requested_port}): {source}"
                ),
                None => write!(
                    f,
                    "listen socket error (requested {host}:{requested_port}): {source}"
                ),
            },
            Self::NoPeerAvailable { service } => match service {
                Some(s) => write!(f, "no peer available for service {s:?}"),
                None => write!(f, "no peer available"),
            },
            Self::PeerClosed { host_port } => write!(f, "peer {host_port} is closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Listen { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
