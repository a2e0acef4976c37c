//! skein: the control core of a bidirectional RPC channel.
//!
//! A [`Channel`] multiplexes TCP peer connections for one process. A top
//! channel owns a registry of per-service sub-channels and the peer pool they
//! share; each sub-channel has its own handler and request defaults.
//!
//! # Usage
//!
//! ```ignore
//! use skein::{Channel, ChannelOptions, RequestOptions, SubChannelOptions};
//!
//! let top = Channel::new(ChannelOptions::from_env());
//! let users = top.create_sub_channel(SubChannelOptions::new("users"))?;
//! users.register("get", |call| async move { Ok(call.arg3) })?;
//!
//! let host_port = top.listen(4040, "10.0.0.7")?.await?;
//!
//! // Delegated to the "users" sub-channel.
//! let req = top.request(RequestOptions::new().service("users"))?;
//!
//! top.close()?.await;
//! ```
//!
//! Everything the channel does that outside code may want to observe (bound,
//! accepted, request made, socket failed) is published as a [`ChannelEvent`].

mod acceptor;
mod channel;
mod event;
mod shutdown;

pub use acceptor::{Acceptor, Listening};
pub use channel::Channel;
pub use event::ChannelEvent;
pub use shutdown::Closed;

pub use skein_core::*;
