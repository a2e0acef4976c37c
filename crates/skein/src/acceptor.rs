//! Inbound side of a channel: the listen socket and the table of accepted
//! connections, keyed by remote address.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use skein_core::{ChannelError, Connection, Direction};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{Channel, ChannelEvent};

const DUPLICATE_REMOTE_ADDR: &str = "duplicate remoteAddr incoming conn";
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Resolves to the bound `host:port` once `listen` has bound its socket.
///
/// Bind failures are reported here as well as on the event bus.
#[must_use = "the bind proceeds regardless; await this to learn its outcome"]
#[derive(Debug)]
pub struct Listening {
    rx: oneshot::Receiver<Result<String, ChannelError>>,
}

impl Future for Listening {
    type Output = Result<String, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or(Err(ChannelError::UseAfterClose {
                operation: "listen",
            }))
        })
    }
}

/// A channel's listen socket and inbound connection table.
///
/// Created on first use by [`Channel::server`]; one per channel.
pub struct Acceptor {
    channel: Weak<Channel>,
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub(crate) fn new(channel: Weak<Channel>) -> Self {
        Self {
            channel,
            connections: Mutex::new(HashMap::new()),
            local_addr: Mutex::new(None),
            stop: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Bound address, while the listen socket is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, remote_addr: &str) -> Option<Arc<dyn Connection>> {
        self.connections.lock().get(remote_addr).cloned()
    }

    pub fn remote_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.connections.lock().keys().cloned().collect();
        addrs.sort_unstable();
        addrs
    }

    pub(crate) fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Bind `host:port` and run the accept loop in a background task.
    pub(crate) fn start(self: &Arc<Self>, host: String, port: u16, span: tracing::Span) -> Listening {
        let (tx, rx) = oneshot::channel();
        let acceptor = Arc::clone(self);
        let handle = tokio::spawn(async move { acceptor.run(host, port, tx).await }.instrument(span));
        *self.task.lock() = Some(handle);
        Listening { rx }
    }

    async fn run(
        self: Arc<Self>,
        host: String,
        port: u16,
        listening: oneshot::Sender<Result<String, ChannelError>>,
    ) {
        let bound = match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let err = match self.channel.upgrade() {
                    Some(channel) => {
                        let err = ChannelError::from_listen_io(e, &host, port, channel.host_port());
                        channel.on_socket_error(err.clone());
                        err
                    }
                    None => ChannelError::from_listen_io(e, &host, port, None),
                };
                let _ = listening.send(Err(err));
                return;
            }
        };

        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        *self.local_addr.lock() = Some(addr);
        let result = channel.on_listening(&host, addr.port());
        drop(channel);
        let bound_ok = result.is_ok();
        let _ = listening.send(result);
        if bound_ok {
            self.accept_loop(listener).await;
        }
        *self.local_addr.lock() = None;
        tracing::debug!(%addr, "listen socket closed");
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let Some(channel) = self.channel.upgrade() else {
                            break;
                        };
                        self.on_connection(&channel, stream, remote.to_string());
                    }
                    Err(e) => {
                        let Some(channel) = self.channel.upgrade() else {
                            break;
                        };
                        let (host, port) = channel.bind_request();
                        channel.on_socket_error(ChannelError::from_listen_io(
                            e,
                            &host,
                            port,
                            channel.host_port(),
                        ));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Track a freshly accepted socket, displacing any connection from the same
    /// remote address.
    pub(crate) fn on_connection(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        stream: TcpStream,
        remote_addr: String,
    ) {
        if channel.is_destroyed() {
            tracing::error!(
                remote_addr = %remote_addr,
                host_port = ?channel.host_port(),
                "got incoming socket after channel was destroyed; dropping it"
            );
            return;
        }

        let conn = channel.options().connection_factory.create(
            channel.connection_context(),
            stream,
            Direction::In,
            remote_addr.clone(),
        );

        {
            let mut table = self.connections.lock();
            // Re-checked under the table lock so close() cannot miss it.
            if channel.is_destroyed() {
                drop(table);
                tracing::error!(
                    remote_addr = %remote_addr,
                    "channel destroyed while accepting; resetting connection"
                );
                conn.reset_all(ChannelError::SocketClosed {
                    reason: "channel destroyed".into(),
                    remote_addr,
                });
                return;
            }
            if let Some(old) = table.remove(&remote_addr) {
                tracing::info!(
                    remote_addr = %remote_addr,
                    old_conn = old.id(),
                    new_conn = conn.id(),
                    "resetting connection displaced by a new one from the same address"
                );
                old.reset_all(ChannelError::SocketClosed {
                    reason: DUPLICATE_REMOTE_ADDR.into(),
                    remote_addr: remote_addr.clone(),
                });
            }
            table.insert(remote_addr.clone(), Arc::clone(&conn));
        }

        let acceptor = Arc::downgrade(self);
        let conn_id = conn.id();
        let closed = conn.closed();
        tokio::spawn(
            async move {
                closed.await;
                if let Some(acceptor) = acceptor.upgrade() {
                    acceptor.forget(&remote_addr, conn_id);
                }
            }
            .instrument(channel.options().log_span.clone()),
        );

        channel.emit(ChannelEvent::Connection(conn));
    }

    /// Drop the table entry for `remote_addr` if it still belongs to `conn_id`.
    fn forget(&self, remote_addr: &str, conn_id: u64) {
        let mut table = self.connections.lock();
        if table.get(remote_addr).is_some_and(|c| c.id() == conn_id) {
            table.remove(remote_addr);
            tracing::debug!(remote_addr, conn_id, "inbound connection closed");
        }
    }

    /// Ask the accept task to close the listen socket.
    pub(crate) fn stop(&self) {
        self.stop.notify_one();
    }

    /// Wait for the accept task to finish. Resolves immediately if it never
    /// started or was already joined.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "listen task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.remote_addrs())
            .finish_non_exhaustive()
    }
}
