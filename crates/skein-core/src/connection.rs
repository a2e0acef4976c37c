//! Connection contract and the default TCP connection.
//!
//! A connection is one socket's RPC session. The channel owns inbound
//! connections (accepted by its acceptor); outbound ones belong to the peer
//! pool. The channel only needs a handful of operations from either kind:
//! identity, a forced reset, a graceful close, and a way to learn that the
//! socket went away.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::{Call, ChannelError, Handler, HandlerFuture, Random, Span, SpanSink, Timers};

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel gives each connection it creates.
#[derive(Clone)]
pub struct ConnectionContext {
    pub process_name: String,
    /// Service name spans are recorded under.
    pub service_name: String,
    pub timeout_check_interval: Duration,
    pub timeout_fuzz: Duration,
    /// Handler for inbound calls arriving on this connection.
    pub handler: Handler,
    /// Where the connection reports its spans.
    pub span_sink: SpanSink,
    pub timers: Arc<dyn Timers>,
    pub random: Arc<dyn Random>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("process_name", &self.process_name)
            .field("service_name", &self.service_name)
            .field("timeout_check_interval", &self.timeout_check_interval)
            .field("timeout_fuzz", &self.timeout_fuzz)
            .field("handler", &self.handler.kind())
            .finish_non_exhaustive()
    }
}

/// One socket's RPC session, as seen by the channel.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn direction(&self) -> Direction;

    /// Remote `ip:port`.
    fn remote_addr(&self) -> &str;

    /// Fail everything in flight with `err` and tear the socket down.
    fn reset_all(&self, err: ChannelError);

    /// Close gracefully. Resolves once the socket is gone.
    fn close(&self) -> BoxFuture<'static, ()>;

    /// Resolves when the socket has closed, for whatever reason. Resolves
    /// immediately if it already has.
    fn closed(&self) -> BoxFuture<'static, ()>;
}

/// Builds connections for accepted (or dialed) sockets.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn create(
        &self,
        ctx: ConnectionContext,
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
    ) -> Arc<dyn Connection>;
}

/// Allocate a process-unique connection id.
pub fn next_connection_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

const READ_CHUNK: usize = 16 * 1024;
const INBOX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Close,
    Reset,
}

/// Default [`Connection`] over a [`TcpStream`].
///
/// A reader task owns the read half and forwards raw chunks to the inbox; the
/// frame layer takes the inbox with [`take_inbound`](Self::take_inbound) and
/// writes with [`write`](Self::write).
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    id: u64,
    direction: Direction,
    remote_addr: String,
    ctx: ConnectionContext,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    stop: watch::Sender<Option<Stop>>,
    closed: watch::Sender<bool>,
    reset_reason: Mutex<Option<String>>,
}

impl TcpConnection {
    /// Wrap `stream` and start its reader task. Must be called inside a tokio
    /// runtime.
    pub fn new(
        ctx: ConnectionContext,
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let (stop, stop_rx) = watch::channel(None);
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(TcpInner {
            id: next_connection_id(),
            direction,
            remote_addr,
            ctx,
            writer: tokio::sync::Mutex::new(Some(writer)),
            inbound: Mutex::new(Some(inbox_rx)),
            stop,
            closed,
            reset_reason: Mutex::new(None),
        });

        tracing::debug!(
            conn_id = inner.id,
            direction = %inner.direction,
            remote_addr = %inner.remote_addr,
            process_name = %inner.ctx.process_name,
            timeout_check_interval_ms = inner.ctx.timeout_check_interval.as_millis() as u64,
            "connection opened"
        );

        let accepted_at = inner.ctx.timers.now_ms();
        tokio::spawn(TcpInner::read_loop(
            Arc::clone(&inner),
            reader,
            inbox_tx,
            stop_rx,
            accepted_at,
        ));

        Self { inner }
    }

    /// Dial `host_port` and wrap the socket as an outbound connection.
    pub async fn dial(ctx: ConnectionContext, host_port: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(host_port).await?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?.to_string();
        Ok(Self::new(ctx, stream, Direction::Out, remote_addr))
    }

    /// Take the stream of inbound chunks. Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inner.inbound.lock().take()
    }

    /// Write `data` to the socket.
    pub async fn write(&self, data: Bytes) -> std::io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        writer.write_all(&data).await?;
        writer.flush().await
    }

    /// Dispatch an inbound call through the channel's handler.
    pub fn dispatch(&self, mut call: Call) -> HandlerFuture {
        call.remote_addr.get_or_insert_with(|| self.inner.remote_addr.clone());
        self.inner.ctx.handler.handle(call)
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.inner.ctx
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Reason recorded by [`Connection::reset_all`], if the connection was reset.
    pub fn reset_reason(&self) -> Option<String> {
        self.inner.reset_reason.lock().clone()
    }
}

fn stop_cause(
    changed: Result<(), watch::error::RecvError>,
    stop_rx: &watch::Receiver<Option<Stop>>,
) -> Option<Stop> {
    match changed {
        Ok(()) => *stop_rx.borrow(),
        // A dropped sender counts as a reset.
        Err(_) => Some(Stop::Reset),
    }
}

impl TcpInner {
    async fn read_loop(
        self: Arc<Self>,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        inbox: mpsc::Sender<Bytes>,
        mut stop_rx: watch::Receiver<Option<Stop>>,
        accepted_at: u64,
    ) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let stop = loop {
            buf.reserve(READ_CHUNK);
            tokio::select! {
                changed = stop_rx.changed() => break stop_cause(changed, &stop_rx),
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(conn_id = self.id, remote_addr = %self.remote_addr, "connection closed by peer");
                        break None;
                    }
                    Ok(_) => {
                        // A full inbox holds the reader back, but never past a stop.
                        let chunk = buf.split().freeze();
                        tokio::select! {
                            sent = inbox.send(chunk) => {
                                if sent.is_err() {
                                    tracing::trace!(conn_id = self.id, "inbox receiver dropped; discarding chunk");
                                }
                            }
                            changed = stop_rx.changed() => break stop_cause(changed, &stop_rx),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, remote_addr = %self.remote_addr, error = %e, "connection read failed");
                        break None;
                    }
                },
            }
        };

        let writer = self.writer.lock().await.take();
        if let (Some(mut writer), Some(Stop::Close)) = (writer, stop) {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(conn_id = self.id, error = %e, "write half shutdown failed");
            }
        }
        drop(reader);

        self.report_lifetime(accepted_at);
        self.closed.send_replace(true);
        tracing::debug!(conn_id = self.id, remote_addr = %self.remote_addr, ?stop, "connection closed");
    }

    fn report_lifetime(&self, accepted_at: u64) {
        let id = self.ctx.random.next_u64();
        let mut span = Span {
            trace_id: id,
            span_id: id,
            parent_id: None,
            name: format!("connection.{}", self.direction),
            service_name: self.ctx.service_name.clone(),
            endpoint: Some(self.remote_addr.clone()),
            annotations: Vec::new(),
        };
        span.annotate("accepted", accepted_at);
        span.annotate("closed", self.ctx.timers.now_ms());
        (self.ctx.span_sink)(span);
    }

    fn request_stop(&self, stop: Stop) {
        self.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(stop);
                true
            } else {
                false
            }
        });
    }

    fn wait_closed(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let mut closed = self.closed.subscribe();
        async move {
            // Err means the connection was dropped, which also means closed.
            let _ = closed.wait_for(|closed| *closed).await;
        }
        .boxed()
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn direction(&self) -> Direction {
        self.inner.direction
    }

    fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    fn reset_all(&self, err: ChannelError) {
        let reason = match &err {
            ChannelError::SocketClosed { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        tracing::info!(
            conn_id = self.inner.id,
            remote_addr = %self.inner.remote_addr,
            reason = %reason,
            "resetting connection"
        );
        self.inner.reset_reason.lock().get_or_insert(reason);
        self.inner.request_stop(Stop::Reset);
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.inner.request_stop(Stop::Close);
        self.inner.wait_closed()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.inner.wait_closed()
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Default [`ConnectionFactory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn create(
        &self,
        ctx: ConnectionContext,
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
    ) -> Arc<dyn Connection> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(remote_addr = %remote_addr, error = %e, "set_nodelay failed");
        }
        Arc::new(TcpConnection::new(ctx, stream, direction, remote_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FixedRandom, ManualTimers};
    use tokio::net::TcpListener;

    fn ctx(spans: Arc<Mutex<Vec<Span>>>) -> ConnectionContext {
        let handler = Handler::endpoint("svc");
        handler
            .as_endpoint()
            .unwrap()
            .register("whoami", |call: Call| async move {
                Ok(Bytes::from(call.remote_addr.unwrap_or_default()))
            });
        ConnectionContext {
            process_name: "test[1]".into(),
            service_name: "svc".into(),
            timeout_check_interval: Duration::from_millis(1000),
            timeout_fuzz: Duration::from_millis(100),
            handler,
            span_sink: Arc::new(move |span| spans.lock().push(span)),
            timers: Arc::new(ManualTimers::new(10)),
            random: Arc::new(FixedRandom(0.25)),
        }
    }

    async fn pair(spans: Arc<Mutex<Vec<Span>>>) -> (TcpConnection, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (dialed, accepted) = tokio::join!(TcpConnection::dial(ctx(spans.clone()), &addr), async {
            listener.accept().await.unwrap()
        });
        let (stream, remote) = accepted;
        let server = TcpConnection::new(ctx(spans), stream, Direction::In, remote.to_string());
        (dialed.unwrap(), server)
    }

    #[tokio::test]
    async fn bytes_flow_through_inbox() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = pair(spans).await;
        let mut inbox = server.take_inbound().unwrap();
        assert!(server.take_inbound().is_none());

        client.write(Bytes::from_static(b"hello")).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend_from_slice(&inbox.recv().await.unwrap());
        }
        assert_eq!(got, b"hello");
        assert_eq!(client.direction(), Direction::Out);
        assert_eq!(server.direction(), Direction::In);
    }

    #[tokio::test]
    async fn close_resolves_on_both_ends_and_reports_span() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = pair(spans.clone()).await;

        server.close().await;
        assert!(server.is_closed());
        client.closed().await;
        assert!(client.is_closed());
        // Closing again resolves immediately.
        server.close().await;

        let spans = spans.lock();
        assert_eq!(spans.len(), 2);
        let names: Vec<_> = spans.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"connection.in"));
        assert!(names.contains(&"connection.out"));
        assert_eq!(spans[0].annotations[0].value, "accepted");
        assert_eq!(spans[0].annotations[1].value, "closed");
    }

    #[tokio::test]
    async fn reset_records_reason_and_closes() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = pair(spans).await;

        server.reset_all(ChannelError::SocketClosed {
            reason: "duplicate remoteAddr incoming conn".into(),
            remote_addr: server.remote_addr().to_owned(),
        });
        server.closed().await;
        client.closed().await;
        assert_eq!(
            server.reset_reason().as_deref(),
            Some("duplicate remoteAddr incoming conn")
        );
        assert!(server.write(Bytes::from_static(b"x")).await.is_err());
    }

    async fn flood(client: TcpConnection) {
        let chunk = Bytes::from(vec![0u8; 64 * 1024]);
        for _ in 0..256 {
            if client.write(chunk.clone()).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn close_is_not_held_up_by_an_untaken_inbox() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = pair(spans).await;
        tokio::spawn(flood(client));
        // Let the reader fill the inbox and park on it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(3), server.close())
            .await
            .expect("close should not wait on a full inbox");
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn reset_is_not_held_up_by_an_untaken_inbox() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (client, server) = pair(spans).await;
        tokio::spawn(flood(client));
        tokio::time::sleep(Duration::from_millis(200)).await;

        server.reset_all(ChannelError::SocketClosed {
            reason: "duplicate remoteAddr incoming conn".into(),
            remote_addr: server.remote_addr().to_owned(),
        });
        tokio::time::timeout(Duration::from_secs(3), server.closed())
            .await
            .expect("reset should not wait on a full inbox");
    }

    #[tokio::test]
    async fn dispatch_fills_in_remote_addr() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let (_client, server) = pair(spans).await;
        let out = server.dispatch(Call::new("svc", "whoami")).await.unwrap();
        assert_eq!(&out[..], server.remote_addr().as_bytes());
    }
}
