//! skein-testkit: test doubles for the skein channel core.
//!
//! The doubles here stand in for the channel's collaborators so tests can
//! control when each of them finishes closing and can see what the channel
//! asked of them:
//!
//! - [`MockConnectionFactory`] / [`MockConnection`]: inbound connections whose
//!   close completion can be held until the test opens a [`Gate`].
//! - [`RecordingPeerPool`]: a real [`PeerList`] that records requests and close
//!   calls, with an optional gate on close.
//! - [`RecordingReporter`]: collects reported spans.
//!
//! # Usage
//!
//! ```ignore
//! let factory = Arc::new(MockConnectionFactory::new().hold_close());
//! let channel = Channel::new(ChannelOptions::default().connection_factory(factory.clone()));
//! // ... accept connections, call close() ...
//! factory.release_all();
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use skein_core::{
    next_connection_id, ChannelError, Connection, ConnectionContext, ConnectionFactory,
    Direction, FixedRandom, ManualTimers, Peer, PeerList, PeerPool, Request, RequestOptions, Span,
    SpanReporter,
};
use tokio::net::TcpStream;
use tokio::sync::watch;

static INIT: Once = Once::new();

/// Install a test-writer `fmt` subscriber once per test binary. `RUST_LOG`
/// controls the filter.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A latch tests open by hand.
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { open: tx }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolves once the gate is open.
    pub fn wait(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.open.subscribe();
        async move {
            let _ = rx.wait_for(|open| *open).await;
        }
        .boxed()
    }
}

/// Connection double. Holds the accepted socket open until it closes.
pub struct MockConnection {
    id: u64,
    direction: Direction,
    remote_addr: String,
    ctx: ConnectionContext,
    stream: Mutex<Option<TcpStream>>,
    resets: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    close_gate: Arc<Gate>,
    closed: Arc<watch::Sender<bool>>,
}

impl MockConnection {
    fn new(
        ctx: ConnectionContext,
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
        close_gate: Arc<Gate>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: next_connection_id(),
            direction,
            remote_addr,
            ctx,
            stream: Mutex::new(Some(stream)),
            resets: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            close_gate,
            closed: Arc::new(closed),
        }
    }

    /// Reasons passed to `reset_all`, in order.
    pub fn resets(&self) -> Vec<String> {
        self.resets.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Finish closing now: drop the socket and wake `closed()` waiters.
    pub fn finish_close(&self) {
        self.stream.lock().take();
        self.closed.send_replace(true);
    }
}

impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn reset_all(&self, err: ChannelError) {
        let reason = match err {
            ChannelError::SocketClosed { reason, .. } => reason,
            other => other.to_string(),
        };
        self.resets.lock().push(reason);
        self.finish_close();
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        let gate = self.close_gate.wait();
        let stream = self.stream.lock().take();
        let closed = Arc::clone(&self.closed);
        async move {
            gate.await;
            drop(stream);
            closed.send_replace(true);
        }
        .boxed()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
        .boxed()
    }
}

/// Factory for [`MockConnection`]s. Keeps every connection it built.
pub struct MockConnectionFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
    close_gate: Arc<Gate>,
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnectionFactory {
    /// Connections close as soon as asked.
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            close_gate: Arc::new(Gate::new(true)),
        }
    }

    /// Connections hold their close until [`release_all`](Self::release_all).
    pub fn hold_close(self) -> Self {
        Self {
            close_gate: Arc::new(Gate::new(false)),
            ..self
        }
    }

    pub fn release_all(&self) {
        self.close_gate.open();
    }

    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(
        &self,
        ctx: ConnectionContext,
        stream: TcpStream,
        direction: Direction,
        remote_addr: String,
    ) -> Arc<dyn Connection> {
        let conn = Arc::new(MockConnection::new(
            ctx,
            stream,
            direction,
            remote_addr,
            Arc::clone(&self.close_gate),
        ));
        self.created.lock().push(Arc::clone(&conn));
        conn
    }
}

/// One call to [`PeerPool::request`].
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub explicit_host: Option<String>,
    pub options: RequestOptions,
}

/// A [`PeerList`] that records what the channel asks of it.
pub struct RecordingPeerPool {
    inner: PeerList,
    requests: Mutex<Vec<PoolRequest>>,
    close_calls: AtomicUsize,
    close_gate: Arc<Gate>,
}

impl Default for RecordingPeerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPeerPool {
    pub fn new() -> Self {
        Self {
            inner: PeerList::new(Arc::new(FixedRandom(0.0)), Arc::new(ManualTimers::new(0))),
            requests: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            close_gate: Arc::new(Gate::new(true)),
        }
    }

    /// Hold `close()` completion until [`release_close`](Self::release_close).
    pub fn hold_close(self) -> Self {
        Self {
            close_gate: Arc::new(Gate::new(false)),
            ..self
        }
    }

    pub fn release_close(&self) {
        self.close_gate.open();
    }

    pub fn requests(&self) -> Vec<PoolRequest> {
        self.requests.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    pub fn peer_list(&self) -> &PeerList {
        &self.inner
    }
}

impl PeerPool for RecordingPeerPool {
    fn add(&self, host_port: &str) -> Arc<Peer> {
        self.inner.add(host_port)
    }

    fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.inner.get(host_port)
    }

    fn request(
        &self,
        explicit_host: Option<&str>,
        options: RequestOptions,
    ) -> Result<Request, ChannelError> {
        self.requests.lock().push(PoolRequest {
            explicit_host: explicit_host.map(str::to_owned),
            options: options.clone(),
        });
        self.inner.request(explicit_host, options)
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        let gate = self.close_gate.wait();
        let closing = self.inner.close();
        async move {
            gate.await;
            closing.await;
        }
        .boxed()
    }
}

/// Collects every span reported to it.
#[derive(Default)]
pub struct RecordingReporter {
    spans: Mutex<Vec<Span>>,
}

impl RecordingReporter {
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }
}

impl SpanReporter for RecordingReporter {
    fn report(&self, span: Span) {
        self.spans.lock().push(span);
    }
}
