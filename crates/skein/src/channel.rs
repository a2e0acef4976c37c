//! The channel: sub-channel hierarchy, request routing and lifecycle.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use skein_core::{
    Call, ChannelError, ChannelOptions, ConnectionContext, Handler, HandlerError, LogReporter,
    Peer, PeerList, PeerPool, PeerRef, Request, RequestDefaults, RequestOptions, ServiceLookup,
    ServiceNameHandler, SpanReporter, SubChannelOptions, Tracer,
};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::acceptor::{Acceptor, Listening};
use crate::shutdown::{Closed, ShutdownLatch};
use crate::ChannelEvent;

/// Where a channel sits in its hierarchy.
enum Role {
    /// No service name; owns the sub-channel registry and the peer pool.
    Top {
        sub_channels: RwLock<BTreeMap<String, Arc<Channel>>>,
    },
    /// Bound to one service. `top` is `None` for a standalone service channel.
    Service {
        service_name: String,
        top: Option<Weak<Channel>>,
    },
}

#[derive(Debug, Default)]
struct State {
    listened: bool,
    listening: bool,
    destroyed: bool,
    host: Option<String>,
    requested_port: Option<u16>,
    host_port: Option<String>,
}

/// A bidirectional RPC channel.
///
/// A top channel (no service name) owns a registry of sub-channels, one per
/// service, and the peer pool they all share. Sub-channels carry their own
/// handler and request defaults. Any channel may listen; inbound connections
/// belong to the channel that accepted them.
///
/// Operations that start background work (`listen`, `close`) must be called
/// from within a tokio runtime.
pub struct Channel {
    role: Role,
    options: ChannelOptions,
    request_defaults: RequestDefaults,
    handler: Handler,
    peers: Arc<dyn PeerPool>,
    peers_view: Mutex<Vec<Arc<Peer>>>,
    tracer: Arc<Tracer>,
    state: Mutex<State>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    events: broadcast::Sender<ChannelEvent>,
    self_ref: Weak<Channel>,
}

impl Channel {
    /// Create a channel.
    ///
    /// Without `options.service_name` this is a top channel that dispatches
    /// inbound calls by service name. With one, it is a standalone channel for
    /// that service.
    pub fn new(options: ChannelOptions) -> Arc<Self> {
        let service_name = options.service_name.clone().filter(|s| !s.is_empty());
        let peers = options.peer_pool.clone().unwrap_or_else(|| {
            Arc::new(PeerList::new(
                Arc::clone(&options.random),
                Arc::clone(&options.timers),
            ))
        });
        let reporter = options
            .trace_reporter
            .clone()
            .unwrap_or_else(|| Arc::new(LogReporter) as Arc<dyn SpanReporter>);
        let tracer = Arc::new(Tracer::new(
            reporter,
            options.trace,
            options.force_trace,
            options
                .tracing_service_name
                .clone()
                .or_else(|| service_name.clone())
                .unwrap_or_else(|| options.process_name.clone()),
            Arc::clone(&options.random),
            Arc::clone(&options.timers),
        ));

        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| {
            let (role, default_handler) = match service_name {
                Some(service_name) => {
                    let handler = Handler::endpoint(service_name.clone());
                    (
                        Role::Service {
                            service_name,
                            top: None,
                        },
                        handler,
                    )
                }
                None => {
                    let lookup: Weak<dyn ServiceLookup> = weak.clone();
                    (
                        Role::Top {
                            sub_channels: RwLock::new(BTreeMap::new()),
                        },
                        Handler::ServiceName(ServiceNameHandler::new(lookup)),
                    )
                }
            };
            let (events, _) = broadcast::channel(options.event_capacity.max(1));
            Channel {
                role,
                request_defaults: options.request_defaults.clone(),
                handler: options.handler.clone().unwrap_or(default_handler),
                peers,
                peers_view: Mutex::new(Vec::new()),
                tracer,
                state: Mutex::new(State::default()),
                acceptor: Mutex::new(None),
                events,
                self_ref: weak.clone(),
                options,
            }
        });

        let _enter = channel.options.log_span.enter();
        tracing::debug!(
            service_name = channel.service_name(),
            handler = %channel.handler.kind(),
            "channel created"
        );
        drop(_enter);
        channel
    }

    // --- hierarchy ---------------------------------------------------------

    /// Create a sub-channel serving `opts.service_name`.
    ///
    /// Only top channels have sub-channels. The sub-channel shares this
    /// channel's peer pool; peers named in `opts.peers` are added to that pool
    /// and recorded in the sub-channel's view of it.
    pub fn create_sub_channel(
        self: &Arc<Self>,
        opts: SubChannelOptions,
    ) -> Result<Arc<Channel>, ChannelError> {
        let sub_channels = match &self.role {
            Role::Top { sub_channels } => sub_channels,
            Role::Service { service_name, .. } => {
                return Err(ChannelError::HierarchyDepth {
                    service_name: service_name.clone(),
                })
            }
        };
        if opts.service_name.is_empty() {
            return Err(ChannelError::MissingServiceName);
        }
        if self.is_destroyed() {
            return Err(ChannelError::UseAfterClose {
                operation: "create a sub-channel",
            });
        }

        let sub = {
            let mut registry = sub_channels.write();
            if registry.contains_key(&opts.service_name) {
                return Err(ChannelError::DuplicateSubChannel {
                    service_name: opts.service_name,
                });
            }
            let sub = self.build_sub_channel(opts);
            registry.insert(sub.service_name().to_owned(), Arc::clone(&sub));
            sub
        };

        // Read after insertion: a concurrent listen either sees the new entry
        // or has already published its host_port.
        if let Some(host_port) = self.host_port() {
            sub.adopt_host_port(&host_port);
        }

        let _enter = self.options.log_span.enter();
        tracing::info!(
            service_name = sub.service_name(),
            handler = %sub.handler.kind(),
            peers = sub.peers_view.lock().len(),
            "sub-channel created"
        );
        Ok(sub)
    }

    fn build_sub_channel(self: &Arc<Self>, opts: SubChannelOptions) -> Arc<Channel> {
        let SubChannelOptions {
            service_name,
            handler,
            request_defaults,
            trace,
            tracing_service_name,
            peers,
        } = opts;

        let defaults = self.request_defaults.overlay(&request_defaults);
        let mut options = self.options.clone();
        options.service_name = Some(service_name.clone());
        options.request_defaults = defaults.clone();
        options.handler = handler.clone();
        options.trace = trace.unwrap_or(options.trace);
        options.tracing_service_name = tracing_service_name;
        options.peer_pool = Some(Arc::clone(&self.peers));

        let view: Vec<Arc<Peer>> = peers
            .into_iter()
            .map(|peer| match peer {
                PeerRef::Addr(addr) => self.peers.add(&addr),
                PeerRef::Peer(peer) => peer,
            })
            .collect();

        let reporter = options
            .trace_reporter
            .clone()
            .unwrap_or_else(|| Arc::new(LogReporter) as Arc<dyn SpanReporter>);
        let tracer = Arc::new(Tracer::new(
            reporter,
            options.trace,
            options.force_trace,
            options
                .tracing_service_name
                .clone()
                .unwrap_or_else(|| service_name.clone()),
            Arc::clone(&options.random),
            Arc::clone(&options.timers),
        ));
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        Arc::new_cyclic(|weak| Channel {
            role: Role::Service {
                service_name: service_name.clone(),
                top: Some(Arc::downgrade(self)),
            },
            request_defaults: defaults,
            handler: handler.unwrap_or_else(|| Handler::endpoint(service_name)),
            peers: Arc::clone(&self.peers),
            peers_view: Mutex::new(view),
            tracer,
            state: Mutex::new(State::default()),
            acceptor: Mutex::new(None),
            events,
            self_ref: weak.clone(),
            options,
        })
    }

    /// Set `host_port` unless one is already set.
    fn adopt_host_port(&self, host_port: &str) {
        let mut state = self.state.lock();
        if state.host_port.is_none() {
            state.host_port = Some(host_port.to_owned());
        }
    }

    /// Service name; empty for a top channel.
    pub fn service_name(&self) -> &str {
        match &self.role {
            Role::Top { .. } => "",
            Role::Service { service_name, .. } => service_name,
        }
    }

    pub fn is_top_channel(&self) -> bool {
        matches!(self.role, Role::Top { .. })
    }

    /// The top channel this sub-channel belongs to, if it is still alive.
    pub fn top_channel(&self) -> Option<Arc<Channel>> {
        match &self.role {
            Role::Service { top: Some(top), .. } => top.upgrade(),
            _ => None,
        }
    }

    pub fn sub_channel(&self, service_name: &str) -> Option<Arc<Channel>> {
        match &self.role {
            Role::Top { sub_channels } => sub_channels.read().get(service_name).cloned(),
            Role::Service { .. } => None,
        }
    }

    pub fn sub_channel_names(&self) -> Vec<String> {
        match &self.role {
            Role::Top { sub_channels } => sub_channels.read().keys().cloned().collect(),
            Role::Service { .. } => Vec::new(),
        }
    }

    fn sub_channels(&self) -> Vec<Arc<Channel>> {
        match &self.role {
            Role::Top { sub_channels } => sub_channels.read().values().cloned().collect(),
            Role::Service { .. } => Vec::new(),
        }
    }

    /// Address of this channel's own listen socket, else its top channel's.
    pub fn address(&self) -> Option<SocketAddr> {
        let own = self.acceptor.lock().as_ref().and_then(|a| a.local_addr());
        own.or_else(|| self.top_channel().and_then(|top| top.address()))
    }

    pub fn host_port(&self) -> Option<String> {
        self.state.lock().host_port.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// The peer pool, shared by the whole hierarchy.
    pub fn peers(&self) -> &Arc<dyn PeerPool> {
        &self.peers
    }

    /// Peers this channel was configured with.
    pub fn peers_view(&self) -> Vec<Arc<Peer>> {
        self.peers_view.lock().clone()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn request_defaults(&self) -> &RequestDefaults {
        &self.request_defaults
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn inbound_connection_count(&self) -> usize {
        self.acceptor
            .lock()
            .as_ref()
            .map_or(0, |a| a.connection_count())
    }

    /// Receive this channel's events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(service_name = self.service_name(), "event dropped; no subscribers");
        }
    }

    // --- inbound -----------------------------------------------------------

    /// The acceptor owning this channel's listen socket and inbound
    /// connections, created on first call.
    pub fn server(&self) -> Arc<Acceptor> {
        let mut acceptor = self.acceptor.lock();
        Arc::clone(acceptor.get_or_insert_with(|| Arc::new(Acceptor::new(self.self_ref.clone()))))
    }

    pub(crate) fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            process_name: self.options.process_name.clone(),
            service_name: self.tracer.service_name().to_owned(),
            timeout_check_interval: self.options.timeout_check_interval,
            timeout_fuzz: self.options.timeout_fuzz,
            handler: self.handler.clone(),
            span_sink: self.tracer.sink(),
            timers: Arc::clone(&self.options.timers),
            random: Arc::clone(&self.options.random),
        }
    }

    /// Register an endpoint on this channel's endpoint handler.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), ChannelError>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        match &self.handler {
            Handler::Endpoint(endpoints) => {
                endpoints.register(name, f);
                Ok(())
            }
            Handler::ServiceName(_) => Err(ChannelError::TopLevelRegister {
                endpoint: name.into(),
            }),
            handler => Err(ChannelError::InvalidHandlerForRegister {
                handler: handler.kind().as_str(),
            }),
        }
    }

    // --- outbound ----------------------------------------------------------

    /// Build an outbound request.
    ///
    /// Caller options are merged over this channel's request defaults. Then:
    /// a top channel without a pinned host delegates to the sub-channel named by
    /// `service`; a pinned host or a streamed request goes through the peer
    /// pool; anything else becomes a single-shot request bound to this channel.
    /// Every constructed request is announced as [`ChannelEvent::Request`].
    pub fn request(&self, options: RequestOptions) -> Result<Arc<Request>, ChannelError> {
        if self.is_destroyed() {
            return Err(ChannelError::UseAfterClose {
                operation: "request",
            });
        }

        let merged = self.request_defaults.apply(&options);

        if self.is_top_channel() && merged.host.is_none() {
            let service = merged.service;
            return match service.as_deref().and_then(|s| self.sub_channel(s)) {
                Some(sub) => sub.request(options),
                None => Err(ChannelError::TopLevelRequest { service }),
            };
        }

        let request = if merged.host.is_some() || merged.streamed {
            let host = merged.host.clone();
            self.peers.request(host.as_deref(), merged)?
        } else {
            Request::single_shot(self.service_name(), merged, self.options.timers.now_ms())
        };

        let request = Arc::new(request);
        tracing::debug!(
            parent: &self.options.log_span,
            request_id = request.id(),
            service_name = self.service_name(),
            target = ?request.target(),
            max_attempts = request.max_attempts(),
            "request created"
        );
        self.emit(ChannelEvent::Request(Arc::clone(&request)));
        Ok(request)
    }

    // --- lifecycle ---------------------------------------------------------

    /// Bind `host:port` and start accepting connections.
    ///
    /// Preconditions are checked here; the bind itself happens in the
    /// background and its outcome is delivered through the returned future and
    /// the event bus. `port` 0 binds an ephemeral port.
    pub fn listen(&self, port: u16, host: &str) -> Result<Listening, ChannelError> {
        {
            let mut state = self.state.lock();
            if state.listened {
                return Err(ChannelError::AlreadyListening {
                    host_port: state.host_port.clone(),
                });
            }
            if host.is_empty() {
                return Err(ChannelError::MissingHost);
            }
            if host == "0.0.0.0" {
                return Err(ChannelError::WildcardHost {
                    host: host.to_owned(),
                });
            }
            state.listened = true;
            state.host = Some(host.to_owned());
            state.requested_port = Some(port);
        }

        tracing::debug!(parent: &self.options.log_span, host, port, "listening requested");
        Ok(self
            .server()
            .start(host.to_owned(), port, self.options.log_span.clone()))
    }

    /// The host and port `listen` was called with.
    pub(crate) fn bind_request(&self) -> (String, u16) {
        let state = self.state.lock();
        (
            state.host.clone().unwrap_or_default(),
            state.requested_port.unwrap_or_default(),
        )
    }

    /// The listen socket is bound. Publishes `host_port` down the hierarchy.
    pub(crate) fn on_listening(&self, host: &str, port: u16) -> Result<String, ChannelError> {
        let host_port = format!("{host}:{port}");
        {
            let mut state = self.state.lock();
            if state.destroyed {
                tracing::warn!(
                    host_port = %host_port,
                    "listen completed after channel was destroyed; closing socket"
                );
                return Err(ChannelError::UseAfterClose {
                    operation: "listen",
                });
            }
            state.host_port = Some(host_port.clone());
            state.listening = true;
        }

        for sub in self.sub_channels() {
            sub.adopt_host_port(&host_port);
        }
        tracing::info!(host_port = %host_port, "channel listening");
        self.emit(ChannelEvent::Listening {
            host_port: host_port.clone(),
        });
        Ok(host_port)
    }

    pub(crate) fn on_socket_error(&self, err: ChannelError) {
        let (host, requested_port) = self.bind_request();
        tracing::error!(
            host = %host,
            requested_port,
            host_port = ?self.host_port(),
            error = %err,
            "listen socket error"
        );
        self.emit(ChannelEvent::Error(err));
    }

    /// Close the channel and everything it owns.
    ///
    /// The channel is marked destroyed before this returns. The listen
    /// socket, every inbound connection, every live sub-channel and the peer
    /// pool (or, for a sub-channel, the peers in its view) are closed
    /// concurrently; the returned future resolves once all of them have.
    pub fn close(&self) -> Result<Closed, ChannelError> {
        let listened = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(ChannelError::DoubleClose);
            }
            state.destroyed = true;
            state.listened
        };

        let span = self.options.log_span.clone();
        let owner = match self.service_name() {
            "" => "top".to_owned(),
            name => name.to_owned(),
        };
        let (latch, closed) = ShutdownLatch::new(owner);
        tracing::info!(parent: &span, service_name = self.service_name(), "closing channel");

        let acceptor = self.acceptor.lock().clone();
        if let Some(acceptor) = acceptor {
            if listened {
                latch.acquire();
                acceptor.stop();
                let latch = Arc::clone(&latch);
                let acceptor = Arc::clone(&acceptor);
                tokio::spawn(
                    async move {
                        acceptor.join().await;
                        latch.release("listen socket");
                    }
                    .instrument(span.clone()),
                );
            }

            for conn in acceptor.connections() {
                latch.acquire();
                let latch = Arc::clone(&latch);
                let remote_addr = conn.remote_addr().to_owned();
                tokio::spawn(
                    conn.close()
                        .map(move |()| {
                            tracing::trace!(remote_addr = %remote_addr, "inbound connection closed");
                            latch.release("inbound connection");
                        })
                        .instrument(span.clone()),
                );
            }
        }

        for sub in self.sub_channels() {
            if sub.is_destroyed() {
                continue;
            }
            latch.acquire();
            match sub.close() {
                Ok(sub_closed) => {
                    let latch = Arc::clone(&latch);
                    tokio::spawn(
                        async move {
                            sub_closed.await;
                            latch.release("sub-channel");
                        }
                        .instrument(span.clone()),
                    );
                }
                Err(e) => {
                    tracing::debug!(parent: &span, service_name = sub.service_name(), error = %e, "sub-channel closed concurrently");
                    latch.release("sub-channel");
                }
            }
        }

        latch.acquire();
        let pool_closed = if self.owns_peer_pool() {
            self.peers.close()
        } else {
            let private = self.private_peers();
            tracing::debug!(parent: &span, peers = private.len(), "closing sub-channel peers");
            futures::future::join_all(private.iter().map(|peer| peer.close()))
                .map(|_| ())
                .boxed()
        };
        let pool_latch = Arc::clone(&latch);
        tokio::spawn(
            pool_closed
                .map(move |()| pool_latch.release("peer pool"))
                .instrument(span),
        );

        latch.release("close");
        Ok(closed)
    }

    fn owns_peer_pool(&self) -> bool {
        !matches!(self.role, Role::Service { top: Some(_), .. })
    }

    /// Peers in this channel's view that nothing else in the hierarchy uses:
    /// not handed out by the shared pool and not held by a live sibling.
    fn private_peers(&self) -> Vec<Arc<Peer>> {
        let siblings: Vec<Arc<Channel>> = self
            .top_channel()
            .map(|top| top.sub_channels())
            .unwrap_or_default()
            .into_iter()
            .filter(|sib| !std::ptr::eq(Arc::as_ptr(sib), self) && !sib.is_destroyed())
            .collect();
        self.peers_view()
            .into_iter()
            .filter(|peer| {
                let pooled = self
                    .peers
                    .get(peer.host_port())
                    .is_some_and(|p| Arc::ptr_eq(&p, peer));
                let shared = siblings
                    .iter()
                    .any(|sib| sib.peers_view.lock().iter().any(|p| Arc::ptr_eq(p, peer)));
                !pooled && !shared
            })
            .collect()
    }
}

impl ServiceLookup for Channel {
    fn service_handler(&self, service: &str) -> Option<Handler> {
        self.sub_channel(service).map(|sub| sub.handler.clone())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("service_name", &self.service_name())
            .field("top", &self.is_top_channel())
            .field("handler", &self.handler.kind())
            .field("host_port", &state.host_port)
            .field("listening", &state.listening)
            .field("destroyed", &state.destroyed)
            .field("sub_channels", &self.sub_channel_names())
            .finish_non_exhaustive()
    }
}
