//! Peer pool contract and the default peer list.
//!
//! One pool exists per channel hierarchy. The top channel creates it and every
//! sub-channel holds the same `Arc`, so outbound connections to a peer are never
//! duplicated across services.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::{ChannelError, Random, Request, RequestOptions, Timers};

/// A remote `host:port` the channel can send requests to.
pub struct Peer {
    host_port: String,
    closed: AtomicBool,
}

impl Peer {
    pub fn new(host_port: impl Into<String>) -> Self {
        Self {
            host_port: host_port.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the peer. Idempotent; resolves once the peer is closed.
    pub fn close(&self) -> BoxFuture<'static, ()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(host_port = %self.host_port, "peer closed");
        }
        futures::future::ready(()).boxed()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("host_port", &self.host_port)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A peer given to a sub-channel, either by address or as an existing peer.
#[derive(Debug, Clone)]
pub enum PeerRef {
    Addr(String),
    Peer(Arc<Peer>),
}

impl From<&str> for PeerRef {
    fn from(addr: &str) -> Self {
        PeerRef::Addr(addr.to_owned())
    }
}

impl From<String> for PeerRef {
    fn from(addr: String) -> Self {
        PeerRef::Addr(addr)
    }
}

impl From<Arc<Peer>> for PeerRef {
    fn from(peer: Arc<Peer>) -> Self {
        PeerRef::Peer(peer)
    }
}

/// Outbound peer management: selection, retry policy and outbound connections.
pub trait PeerPool: Send + Sync + 'static {
    /// Return the peer for `host_port`, creating it if it is unknown.
    fn add(&self, host_port: &str) -> Arc<Peer>;

    /// Look up a known peer.
    fn get(&self, host_port: &str) -> Option<Arc<Peer>>;

    /// Build a request, targeting `explicit_host` when given and otherwise
    /// choosing a peer.
    fn request(
        &self,
        explicit_host: Option<&str>,
        options: RequestOptions,
    ) -> Result<Request, ChannelError>;

    /// Close every peer. The returned future resolves exactly once, after all
    /// peers have closed.
    fn close(&self) -> BoxFuture<'static, ()>;
}

/// Default [`PeerPool`]: a map of peers with uniform random selection.
pub struct PeerList {
    peers: RwLock<BTreeMap<String, Arc<Peer>>>,
    random: Arc<dyn Random>,
    timers: Arc<dyn Timers>,
}

impl PeerList {
    pub fn new(random: Arc<dyn Random>, timers: Arc<dyn Timers>) -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            random,
            timers,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn host_ports(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    fn choose(&self, service: Option<&str>) -> Result<Arc<Peer>, ChannelError> {
        let peers = self.peers.read();
        let open: Vec<&Arc<Peer>> = peers.values().filter(|p| !p.is_closed()).collect();
        if open.is_empty() {
            return Err(ChannelError::NoPeerAvailable {
                service: service.map(str::to_owned),
            });
        }
        Ok(Arc::clone(open[self.random.index(open.len())]))
    }
}

impl fmt::Debug for PeerList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerList")
            .field("peers", &self.host_ports())
            .finish_non_exhaustive()
    }
}

impl PeerPool for PeerList {
    fn add(&self, host_port: &str) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().get(host_port) {
            return Arc::clone(peer);
        }
        let mut peers = self.peers.write();
        let peer = peers
            .entry(host_port.to_owned())
            .or_insert_with(|| {
                tracing::debug!(host_port, "peer added");
                Arc::new(Peer::new(host_port))
            });
        Arc::clone(peer)
    }

    fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(host_port).cloned()
    }

    fn request(
        &self,
        explicit_host: Option<&str>,
        options: RequestOptions,
    ) -> Result<Request, ChannelError> {
        let peer = match explicit_host {
            Some(host) => self.add(host),
            None => self.choose(options.service.as_deref())?,
        };
        if peer.is_closed() {
            return Err(ChannelError::PeerClosed {
                host_port: peer.host_port().to_owned(),
            });
        }
        Ok(Request::to_peer(
            peer.host_port(),
            options,
            self.timers.now_ms(),
        ))
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let closing: Vec<_> = self.peers.read().values().map(|p| p.close()).collect();
        tracing::debug!(peers = closing.len(), "closing peer list");
        futures::future::join_all(closing).map(|_| ()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FixedRandom, ManualTimers, RequestTarget};

    fn list() -> PeerList {
        PeerList::new(Arc::new(FixedRandom(0.0)), Arc::new(ManualTimers::new(7)))
    }

    #[test]
    fn add_returns_existing_peer() {
        let peers = list();
        let a = peers.add("10.0.0.1:4040");
        let b = peers.add("10.0.0.1:4040");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn explicit_host_is_targeted_and_added() {
        let peers = list();
        let req = peers
            .request(Some("10.0.0.2:1"), RequestOptions::new())
            .unwrap();
        assert_eq!(req.target(), &RequestTarget::Peer("10.0.0.2:1".into()));
        assert_eq!(req.created_at_ms(), 7);
        assert!(peers.get("10.0.0.2:1").is_some());
    }

    #[test]
    fn selection_without_peers_fails() {
        let err = list()
            .request(None, RequestOptions::new().service("svc"))
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoPeerAvailable { service: Some(ref s) } if s == "svc"));
    }

    #[tokio::test]
    async fn close_closes_every_peer() {
        let peers = list();
        let a = peers.add("a:1");
        let b = peers.add("b:2");
        peers.close().await;
        assert!(a.is_closed() && b.is_closed());

        let err = peers.request(Some("a:1"), RequestOptions::new()).unwrap_err();
        assert!(matches!(err, ChannelError::PeerClosed { .. }));
        assert!(matches!(
            peers.request(None, RequestOptions::new()),
            Err(ChannelError::NoPeerAvailable { .. })
        ));
    }
}
