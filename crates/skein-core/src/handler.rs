//! Inbound request handlers.
//!
//! A channel has exactly one [`Handler`]. Which variant it gets decides whether
//! endpoints can be registered on it:
//!
//! - [`Handler::Endpoint`]: name-based endpoint table; the only variant that
//!   accepts registrations. Default for sub-channels.
//! - [`Handler::ServiceName`]: forwards each call to the sub-channel serving the
//!   call's service. Default for top channels.
//! - [`Handler::Custom`]: user code.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::HandlerError;

/// An inbound call, as handed to a handler by the frame layer.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub service: String,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub arg2: Bytes,
    pub arg3: Bytes,
    pub remote_addr: Option<String>,
}

impl Call {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        self.arg2 = arg2.into();
        self.arg3 = arg3.into();
        self
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<Bytes, HandlerError>>;

/// Boxed endpoint function.
pub type EndpointFn = Arc<dyn Fn(Call) -> HandlerFuture + Send + Sync>;

/// User-supplied handler.
pub trait CustomHandler: Send + Sync + 'static {
    fn handle(&self, call: Call) -> HandlerFuture;
}

/// Resolves a service name to the handler of the sub-channel serving it.
pub trait ServiceLookup: Send + Sync + 'static {
    fn service_handler(&self, service: &str) -> Option<Handler>;
}

/// Discriminant of [`Handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Endpoint,
    ServiceName,
    Custom,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::ServiceName => "service-name",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint table keyed by endpoint name.
#[derive(Default)]
pub struct EndpointHandler {
    service_name: String,
    endpoints: RwLock<HashMap<String, EndpointFn>>,
}

impl EndpointHandler {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Register `f` under `name`, replacing any previous registration.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let boxed: EndpointFn = Arc::new(move |call| f(call).boxed());
        if self.endpoints.write().insert(name.clone(), boxed).is_some() {
            tracing::warn!(
                service_name = %self.service_name,
                endpoint = %name,
                "endpoint re-registered; previous handler replaced"
            );
        } else {
            tracing::debug!(service_name = %self.service_name, endpoint = %name, "endpoint registered");
        }
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn handle(&self, call: Call) -> HandlerFuture {
        let endpoint = self.endpoints.read().get(&call.endpoint).cloned();
        match endpoint {
            Some(f) => f(call),
            None => {
                let message = format!(
                    "no such endpoint service={:?} endpoint={:?}",
                    call.service, call.endpoint
                );
                futures::future::ready(Err(HandlerError::bad_request(message))).boxed()
            }
        }
    }
}

impl fmt::Debug for EndpointHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandler")
            .field("service_name", &self.service_name)
            .field("endpoints", &self.endpoint_names())
            .finish()
    }
}

/// Dispatch by service name to sub-channels.
///
/// Holds a non-owning handle to the top channel's registry.
#[derive(Clone)]
pub struct ServiceNameHandler {
    lookup: Weak<dyn ServiceLookup>,
}

impl ServiceNameHandler {
    pub fn new(lookup: Weak<dyn ServiceLookup>) -> Self {
        Self { lookup }
    }

    pub fn handle(&self, call: Call) -> HandlerFuture {
        let handler = self
            .lookup
            .upgrade()
            .and_then(|lookup| lookup.service_handler(&call.service));
        match handler {
            Some(handler) => handler.handle(call),
            None => {
                let message = format!("no such service {:?}", call.service);
                futures::future::ready(Err(HandlerError::bad_request(message))).boxed()
            }
        }
    }
}

impl fmt::Debug for ServiceNameHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNameHandler")
            .field("live", &(self.lookup.strong_count() > 0))
            .finish()
    }
}

/// The handler bound to a channel.
#[derive(Clone)]
pub enum Handler {
    Endpoint(Arc<EndpointHandler>),
    ServiceName(ServiceNameHandler),
    Custom(Arc<dyn CustomHandler>),
}

impl Handler {
    pub fn endpoint(service_name: impl Into<String>) -> Self {
        Handler::Endpoint(Arc::new(EndpointHandler::new(service_name)))
    }

    pub fn custom(handler: impl CustomHandler) -> Self {
        Handler::Custom(Arc::new(handler))
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Endpoint(_) => HandlerKind::Endpoint,
            Handler::ServiceName(_) => HandlerKind::ServiceName,
            Handler::Custom(_) => HandlerKind::Custom,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Arc<EndpointHandler>> {
        match self {
            Handler::Endpoint(h) => Some(h),
            _ => None,
        }
    }

    pub fn handle(&self, call: Call) -> HandlerFuture {
        match self {
            Handler::Endpoint(h) => h.handle(call),
            Handler::ServiceName(h) => h.handle(call),
            Handler::Custom(h) => h.handle(call),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Endpoint(h) => h.fmt(f),
            Handler::ServiceName(h) => h.fmt(f),
            Handler::Custom(_) => f.write_str("CustomHandler"),
        }
    }
}
