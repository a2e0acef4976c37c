//! Channel configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    ConnectionFactory, Handler, PeerPool, PeerRef, Random, RequestDefaults, RequestDefaultsPatch,
    SpanReporter, SystemTimers, TcpConnectionFactory, ThreadRandom, Timers,
};

pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT_FUZZ: Duration = Duration::from_millis(100);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

fn env_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
}

/// `<exe>[<pid>]`, used when no process name is configured.
pub fn default_process_name() -> String {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "skein".to_owned());
    format!("{exe}[{}]", std::process::id())
}

/// Options for a top channel.
#[derive(Clone)]
pub struct ChannelOptions {
    pub timeout_check_interval: Duration,
    pub timeout_fuzz: Duration,
    pub process_name: String,
    /// Set only for channels that serve a single service directly.
    pub service_name: Option<String>,
    /// Defaults to service-name dispatch.
    pub handler: Option<Handler>,
    pub trace: bool,
    pub force_trace: bool,
    pub tracing_service_name: Option<String>,
    pub trace_reporter: Option<Arc<dyn SpanReporter>>,
    pub request_defaults: RequestDefaults,
    /// Parent span for everything the channel logs.
    pub log_span: tracing::Span,
    pub random: Arc<dyn Random>,
    pub timers: Arc<dyn Timers>,
    /// Defaults to a [`PeerList`](crate::PeerList) over `random` and `timers`.
    pub peer_pool: Option<Arc<dyn PeerPool>>,
    pub connection_factory: Arc<dyn ConnectionFactory>,
    /// Buffered events per subscriber before slow subscribers lag.
    pub event_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        let process_name = default_process_name();
        let log_span = tracing::info_span!("skein", process = %process_name);
        Self {
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            timeout_fuzz: DEFAULT_TIMEOUT_FUZZ,
            process_name,
            service_name: None,
            handler: None,
            trace: false,
            force_trace: false,
            tracing_service_name: None,
            trace_reporter: None,
            request_defaults: RequestDefaults::default(),
            log_span,
            random: Arc::new(ThreadRandom),
            timers: Arc::new(SystemTimers),
            peer_pool: None,
            connection_factory: Arc::new(TcpConnectionFactory),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ChannelOptions {
    /// Defaults, with `SKEIN_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(interval) = env_ms("SKEIN_TIMEOUT_CHECK_INTERVAL_MS").filter(|d| !d.is_zero())
        {
            options.timeout_check_interval = interval;
        }
        if let Some(fuzz) = env_ms("SKEIN_TIMEOUT_FUZZ_MS") {
            options.timeout_fuzz = fuzz;
        }
        if let Some(name) = std::env::var("SKEIN_PROCESS_NAME")
            .ok()
            .filter(|n| !n.is_empty())
        {
            options.log_span = tracing::info_span!("skein", process = %name);
            options.process_name = name;
        }
        if let Some(trace) = env_flag("SKEIN_TRACE") {
            options.trace = trace;
        }
        if let Some(timeout) = env_ms("SKEIN_REQUEST_TIMEOUT_MS").filter(|d| !d.is_zero()) {
            options.request_defaults.timeout = timeout;
        }
        options
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn force_trace(mut self, force_trace: bool) -> Self {
        self.force_trace = force_trace;
        self
    }

    pub fn trace_reporter(mut self, reporter: Arc<dyn SpanReporter>) -> Self {
        self.trace_reporter = Some(reporter);
        self
    }

    pub fn request_defaults(mut self, defaults: RequestDefaults) -> Self {
        self.request_defaults = defaults;
        self
    }

    pub fn log_span(mut self, span: tracing::Span) -> Self {
        self.log_span = span;
        self
    }

    pub fn random(mut self, random: Arc<dyn Random>) -> Self {
        self.random = random;
        self
    }

    pub fn timers(mut self, timers: Arc<dyn Timers>) -> Self {
        self.timers = timers;
        self
    }

    pub fn peer_pool(mut self, pool: Arc<dyn PeerPool>) -> Self {
        self.peer_pool = Some(pool);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = factory;
        self
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("timeout_check_interval", &self.timeout_check_interval)
            .field("timeout_fuzz", &self.timeout_fuzz)
            .field("process_name", &self.process_name)
            .field("service_name", &self.service_name)
            .field("handler", &self.handler.as_ref().map(Handler::kind))
            .field("trace", &self.trace)
            .field("force_trace", &self.force_trace)
            .field("tracing_service_name", &self.tracing_service_name)
            .field("request_defaults", &self.request_defaults)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

/// Options for a sub-channel. Anything not listed is inherited from the top
/// channel.
#[derive(Debug, Clone, Default)]
pub struct SubChannelOptions {
    pub service_name: String,
    /// Defaults to endpoint dispatch.
    pub handler: Option<Handler>,
    /// Refines the top channel's request defaults.
    pub request_defaults: RequestDefaultsPatch,
    pub trace: Option<bool>,
    pub tracing_service_name: Option<String>,
    /// Peers this service talks to, resolved through the shared pool.
    pub peers: Vec<PeerRef>,
}

impl SubChannelOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn request_defaults(mut self, patch: RequestDefaultsPatch) -> Self {
        self.request_defaults = patch;
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn peer(mut self, peer: impl Into<PeerRef>) -> Self {
        self.peers.push(peer.into());
        self
    }
}
