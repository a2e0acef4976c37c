//! Outbound request options and request objects.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default per-request timeout when neither the channel nor the caller sets one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-channel request defaults, merged underneath caller options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDefaults {
    pub timeout: Duration,
    pub retry_limit: Option<u32>,
    pub headers: BTreeMap<String, String>,
    pub trace: Option<bool>,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_limit: None,
            headers: BTreeMap::new(),
            trace: None,
        }
    }
}

impl RequestDefaults {
    /// Field-wise merge: values set in `over` win, headers merge key-wise.
    pub fn overlay(&self, over: &RequestDefaultsPatch) -> Self {
        let mut headers = self.headers.clone();
        headers.extend(over.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            timeout: over.timeout.unwrap_or(self.timeout),
            retry_limit: over.retry_limit.or(self.retry_limit),
            headers,
            trace: over.trace.or(self.trace),
        }
    }

    /// Merge caller options over these defaults; the caller wins on conflict.
    ///
    /// A caller that set `service_name` but not `service` gets it aliased.
    pub fn apply(&self, options: &RequestOptions) -> RequestOptions {
        let mut merged = options.clone();
        if merged.service.is_none() {
            merged.service = merged.service_name.clone();
        }
        if merged.timeout.is_none() {
            merged.timeout = Some(self.timeout);
        }
        if merged.retry_limit.is_none() {
            merged.retry_limit = self.retry_limit;
        }
        if merged.trace.is_none() {
            merged.trace = self.trace;
        }
        let mut headers = self.headers.clone();
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.headers = headers;
        merged
    }
}

/// Partial [`RequestDefaults`], used when a sub-channel refines its parent's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDefaultsPatch {
    pub timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
    pub headers: BTreeMap<String, String>,
    pub trace: Option<bool>,
}

/// Caller-supplied options for one outbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Target service; on a top channel this selects the sub-channel.
    pub service: Option<String>,
    /// Alias for `service`, used when `service` is unset.
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
    /// Explicit `host:port` to send to, bypassing the sub-channel delegation.
    pub host: Option<String>,
    /// Streamed transfer; never retried.
    pub streamed: bool,
    pub timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
    pub headers: BTreeMap<String, String>,
    pub trace: Option<bool>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn streamed(mut self, streamed: bool) -> Self {
        self.streamed = streamed;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Where a request is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// Bound directly to the originating channel: no peer selection, no retry.
    SingleShot,
    /// Bound to a peer chosen (or pinned) by the peer pool.
    Peer(String),
}

/// One outbound RPC attempt. Created per call, never reused.
#[derive(Debug, Clone)]
pub struct Request {
    id: u64,
    channel_service: String,
    target: RequestTarget,
    options: RequestOptions,
    created_at_ms: u64,
}

fn next_request_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl Request {
    /// A request bound to the channel serving `channel_service`.
    pub fn single_shot(
        channel_service: impl Into<String>,
        options: RequestOptions,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id: next_request_id(),
            channel_service: channel_service.into(),
            target: RequestTarget::SingleShot,
            options,
            created_at_ms,
        }
    }

    /// A request bound to the peer at `host_port`.
    pub fn to_peer(
        host_port: impl Into<String>,
        options: RequestOptions,
        created_at_ms: u64,
    ) -> Self {
        let channel_service = options.service.clone().unwrap_or_default();
        Self {
            id: next_request_id(),
            channel_service,
            target: RequestTarget::Peer(host_port.into()),
            options,
            created_at_ms,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Service name of the channel the request was made through, or the
    /// requested service for pooled requests.
    pub fn channel_service(&self) -> &str {
        &self.channel_service
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// How many times the request may be sent.
    ///
    /// Single-shot and streamed requests go out exactly once.
    pub fn max_attempts(&self) -> u32 {
        match self.target {
            RequestTarget::SingleShot => 1,
            RequestTarget::Peer(_) if self.options.streamed => 1,
            RequestTarget::Peer(_) => 1 + self.options.retry_limit.unwrap_or(0),
        }
    }
}
