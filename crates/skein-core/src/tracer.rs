//! Span collection.
//!
//! Connections produce [`Span`]s; the channel hands them to a [`Tracer`], which
//! forwards them to a [`SpanReporter`] when tracing is enabled. Sampling and
//! export are the reporter's business.

use std::fmt;
use std::sync::Arc;

use crate::{Random, Timers};

/// A timestamped point in a span's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub value: String,
    pub timestamp_ms: u64,
}

/// A unit of traced work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub name: String,
    pub service_name: String,
    /// `host:port` of the endpoint that recorded the span, if bound.
    pub endpoint: Option<String>,
    pub annotations: Vec<Annotation>,
}

impl Span {
    pub fn annotate(&mut self, value: impl Into<String>, timestamp_ms: u64) {
        self.annotations.push(Annotation {
            value: value.into(),
            timestamp_ms,
        });
    }
}

/// Destination for finished spans. Fire-and-forget.
pub trait SpanReporter: Send + Sync + 'static {
    fn report(&self, span: Span);
}

/// Reporter that writes spans to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl SpanReporter for LogReporter {
    fn report(&self, span: Span) {
        tracing::debug!(
            trace_id = span.trace_id,
            span_id = span.span_id,
            parent_id = ?span.parent_id,
            name = %span.name,
            service_name = %span.service_name,
            endpoint = ?span.endpoint,
            annotations = span.annotations.len(),
            "span reported"
        );
    }
}

/// Callback handed to connections so they can report spans without knowing
/// about the tracer.
pub type SpanSink = Arc<dyn Fn(Span) + Send + Sync>;

/// Per-channel span routing.
pub struct Tracer {
    reporter: Arc<dyn SpanReporter>,
    enabled: bool,
    forced: bool,
    service_name: String,
    random: Arc<dyn Random>,
    timers: Arc<dyn Timers>,
}

impl Tracer {
    pub fn new(
        reporter: Arc<dyn SpanReporter>,
        enabled: bool,
        forced: bool,
        service_name: impl Into<String>,
        random: Arc<dyn Random>,
        timers: Arc<dyn Timers>,
    ) -> Self {
        Self {
            reporter,
            enabled,
            forced,
            service_name: service_name.into(),
            random,
            timers,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled || self.forced
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Start a new root span, stamped with the configured clock and ids.
    pub fn start_span(&self, name: impl Into<String>, endpoint: Option<String>) -> Span {
        let id = self.random.next_u64();
        Span {
            trace_id: id,
            span_id: id,
            parent_id: None,
            name: name.into(),
            service_name: self.service_name.clone(),
            endpoint,
            annotations: Vec::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.timers.now_ms()
    }

    /// Forward `span` to the reporter when tracing is on; drop it otherwise.
    pub fn report(&self, span: Span) {
        if self.is_enabled() {
            self.reporter.report(span);
        } else {
            tracing::trace!(span_id = span.span_id, "tracing disabled; span dropped");
        }
    }

    /// A [`SpanSink`] that reports through this tracer.
    pub fn sink(self: &Arc<Self>) -> SpanSink {
        let tracer = Arc::clone(self);
        Arc::new(move |span| tracer.report(span))
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.enabled)
            .field("forced", &self.forced)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}
