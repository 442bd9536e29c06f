// Per-connection service configuration. All fields are fixed at
// construction and never mutated afterwards.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 128;

/// Renders a request for error logs.
pub type RequestLogFormat<Req> = Arc<dyn Fn(&Req) -> String + Send + Sync>;

/// Supplies extra tags for the per-request `requests`/`latency` metrics.
pub type TagDecorator<Req, Resp> = Arc<dyn Fn(&Req, &Resp) -> Vec<(String, String)> + Send + Sync>;

pub struct ServiceConfig<Req, Resp> {
    // Metric namespace for everything this service emits.
    pub name: String,
    // Deadline for a single request; None disables timeouts.
    pub request_timeout: Option<Duration>,
    // Max concurrently in-flight requests per connection.
    pub request_buffer_size: usize,
    // Log per-request failures at error level.
    pub log_errors: bool,
    // Emit per-request `requests`/`latency` metrics.
    pub request_metrics: bool,
    // Error-log rendering of a request; Debug rendering when unset.
    pub request_log_format: Option<RequestLogFormat<Req>>,
    // Extra tags attached to `requests`/`latency`.
    pub tag_decorator: Option<TagDecorator<Req, Resp>>,
}

impl<Req, Resp> ServiceConfig<Req, Resp> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_timeout: Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            request_buffer_size: DEFAULT_REQUEST_BUFFER_SIZE,
            log_errors: true,
            request_metrics: true,
            request_log_format: None,
            tag_decorator: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_request_buffer_size(mut self, size: usize) -> Self {
        // A connection always has room for at least one in-flight request.
        self.request_buffer_size = size.max(1);
        self
    }

    pub fn with_log_errors(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    pub fn with_request_metrics(mut self, enabled: bool) -> Self {
        self.request_metrics = enabled;
        self
    }

    pub fn with_request_log_format(
        mut self,
        format: impl Fn(&Req) -> String + Send + Sync + 'static,
    ) -> Self {
        self.request_log_format = Some(Arc::new(format));
        self
    }

    pub fn with_tag_decorator(
        mut self,
        decorator: impl Fn(&Req, &Resp) -> Vec<(String, String)> + Send + Sync + 'static,
    ) -> Self {
        self.tag_decorator = Some(Arc::new(decorator));
        self
    }
}

impl<Req, Resp> Clone for ServiceConfig<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            request_timeout: self.request_timeout,
            request_buffer_size: self.request_buffer_size,
            log_errors: self.log_errors,
            request_metrics: self.request_metrics,
            request_log_format: self.request_log_format.clone(),
            tag_decorator: self.tag_decorator.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for ServiceConfig<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("request_timeout", &self.request_timeout)
            .field("request_buffer_size", &self.request_buffer_size)
            .field("log_errors", &self.log_errors)
            .field("request_metrics", &self.request_metrics)
            .finish_non_exhaustive()
    }
}
