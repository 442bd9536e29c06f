// Error taxonomy for the service core.
//
// Per-request failures are recoverable: they are converted into protocol
// responses by the handler's failure path and tagged on the `errors` metric
// by class. Fatal errors are invariant violations that terminate the
// connection they occurred on.

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures that occur while producing a single response.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("request buffer full")]
    BufferFull,
    #[error("request timed out at queue head")]
    Timeout,
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),
    #[error("reply dropped after the transport accepted it: {0}")]
    DroppedReply(#[source] BoxError),
}

impl RequestError {
    /// Stable class tag attached to the `errors` metric.
    pub fn class(&self) -> &'static str {
        match self {
            Self::BufferFull => "buffer_full",
            Self::Timeout => "timeout",
            Self::Handler(_) => "handler",
            Self::DroppedReply(_) => "dropped_reply",
        }
    }
}

/// Invariant violations indicating a bug in the transport wiring.
#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("controller refused a push after can_push returned true")]
    PushRefused,
}
