// Handler contract implemented by services.
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::{BoxError, RequestError};

/// Boxed future returned by [`RequestHandler::process_request`].
pub type ResponseFuture<R> = Pin<Box<dyn Future<Output = Result<R, BoxError>> + Send>>;

/// Produces responses for decoded requests.
///
/// `process_request` may complete synchronously (the future is already
/// ready when returned) or on a later scheduling tick; the core detects the
/// former and skips queueing when it can. `process_failure` converts any
/// failure into a protocol-visible response, so a client always sees a
/// reply rather than a dropped connection. It returns the response
/// directly: there is no error path out of it by construction.
pub trait RequestHandler: Send {
    type Request: fmt::Debug + Send;
    type Response: Send;

    fn process_request(&mut self, request: &Self::Request) -> ResponseFuture<Self::Response>;

    fn process_failure(
        &mut self,
        request: &Self::Request,
        error: &RequestError,
    ) -> Self::Response;
}
