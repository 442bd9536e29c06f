//! Per-connection service core for pipelined request-response protocols.
//!
//! A client may send many requests without waiting for responses; the
//! server is obliged to answer in arrival order. [`ServiceServer`] is the
//! state machine that holds that line: it admits decoded requests, invokes
//! a [`RequestHandler`] whose futures may complete in any order, and drains
//! responses to a transport [`Controller`] strictly FIFO, honoring output
//! backpressure, per-request deadlines, and a graceful-shutdown protocol
//! that lets in-flight work finish. [`ConnectionDriver`] is the bundled
//! tokio adapter that runs one such state machine per connection.
//!
//! ```
//! use lyra_service::test_support::MockController;
//! use lyra_service::{
//!     Admission, RequestError, RequestHandler, ResponseFuture, ServiceConfig, ServiceServer,
//! };
//!
//! struct Upper;
//!
//! impl RequestHandler for Upper {
//!     type Request = String;
//!     type Response = String;
//!
//!     fn process_request(&mut self, request: &String) -> ResponseFuture<String> {
//!         Box::pin(std::future::ready(Ok(request.to_uppercase())))
//!     }
//!
//!     fn process_failure(&mut self, _request: &String, error: &RequestError) -> String {
//!         format!("error: {}", error.class())
//!     }
//! }
//!
//! let controller = MockController::new();
//! let state = controller.state();
//! let mut server = ServiceServer::new(ServiceConfig::new("demo"), Upper, controller);
//! let admission = server.process_message("ping".to_string()).unwrap();
//! assert!(matches!(admission, Admission::Settled));
//! assert_eq!(state.pushes(), vec!["PING".to_string()]);
//! ```

pub mod clock;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pending;
pub mod server;
pub mod test_support;

pub use clock::{Clock, MonotonicClock};
pub use config::ServiceConfig;
pub use controller::{CloseCause, Controller, WriteResult};
pub use driver::{ConnectionDriver, DriverError, RequestSource, ResponseSink};
pub use error::{BoxError, FatalError, RequestError};
pub use handler::{RequestHandler, ResponseFuture};
pub use metrics::{MetricsSink, RuntimeSink};
pub use pending::RequestToken;
pub use server::{Admission, ServiceServer};
