//! Per-connection service state machine.
//!
//! One `ServiceServer` glues a request handler to a transport controller for
//! a single pipelined connection. The shape of the problem:
//!
//!   1) Responses must hit the wire in request-arrival order even when
//!      handler futures complete out of order. The pending queue is a strict
//!      FIFO and only its head is ever emitted; ready entries behind an
//!      unresolved head are held.
//!
//!   2) The output buffer is finite. The drain loop runs greedily while the
//!      head is ready and the controller accepts writes; when the controller
//!      refuses, draining pauses until a write-completed notification
//!      arrives.
//!
//!   3) Deadlines are swept in bulk from the idle tick rather than with a
//!      timer per request. Only the head can be the oldest entry, so the
//!      sweep stops at the first non-expired head.
//!
//!   4) Graceful shutdown pauses reads and lets in-flight work finish; the
//!      close check runs from drain/completion sites only, never from
//!      `graceful_disconnect` itself, which may be re-entered from inside
//!      the handler for the request currently being admitted.
//!
//! Every method runs on the connection's own task; there is no locking and
//! no concurrent mutation. Completion is keyed by token and idempotent, so
//! late or duplicate completions (including those racing a timeout) are
//! dropped without effect.
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

use crate::clock::{Clock, MonotonicClock};
use crate::config::ServiceConfig;
use crate::controller::{CloseCause, Controller, WriteResult};
use crate::error::{BoxError, FatalError, RequestError};
use crate::handler::{RequestHandler, ResponseFuture};
use crate::metrics::{MetricsSink, RuntimeSink, ServiceMetrics};
use crate::pending::{EntryState, PendingEntry, PendingQueue, RequestToken};

/// Outcome of admitting one decoded request.
pub enum Admission<Resp> {
    /// The request was handled inline; nothing further to drive.
    Settled,
    /// The handler's future is still in flight. The caller owns it and
    /// reports its outcome through [`ServiceServer::complete`].
    InFlight {
        token: RequestToken,
        future: ResponseFuture<Resp>,
    },
}

impl<Resp> fmt::Debug for Admission<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settled => f.write_str("Settled"),
            Self::InFlight { token, .. } => {
                f.debug_struct("InFlight").field("token", token).finish()
            }
        }
    }
}

pub struct ServiceServer<H, C>
where
    H: RequestHandler,
    C: Controller<H::Response>,
{
    config: ServiceConfig<H::Request, H::Response>,
    handler: H,
    controller: C,
    clock: Arc<dyn Clock>,
    metrics: ServiceMetrics,
    pending: PendingQueue<H::Request, H::Response>,
    next_token: u64,
    num_requests: u64,
    disconnecting: bool,
    drain_paused: bool,
    close_sent: bool,
    closed: bool,
}

impl<H, C> ServiceServer<H, C>
where
    H: RequestHandler,
    C: Controller<H::Response>,
{
    pub fn new(config: ServiceConfig<H::Request, H::Response>, handler: H, controller: C) -> Self {
        let metrics = ServiceMetrics::new(
            &config.name,
            config.request_metrics,
            Arc::new(RuntimeSink),
        );
        Self {
            config,
            handler,
            controller,
            clock: Arc::new(MonotonicClock::new()),
            metrics,
            pending: PendingQueue::new(),
            next_token: 0,
            num_requests: 0,
            disconnecting: false,
            drain_paused: false,
            close_sent: false,
            closed: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = ServiceMetrics::new(&self.config.name, self.config.request_metrics, sink);
        self
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Entries still waiting on their handler future.
    pub fn awaiting_len(&self) -> usize {
        self.pending.awaiting_len()
    }

    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn is_drain_paused(&self) -> bool {
        self.drain_paused
    }

    /// Admit one decoded request.
    ///
    /// Overflow is shed here, before the handler runs: the rejection still
    /// occupies a queue slot so the client sees it in pipeline order behind
    /// the responses already owed.
    pub fn process_message(
        &mut self,
        request: H::Request,
    ) -> Result<Admission<H::Response>, FatalError> {
        if self.closed {
            return Ok(Admission::Settled);
        }
        self.num_requests += 1;
        let now = self.clock.now_ms();

        if self.pending.len() >= self.config.request_buffer_size {
            let error = RequestError::BufferFull;
            report_failure(&self.config, &self.metrics, &request, &error);
            let response = self.handler.process_failure(&request, &error);
            self.enqueue(request, now, EntryState::Ready(response));
            self.drain()?;
            return Ok(Admission::Settled);
        }

        let mut future = self.handler.process_request(&request);
        let mut poll_cx = Context::from_waker(noop_waker_ref());
        match future.as_mut().poll(&mut poll_cx) {
            Poll::Ready(Ok(response)) => {
                if self.pending.is_empty() && self.controller.can_push() {
                    // Fast path: a synchronous success with an empty queue
                    // and a willing output buffer skips the queue entirely.
                    let tags = self.decorate(&request, &response);
                    let latency = self.clock.now_ms().saturating_sub(now);
                    self.metrics.response_pushed(latency, &tags);
                    if !self.controller.push(response) {
                        return Err(FatalError::PushRefused);
                    }
                    self.maybe_close_gracefully();
                } else {
                    self.enqueue(request, now, EntryState::Ready(response));
                    self.drain()?;
                }
                Ok(Admission::Settled)
            }
            Poll::Ready(Err(err)) => {
                // A synchronous failure gets the same treatment an
                // asynchronous one would: convert, queue, drain.
                let error = RequestError::Handler(err);
                report_failure(&self.config, &self.metrics, &request, &error);
                let response = self.handler.process_failure(&request, &error);
                self.enqueue(request, now, EntryState::Ready(response));
                self.drain()?;
                Ok(Admission::Settled)
            }
            Poll::Pending => {
                let token = self.enqueue(request, now, EntryState::Awaiting);
                Ok(Admission::InFlight { token, future })
            }
        }
    }

    /// Report the outcome of an in-flight handler future.
    ///
    /// Idempotent: if the entry is gone (timed out and drained, or the
    /// connection closed) or already resolved, the call is a no-op.
    pub fn complete(
        &mut self,
        token: RequestToken,
        result: Result<H::Response, BoxError>,
    ) -> Result<(), FatalError> {
        if self.closed {
            return Ok(());
        }
        {
            let Self {
                handler,
                pending,
                config,
                metrics,
                ..
            } = self;
            let Some(entry) = pending.get_mut(token) else {
                return Ok(());
            };
            if entry.is_ready() {
                return Ok(());
            }
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    let error = RequestError::Handler(err);
                    report_failure(config, metrics, &entry.request, &error);
                    handler.process_failure(&entry.request, &error)
                }
            };
            entry.tags = match &config.tag_decorator {
                Some(decorator) => decorator(&entry.request, &response),
                None => Vec::new(),
            };
            entry.state = EntryState::Ready(response);
        }
        self.drain()
    }

    /// Expire timed-out requests at the head of the queue.
    ///
    /// Only the head is inspected: later entries cannot be older. Each
    /// expiry triggers a drain, so a run of adjacent timed-out entries
    /// flushes in a single call.
    pub fn idle_check(&mut self) -> Result<(), FatalError> {
        if self.closed {
            return Ok(());
        }
        let Some(timeout) = self.config.request_timeout else {
            return Ok(());
        };
        let timeout_ms = timeout.as_millis() as u64;
        let now = self.clock.now_ms();
        loop {
            let expired = {
                let Self {
                    handler,
                    pending,
                    config,
                    metrics,
                    ..
                } = self;
                match pending.head_mut() {
                    Some(entry)
                        if !entry.is_ready()
                            && now.saturating_sub(entry.created_at_ms) > timeout_ms =>
                    {
                        let error = RequestError::Timeout;
                        report_failure(config, metrics, &entry.request, &error);
                        let response = handler.process_failure(&entry.request, &error);
                        entry.tags = match &config.tag_decorator {
                            Some(decorator) => decorator(&entry.request, &response),
                            None => Vec::new(),
                        };
                        entry.state = EntryState::Ready(response);
                        true
                    }
                    _ => false,
                }
            };
            if !expired {
                return Ok(());
            }
            self.drain()?;
        }
    }

    /// The controller finished (or failed) a previously accepted write.
    pub fn write_completed(&mut self, result: WriteResult) -> Result<(), FatalError> {
        if self.closed {
            return Ok(());
        }
        if let Err(err) = result {
            // At-most-once delivery: the response is not re-queued.
            let error = RequestError::DroppedReply(err);
            self.metrics.request_failed(error.class());
            tracing::warn!(error = %error, "response write failed");
        }
        self.drain_paused = false;
        self.drain()
    }

    /// Begin a graceful shutdown: stop reads, let in-flight work finish.
    ///
    /// Deliberately does not check for immediate close. This may be called
    /// from inside the handler for the request currently being admitted;
    /// closing here would cut off that request's response. Closure is
    /// polled from drain and completion sites instead.
    pub fn graceful_disconnect(&mut self) {
        if self.closed || self.disconnecting {
            return;
        }
        self.disconnecting = true;
        self.controller.pause_reads();
    }

    pub fn shutdown_request(&mut self) {
        self.graceful_disconnect();
    }

    /// Terminal finalizer. After this, no entry point mutates anything.
    pub fn connection_closed(&mut self, cause: CloseCause) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(
            ?cause,
            requests = self.num_requests,
            discarded = self.pending.len(),
            "connection closed"
        );
        self.metrics.connection_closed(self.num_requests);
        let remaining = self.pending.len();
        if remaining > 0 {
            self.metrics.concurrent_delta(-(remaining as i64));
        }
        self.pending.clear();
    }

    /// Finalizer for an unexpected loss of the connection.
    pub fn connection_lost(&mut self, cause: CloseCause) {
        if self.closed {
            return;
        }
        tracing::warn!(?cause, "connection lost");
        self.connection_closed(cause);
    }

    fn enqueue(
        &mut self,
        request: H::Request,
        now: u64,
        state: EntryState<H::Response>,
    ) -> RequestToken {
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        let tags = match &state {
            EntryState::Ready(response) => self.decorate(&request, response),
            EntryState::Awaiting => Vec::new(),
        };
        self.pending.push_back(PendingEntry {
            token,
            request,
            created_at_ms: now,
            state,
            tags,
        });
        self.metrics.concurrent_delta(1);
        token
    }

    fn decorate(&self, request: &H::Request, response: &H::Response) -> Vec<(String, String)> {
        match &self.config.tag_decorator {
            Some(decorator) => decorator(request, response),
            None => Vec::new(),
        }
    }

    /// Greedy drain: emit ready heads until the head is unresolved, the
    /// queue is empty, or the controller refuses writes.
    fn drain(&mut self) -> Result<(), FatalError> {
        if self.closed {
            return Ok(());
        }
        loop {
            if !self.pending.head_is_ready() {
                break;
            }
            if !self.controller.can_push() {
                self.drain_paused = true;
                break;
            }
            let Some(entry) = self.pending.pop_ready_head() else {
                break;
            };
            self.metrics.concurrent_delta(-1);
            let latency = self.clock.now_ms().saturating_sub(entry.created_at_ms);
            self.metrics.response_pushed(latency, &entry.tags);
            if !self.controller.push(entry.response) {
                return Err(FatalError::PushRefused);
            }
        }
        self.maybe_close_gracefully();
        Ok(())
    }

    fn maybe_close_gracefully(&mut self) {
        if self.disconnecting && !self.close_sent && !self.closed && self.pending.is_empty() {
            self.close_sent = true;
            self.controller.close_gracefully();
        }
    }
}

fn report_failure<Req, Resp>(
    config: &ServiceConfig<Req, Resp>,
    metrics: &ServiceMetrics,
    request: &Req,
    error: &RequestError,
) where
    Req: fmt::Debug,
{
    metrics.request_failed(error.class());
    if config.log_errors {
        let rendered = match &config.request_log_format {
            Some(format) => format(request),
            None => format!("{request:?}"),
        };
        tracing::error!(
            request = %rendered,
            class = error.class(),
            error = %error,
            "request failed"
        );
    }
}
