//! Tokio adapter that drives one [`ServiceServer`] per connection.
//!
//! Task layout for a connection:
//!
//!   - A read pump owns the request source and feeds decoded requests into
//!     a small channel. It watches the pause flag, so `pause_reads` stops
//!     delivery without the dispatch loop having to cancel a half-finished
//!     read.
//!   - The dispatch loop owns the server state machine. It selects over
//!     inbound requests, handler completions (a `FuturesUnordered`, so
//!     futures finish in any order while the queue keeps wire order),
//!     write-completed notifications, the idle ticker, and the close flag.
//!   - A writer task is the only code that touches the response sink. The
//!     bounded channel between the server and the writer is the output
//!     buffer the controller reports on: `can_push` is remaining capacity.
//!
//! On any write failure the writer reports the error and stops; the
//! dispatch loop counts the dropped reply and tears the connection down
//! when the writer side disappears.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{mpsc, watch};

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::controller::{CloseCause, Controller, WriteResult};
use crate::error::{BoxError, FatalError};
use crate::handler::RequestHandler;
use crate::metrics::MetricsSink;
use crate::pending::RequestToken;
use crate::server::{Admission, ServiceServer};

pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_WRITE_BUFFER: usize = 64;

/// Supplies decoded requests; `None` means the peer finished cleanly.
pub trait RequestSource<Req>: Send {
    fn next_request(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Req>, BoxError>> + Send + '_>>;
}

/// Writes encoded responses. A dedicated writer task is the only caller.
pub trait ResponseSink<Resp>: Send {
    fn write(
        &mut self,
        response: Resp,
    ) -> Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + '_>>;

    /// Flush and finish the output side once the connection is done.
    fn finish(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error("transport failed: {0}")]
    Transport(#[source] BoxError),
}

/// Controller backed by the driver's bounded output queue.
pub struct ChannelController<Resp> {
    out_tx: mpsc::Sender<Resp>,
    paused_tx: watch::Sender<bool>,
    close_tx: watch::Sender<bool>,
}

impl<Resp: Send> Controller<Resp> for ChannelController<Resp> {
    fn can_push(&self) -> bool {
        self.out_tx.capacity() > 0
    }

    fn push(&mut self, response: Resp) -> bool {
        self.out_tx.try_send(response).is_ok()
    }

    fn pause_reads(&mut self) {
        let _ = self.paused_tx.send(true);
    }

    fn close_gracefully(&mut self) {
        let _ = self.close_tx.send(true);
    }
}

enum ReadEvent<Req> {
    Request(Req),
    Eof,
    Failed(BoxError),
}

/// Builder for a per-connection dispatch loop.
pub struct ConnectionDriver<H: RequestHandler> {
    config: ServiceConfig<H::Request, H::Response>,
    handler: H,
    clock: Option<Arc<dyn Clock>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
    idle_period: Duration,
    write_buffer: usize,
}

impl<H> ConnectionDriver<H>
where
    H: RequestHandler + 'static,
    H::Request: 'static,
    H::Response: 'static,
{
    pub fn new(config: ServiceConfig<H::Request, H::Response>, handler: H) -> Self {
        Self {
            config,
            handler,
            clock: None,
            metrics_sink: None,
            idle_period: DEFAULT_IDLE_PERIOD,
            write_buffer: DEFAULT_WRITE_BUFFER,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn with_idle_period(mut self, period: Duration) -> Self {
        self.idle_period = period;
        self
    }

    pub fn with_write_buffer(mut self, size: usize) -> Self {
        self.write_buffer = size.max(1);
        self
    }

    /// Run the connection to completion.
    pub async fn run<S, W>(self, source: S, writer: W) -> Result<(), DriverError>
    where
        S: RequestSource<H::Request> + 'static,
        W: ResponseSink<H::Response> + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(self.write_buffer);
        let (result_tx, mut result_rx) = mpsc::channel(self.write_buffer);
        let (req_tx, mut req_rx) = mpsc::channel(1);
        let (paused_tx, paused_rx) = watch::channel(false);
        let (close_tx, mut close_rx) = watch::channel(false);

        let controller = ChannelController {
            out_tx,
            paused_tx,
            close_tx,
        };
        let mut server = ServiceServer::new(self.config, self.handler, controller);
        if let Some(clock) = self.clock {
            server = server.with_clock(clock);
        }
        if let Some(sink) = self.metrics_sink {
            server = server.with_metrics_sink(sink);
        }

        let read_task = tokio::spawn(run_read_loop(source, req_tx, paused_rx));
        let writer_task = tokio::spawn(run_writer_loop(writer, out_rx, result_tx));

        let mut in_flight: FuturesUnordered<
            Pin<Box<dyn Future<Output = (RequestToken, Result<H::Response, BoxError>)> + Send>>,
        > = FuturesUnordered::new();
        let mut ticker = tokio::time::interval(self.idle_period);
        let mut source_done = false;

        let outcome = loop {
            if *close_rx.borrow() {
                break Ok(CloseCause::Graceful);
            }
            // A clean EOF with an empty queue closes immediately; the core
            // itself only polls closure when it drains something. In-flight
            // futures without a queue entry are zombies (their requests
            // already timed out) and cannot hold the connection open.
            if source_done && server.pending_len() == 0 {
                break Ok(CloseCause::Graceful);
            }
            tokio::select! {
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        break Ok(CloseCause::Graceful);
                    }
                }
                result = result_rx.recv() => match result {
                    Some(result) => {
                        if let Err(err) = server.write_completed(result) {
                            break Err(DriverError::Fatal(err));
                        }
                    }
                    // The writer stopped: the transport is gone.
                    None => break Err(DriverError::Transport("response writer stopped".into())),
                },
                Some((token, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(err) = server.complete(token, result) {
                        break Err(DriverError::Fatal(err));
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = server.idle_check() {
                        break Err(DriverError::Fatal(err));
                    }
                }
                event = req_rx.recv(), if !source_done => match event {
                    Some(ReadEvent::Request(request)) => {
                        match server.process_message(request) {
                            Ok(Admission::Settled) => {}
                            Ok(Admission::InFlight { token, future }) => {
                                in_flight.push(Box::pin(async move { (token, future.await) }));
                            }
                            Err(err) => break Err(DriverError::Fatal(err)),
                        }
                    }
                    Some(ReadEvent::Eof) => {
                        source_done = true;
                        server.graceful_disconnect();
                    }
                    Some(ReadEvent::Failed(err)) => break Err(DriverError::Transport(err)),
                    None => source_done = true,
                },
            }
        };

        read_task.abort();
        match &outcome {
            Ok(cause) => server.connection_closed(*cause),
            Err(_) => server.connection_lost(CloseCause::TransportError),
        }
        // Dropping the server drops the controller's sender; the writer
        // drains whatever is queued and then finishes the sink. The result
        // receiver goes first so those final sends fail instead of blocking.
        drop(result_rx);
        drop(server);
        let _ = writer_task.await;
        outcome.map(|_| ())
    }
}

async fn run_read_loop<Req, S>(
    mut source: S,
    req_tx: mpsc::Sender<ReadEvent<Req>>,
    mut paused_rx: watch::Receiver<bool>,
) where
    Req: Send,
    S: RequestSource<Req>,
{
    loop {
        if *paused_rx.borrow() {
            // Reads stay paused for the rest of the connection.
            break;
        }
        tokio::select! {
            changed = paused_rx.changed() => {
                if changed.is_err() || *paused_rx.borrow() {
                    break;
                }
            }
            request = source.next_request() => match request {
                Ok(Some(request)) => {
                    if req_tx.send(ReadEvent::Request(request)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = req_tx.send(ReadEvent::Eof).await;
                    break;
                }
                Err(err) => {
                    let _ = req_tx.send(ReadEvent::Failed(err)).await;
                    break;
                }
            }
        }
    }
}

// Drains queued responses, reports each write's outcome, and stops on the
// first failure.
async fn run_writer_loop<Resp, W>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Resp>,
    result_tx: mpsc::Sender<WriteResult>,
) where
    W: ResponseSink<Resp>,
    Resp: Send,
{
    while let Some(response) = out_rx.recv().await {
        let result = writer.write(response).await;
        let failed = result.is_err();
        let _ = result_tx.send(result).await;
        if failed {
            break;
        }
    }
    writer.finish().await;
}
