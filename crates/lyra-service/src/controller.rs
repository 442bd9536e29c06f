// Transport capability consumed by the service core.
//
// The controller owns the socket, the output buffer, and the read pump; the
// core only ever talks to it through this narrow surface. Every `push` is
// guarded by `can_push`, so a `false` return from `push` is a wiring bug,
// not a condition the core recovers from.
use crate::error::BoxError;

/// Outcome of a previously accepted push, delivered back into the core
/// through `write_completed`.
pub type WriteResult = Result<(), BoxError>;

/// Why a connection finalizer ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Graceful,
    PeerClosed,
    TransportError,
}

pub trait Controller<Resp> {
    /// Is the output buffer willing to accept another response?
    fn can_push(&self) -> bool;

    /// Hand one response to the output path. Returns whether the output
    /// buffer accepted it.
    fn push(&mut self, response: Resp) -> bool;

    /// Stop delivering further requests on this connection.
    fn pause_reads(&mut self);

    /// Initiate an orderly close once outstanding writes have flushed.
    fn close_gracefully(&mut self);
}
