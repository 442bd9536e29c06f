// Echo request handler: the demonstration workload for the service core.
use bytes::Bytes;
use lyra_service::{RequestError, RequestHandler, ResponseFuture};
use lyra_wire::{Frame, FrameHeader, KIND_ERROR};

pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    type Request = Frame;
    type Response = Frame;

    fn process_request(&mut self, request: &Frame) -> ResponseFuture<Frame> {
        // Completes synchronously, which lets the core take its fast path
        // on an otherwise idle connection.
        let payload = request.payload.clone();
        Box::pin(std::future::ready(
            Frame::response(payload).map_err(Into::into),
        ))
    }

    fn process_failure(&mut self, _request: &Frame, error: &RequestError) -> Frame {
        let message = format!("{}: {error}", error.class());
        let payload = Bytes::from(message.into_bytes());
        // Built directly: the constructor's size check cannot matter for a
        // short diagnostic string, and this path has no error channel.
        Frame {
            header: FrameHeader::new(KIND_ERROR, payload.len() as u32),
            payload,
        }
    }
}
