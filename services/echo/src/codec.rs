// Frame codec glue between tokio streams and the connection driver, with an
// explicit cap on accepted frame sizes and a reusable scratch buffer.
use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use lyra_service::{BoxError, RequestSource, ResponseSink};
use lyra_wire::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads length-prefixed frames from the connection's receive side.
pub struct FrameSource<R> {
    read: R,
    max_frame_bytes: usize,
    scratch: BytesMut,
}

impl<R> FrameSource<R> {
    pub fn new(read: R, max_frame_bytes: usize) -> Self {
        Self {
            read,
            max_frame_bytes,
            scratch: BytesMut::new(),
        }
    }
}

impl<R> RequestSource<Frame> for FrameSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn next_request(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, BoxError>> + Send + '_>> {
        Box::pin(read_frame(
            &mut self.read,
            self.max_frame_bytes,
            &mut self.scratch,
        ))
    }
}

async fn read_frame<R>(
    read: &mut R,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>, BoxError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match read.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        // A peer that stops between frames is a clean EOF.
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let length = header.length as usize;
    if length > max_payload_bytes {
        return Err(format!("frame length {length} exceeds cap {max_payload_bytes}").into());
    }
    scratch.clear();
    scratch.resize(length, 0);
    read.read_exact(&mut scratch[..]).await?;
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

/// Writes frames to the connection's send side.
pub struct FrameSink<W> {
    write: W,
}

impl<W> FrameSink<W> {
    pub fn new(write: W) -> Self {
        Self { write }
    }
}

impl<W> ResponseSink<Frame> for FrameSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn write(
        &mut self,
        response: Frame,
    ) -> Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + '_>> {
        Box::pin(async move {
            let mut header_bytes = [0u8; FrameHeader::LEN];
            response.header.encode_into(&mut header_bytes);
            self.write.write_all(&header_bytes).await?;
            self.write.write_all(&response.payload).await?;
            self.write.flush().await?;
            Ok(())
        })
    }

    fn finish(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _ = self.write.shutdown().await;
        })
    }
}
