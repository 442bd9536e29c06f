// Length-prefixed wire format shared by lyra services and their clients.
use bytes::{Buf, Bytes, BytesMut};

pub const MAGIC: u32 = 0x4C59_5231;
pub const VERSION: u16 = 1;

// Frame kinds understood by the request-response protocol.
pub const KIND_REQUEST: u16 = 0x1;
pub const KIND_RESPONSE: u16 = 0x2;
pub const KIND_ERROR: u16 = 0x3;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("truncated frame")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Build a header carrying the current protocol constants.
    pub fn new(kind: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut bytes = [0u8; Self::LEN];
        self.encode_into(&mut bytes);
        buf.extend_from_slice(&bytes);
    }

    // Network byte order throughout so frames are portable across hosts.
    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.kind.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate the fixed fields before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Truncated);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            kind,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use lyra_wire::{Frame, KIND_REQUEST};
///
/// let frame = Frame::new(KIND_REQUEST, Bytes::from_static(b"ping")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"ping"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(kind, payload.len() as u32),
            payload,
        })
    }

    pub fn request(payload: Bytes) -> Result<Self> {
        Self::new(KIND_REQUEST, payload)
    }

    pub fn response(payload: Bytes) -> Result<Self> {
        Self::new(KIND_RESPONSE, payload)
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Truncated);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Truncated);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}
