//! Frame codec for the control stream.
//!
//! A frame is a UTF-8 header, the first `|`, then raw payload bytes. The header
//! comes in three shapes:
//!
//! - `protocol:ip:port` - payload is the rest of the buffered bytes
//! - `ip:port` - legacy form, implies udp
//! - `protocol:ip:port:length` - payload is exactly `length` bytes, so frames
//!   may be split across reads or several may arrive in one read
//!
//! Only the sized form has real boundaries; the other two treat whatever was
//! buffered when the delimiter showed up as the whole payload.

use crate::relay::protocol::{
    DestinationKey, FRAME_DELIMITER, Frame, HEADER_SEPARATOR, MAX_HEADER_LEN, Protocol,
};

/// Largest payload the sized header form may announce.
pub const MAX_SIZED_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("header is not valid UTF-8")]
    InvalidUtf8,
    #[error("header has {0} fields, expected 2, 3 or 4")]
    FieldCount(usize),
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid payload length {0:?}")]
    InvalidLength(String),
    #[error("empty destination host")]
    EmptyHost,
    #[error("no delimiter within {0} header bytes")]
    HeaderTooLong(usize),
}

/// Outcome of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    NeedMoreData,
    Malformed { error: FrameError, consumed: usize },
}

struct Header {
    destination: DestinationKey,
    length: Option<usize>,
}

/// Decode one frame from the front of `buf`.
///
/// Malformed frames consume the whole buffer: the chunk is discarded and the
/// caller keeps reading.
pub fn decode(buf: &[u8]) -> Decoded {
    let Some(delim) = buf.iter().position(|&b| b == FRAME_DELIMITER) else {
        if buf.len() > MAX_HEADER_LEN {
            return Decoded::Malformed {
                error: FrameError::HeaderTooLong(MAX_HEADER_LEN),
                consumed: buf.len(),
            };
        }
        return Decoded::NeedMoreData;
    };

    if delim > MAX_HEADER_LEN {
        return Decoded::Malformed {
            error: FrameError::HeaderTooLong(MAX_HEADER_LEN),
            consumed: buf.len(),
        };
    }

    let header = match parse_header(&buf[..delim]) {
        Ok(header) => header,
        Err(error) => {
            return Decoded::Malformed {
                error,
                consumed: buf.len(),
            };
        }
    };

    let body = &buf[delim + 1..];
    match header.length {
        Some(len) => {
            if body.len() < len {
                return Decoded::NeedMoreData;
            }
            Decoded::Frame {
                frame: Frame {
                    destination: header.destination,
                    payload: body[..len].to_vec(),
                },
                consumed: delim + 1 + len,
            }
        }
        None => Decoded::Frame {
            frame: Frame {
                destination: header.destination,
                payload: body.to_vec(),
            },
            consumed: buf.len(),
        },
    }
}

fn parse_header(raw: &[u8]) -> Result<Header, FrameError> {
    let text = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;
    let fields: Vec<&str> = text.split(HEADER_SEPARATOR).collect();

    let (protocol, host, port, length) = match fields.as_slice() {
        [host, port] => (Protocol::Udp, *host, *port, None),
        [protocol, host, port] => (parse_protocol(protocol)?, *host, *port, None),
        [protocol, host, port, length] => {
            (parse_protocol(protocol)?, *host, *port, Some(*length))
        }
        _ => return Err(FrameError::FieldCount(fields.len())),
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(FrameError::EmptyHost);
    }

    let port = match port.trim().parse::<u16>() {
        Ok(p) if p != 0 => p,
        _ => return Err(FrameError::InvalidPort(port.to_string())),
    };

    let length = match length {
        Some(raw_len) => match raw_len.trim().parse::<usize>() {
            Ok(len) if len <= MAX_SIZED_PAYLOAD => Some(len),
            _ => return Err(FrameError::InvalidLength(raw_len.to_string())),
        },
        None => None,
    };

    Ok(Header {
        destination: DestinationKey::new(protocol, host, port),
        length,
    })
}

fn parse_protocol(token: &str) -> Result<Protocol, FrameError> {
    token
        .trim()
        .parse()
        .map_err(FrameError::UnknownProtocol)
}

/// Serialize a frame in the 3-field form. Used by workers, never by the relay.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut out = frame.destination.to_string().into_bytes();
    out.push(FRAME_DELIMITER);
    out.extend_from_slice(&frame.payload);
    out
}

/// Serialize a frame in the sized 4-field form.
pub fn encode_sized(frame: &Frame) -> Vec<u8> {
    let mut out = format!("{}:{}", frame.destination, frame.payload.len()).into_bytes();
    out.push(FRAME_DELIMITER);
    out.extend_from_slice(&frame.payload);
    out
}

/// Incremental decoder over a persistent per-connection buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` left over from earlier reads.
    leftover: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.leftover = self.buf.len();
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, a malformed-drop notice, or `None` when more data
    /// is needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.buf.is_empty() {
            return None;
        }
        match decode(&self.buf) {
            Decoded::NeedMoreData => None,
            Decoded::Frame { frame, consumed } => {
                self.consume(consumed);
                Some(Ok(frame))
            }
            // Stray bytes from earlier reads spoiled the header. Drop only
            // them and let the next call decode the latest read on its own.
            Decoded::Malformed { error, .. } if self.leftover > 0 => {
                self.consume(self.leftover);
                Some(Err(error))
            }
            Decoded::Malformed { error, consumed } => {
                self.consume(consumed);
                Some(Err(error))
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.leftover = self.leftover.saturating_sub(n);
    }
}
