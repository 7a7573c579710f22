//! Transport layer for host ↔ agent communication.
//!
//! Frames are newline-delimited JSON: one [`Message`] per `\n`-terminated
//! UTF-8 line. [`WireCodec`] plugs into `FramedRead`/`FramedWrite` so partial
//! reads are buffered until a full line is available.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{Message, Notification, Request, RequestId, Response, RpcError};
pub use stdio_pipe::{run_agent, serve_stdio, spawn_agent_process, AgentProcess};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::{AcpError, Result};

/// Maximum inbound line length (1 MiB). Safety valve against a peer that
/// never sends a newline.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec producing parsed [`Message`]s.
///
/// Blank lines are skipped. A line that is too long, is not UTF-8, is not
/// JSON, or does not have the shape of a request, response or notification
/// yields [`AcpError::Protocol`].
#[derive(Debug)]
pub struct WireCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl WireCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    fn map_codec_error(&self, err: LinesCodecError, src: &BytesMut) -> AcpError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AcpError::protocol(
                format!("line exceeds {} bytes", self.max_line_bytes),
                src,
            ),
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                AcpError::protocol(format!("line is not valid UTF-8: {e}"), &[])
            }
            LinesCodecError::Io(e) => AcpError::Io(e),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = AcpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let line = match self.lines.decode(src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_codec_error(e, src)),
            };
            if !line.trim().is_empty() {
                return decode_line(&line).map(Some);
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let line = match self.lines.decode_eof(src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_codec_error(e, src)),
            };
            if !line.trim().is_empty() {
                return decode_line(&line).map(Some);
            }
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = AcpError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let json = item.to_json()?;
        // The line limit applies to decoding only.
        self.lines
            .encode(json, dst)
            .map_err(|e| self.map_codec_error(e, dst))
    }
}

/// Parse one complete line (without its terminator) into a [`Message`].
pub fn decode_line(line: &str) -> Result<Message> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| AcpError::protocol(format!("malformed json: {e}"), line.as_bytes()))?;
    Message::from_value(value).map_err(|reason| AcpError::protocol(reason, line.as_bytes()))
}

/// Encode a message as a newline-terminated frame.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = message.to_json()?.into_bytes();
    bytes.push(b'\n');
    Ok(bytes)
}
