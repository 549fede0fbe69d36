//! Frame encoding/decoding
//!
//! Implements the ASCII frame format used by the wash controllers.
//!
//! Frame format:
//! - `:` start marker
//! - 2 hex digits: slave address
//! - 2 hex digits: function code
//! - N*2 hex digits: function-specific payload
//! - 2 hex digits: LRC (two's complement of the byte sum, mod 256)
//! - `\r\n` terminator

use std::fmt::Write as _;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use super::{FrameError, MAX_FRAME_LEN};

/// Start-of-frame marker
pub const START: u8 = b':';

/// Frame terminator
pub const TERMINATOR: &[u8; 2] = b"\r\n";

/// Function codes understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 0x01
    ReadCoils,
    /// 0x03
    ReadHoldingRegisters,
    /// 0x05
    WriteSingleCoil,
    /// 0x06
    WriteSingleRegister,
}

impl FunctionCode {
    /// Raw function byte
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::WriteSingleCoil => 0x05,
            FunctionCode::WriteSingleRegister => 0x06,
        }
    }

    /// Look up a function byte, ignoring the exception bit
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x7F {
            0x01 => Some(FunctionCode::ReadCoils),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Slave address
    pub address: u8,
    /// Function code byte
    pub function: u8,
    /// Function-specific payload bytes
    pub payload: Vec<u8>,
    /// LRC over address, function and payload
    pub checksum: u8,
}

impl Frame {
    /// Create a frame, computing its checksum
    pub fn new(address: u8, function: u8, payload: Vec<u8>) -> Self {
        let checksum = frame_lrc(address, function, &payload);
        Self {
            address,
            function,
            payload,
            checksum,
        }
    }

    /// Typed function code, if known
    pub fn function_code(&self) -> Option<FunctionCode> {
        FunctionCode::from_code(self.function)
    }

    /// True when the device answered with an exception response
    pub fn is_exception(&self) -> bool {
        self.function & 0x80 != 0
    }

    /// Encode to the ASCII wire representation, marker and terminator included
    pub fn to_wire(&self) -> Vec<u8> {
        let mut text = String::with_capacity(self.encoded_size());
        text.push(START as char);
        for byte in self.raw_bytes() {
            let _ = write!(text, "{:02X}", byte);
        }
        text.push_str("\r\n");
        text.into_bytes()
    }

    /// Total encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        1 + (3 + self.payload.len()) * 2 + TERMINATOR.len()
    }

    fn raw_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        [self.address, self.function]
            .into_iter()
            .chain(self.payload.iter().copied())
            .chain(std::iter::once(self.checksum))
    }
}

/// Build a frame for `address`/`function` carrying `payload`
pub fn encode(address: u8, function: u8, payload: &[u8]) -> Frame {
    Frame::new(address, function, payload.to_vec())
}

/// Decode the first complete frame in `buffer`.
///
/// Returns `None` while no terminator has arrived yet, and for a line that
/// fails validation. The leading `:` may be missing.
pub fn decode(buffer: &[u8]) -> Option<Frame> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    match parse_line(&buffer[..end]) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Dropping frame: {}", e);
            None
        }
    }
}

/// Decode every valid frame in `buffer`, in order
pub fn decode_all(buffer: &[u8]) -> Vec<Frame> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(buffer);
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        frames.push(frame);
    }
    frames
}

/// Longitudinal redundancy check over raw bytes
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

fn frame_lrc(address: u8, function: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(address.wrapping_add(function), |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Parse one line (without terminator) into a frame
pub fn parse_line(line: &[u8]) -> Result<Frame, FrameError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    // Anything before the last marker is noise from a previous partial frame
    let body = match line.iter().rposition(|&b| b == START) {
        Some(pos) => &line[pos + 1..],
        None => line,
    };

    if body.len() % 2 != 0 {
        return Err(FrameError::OddLength);
    }

    let mut bytes = Vec::with_capacity(body.len() / 2);
    for pair in body.chunks_exact(2) {
        bytes.push(nibble(pair[0])? << 4 | nibble(pair[1])?);
    }

    if bytes.len() < 3 {
        return Err(FrameError::TooShort(bytes.len()));
    }

    let (content, checksum) = bytes.split_at(bytes.len() - 1);
    let expected = lrc(content);
    if checksum[0] != expected {
        return Err(FrameError::LrcMismatch {
            expected,
            actual: checksum[0],
        });
    }

    Ok(Frame {
        address: content[0],
        function: content[1],
        payload: content[2..].to_vec(),
        checksum: checksum[0],
    })
}

fn nibble(c: u8) -> Result<u8, FrameError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(FrameError::InvalidHex(c)),
    }
}

/// Builder for constructing frames
pub struct FrameBuilder {
    address: u8,
    function: u8,
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame for the given slave and function
    pub fn new(address: u8, function: FunctionCode) -> Self {
        Self {
            address,
            function: function.code(),
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the frame
    pub fn build(self) -> Frame {
        Frame::new(self.address, self.function, self.payload)
    }
}

/// Streaming codec for `tokio_util::codec::Framed*`
///
/// Keeps partial lines between reads; invalid lines are dropped and decoding
/// continues with the next line already in the buffer.
#[derive(Debug, Default)]
pub struct FrameCodec {
    dropped: u64,
}

impl FrameCodec {
    /// Codec with an empty drop counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lines dropped because they failed validation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(end) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_FRAME_LEN {
                    debug!("Discarding {} unterminated bytes", src.len());
                    self.dropped += 1;
                    src.clear();
                }
                return Ok(None);
            };

            let line = src.split_to(end + 1);
            let line = &line[..end];
            if line.is_empty() || line == b"\r" {
                continue;
            }

            match parse_line(line) {
                Ok(frame) => {
                    trace!("RX: {:?}", frame);
                    return Ok(Some(frame));
                }
                Err(e) => {
                    self.dropped += 1;
                    debug!(
                        "Dropping frame ({}): {:?}",
                        e,
                        String::from_utf8_lossy(line)
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            debug!("Discarding {} trailing bytes at end of stream", src.len());
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        trace!("TX: {:?}", frame);
        dst.reserve(frame.encoded_size());
        dst.put_slice(&frame.to_wire());
        Ok(())
    }
}

/// Read a big-endian u16 at `offset`, if present
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    bytes.get(offset..offset + 2).map(BigEndian::read_u16)
}
