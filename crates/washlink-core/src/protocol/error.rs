//! Protocol errors

use thiserror::Error;

/// Reasons a received line could not be turned into a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than address, function and LRC
    #[error("Frame too short: {0} bytes after hex decoding")]
    TooShort(usize),

    /// Hex body cannot split into bytes
    #[error("Odd number of hex digits in frame body")]
    OddLength,

    /// Non-hex character in the body
    #[error("Invalid hex digit {0:#04x}")]
    InvalidHex(u8),

    /// Checksum did not verify
    #[error("LRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    LrcMismatch {
        /// Checksum computed over the body
        expected: u8,
        /// Checksum carried by the line
        actual: u8,
    },

    /// Function byte the driver does not understand
    #[error("Unexpected function code {0:#04x}")]
    UnexpectedFunction(u8),

    /// Payload length or content does not fit the function
    #[error("Malformed payload for function {function:#04x}: {reason}")]
    MalformedPayload {
        /// Function byte of the frame
        function: u8,
        /// What was wrong
        reason: &'static str,
    },
}

/// Errors raised by the serial transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The serial driver reported a failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Auto-detection found no port
    #[error("No serial port available")]
    NoPortAvailable,

    /// The transport was closed
    #[error("Transport closed")]
    Closed,

    /// Reading or writing the stream failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for TransportError {
    fn from(e: tokio_serial::Error) -> Self {
        TransportError::SerialError(e.to_string())
    }
}
