//! Wire Protocol
//!
//! Implements the Modbus-ASCII style protocol spoken by the wash controllers:
//! `:`-prefixed hex frames with an LRC checksum and a CRLF terminator.

pub mod commands;
mod error;
pub mod frame;
pub mod serial;
pub mod transport;

pub use commands::{Request, Response};
pub use error::{FrameError, TransportError};
pub use frame::{decode, decode_all, encode, lrc, Frame, FrameBuilder, FrameCodec, FunctionCode};
pub use serial::{list_ports, PortInfo, SerialSettings, UsbAdapter};
pub use transport::{Transport, TransportEvent};

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Longest accepted line, in characters, before the terminator
pub const MAX_FRAME_LEN: usize = 513;

/// Write-single-coil value that sets the coil
pub const COIL_ON: u16 = 0xFF00;

/// Write-single-coil value that clears the coil
pub const COIL_OFF: u16 = 0x0000;
