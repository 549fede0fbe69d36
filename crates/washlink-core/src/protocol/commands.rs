//! Protocol commands
//!
//! Typed requests the driver sends and the responses it understands.

use serde::{Deserialize, Serialize};

use super::frame::{read_u16, Frame, FrameBuilder, FunctionCode};
use super::{FrameError, COIL_OFF, COIL_ON};

/// Requests issued by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Read `quantity` coils starting at `start`
    ReadCoils {
        /// First coil
        start: u16,
        /// Number of coils
        quantity: u16,
    },

    /// Read `quantity` holding registers starting at `start`
    ReadHoldingRegisters {
        /// First register
        start: u16,
        /// Number of registers
        quantity: u16,
    },

    /// Set or clear a single coil
    WriteSingleCoil {
        /// Coil address
        address: u16,
        /// New state
        on: bool,
    },
}

impl Request {
    /// Function code used on the wire
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
        }
    }

    /// Build the frame for the given slave address
    pub fn to_frame(&self, slave: u8) -> Frame {
        let builder = FrameBuilder::new(slave, self.function());
        match *self {
            Request::ReadCoils { start, quantity }
            | Request::ReadHoldingRegisters { start, quantity } => {
                builder.u16_be(start).u16_be(quantity).build()
            }
            Request::WriteSingleCoil { address, on } => builder
                .u16_be(address)
                .u16_be(if on { COIL_ON } else { COIL_OFF })
                .build(),
        }
    }
}

/// Responses decoded from device frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil states, least significant bit of the first byte first
    Coils(Vec<bool>),

    /// Holding register values
    Registers(Vec<u16>),

    /// Echo of a single-coil write
    WriteAck {
        /// Coil written
        address: u16,
        /// `0xFF00` or `0x0000`
        value: u16,
    },

    /// Echo of a single-register write
    RegisterWriteAck {
        /// Register written
        address: u16,
        /// Value written
        value: u16,
    },

    /// Exception response
    Exception {
        /// Function code with the exception bit cleared
        function: u8,
        /// Modbus exception code
        code: u8,
    },
}

impl Response {
    /// Interpret a device frame
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.is_exception() {
            let code = *frame.payload.first().ok_or(FrameError::MalformedPayload {
                function: frame.function,
                reason: "missing exception code",
            })?;
            return Ok(Response::Exception {
                function: frame.function & 0x7F,
                code,
            });
        }

        let function = frame
            .function_code()
            .ok_or(FrameError::UnexpectedFunction(frame.function))?;
        let malformed = |reason: &'static str| FrameError::MalformedPayload {
            function: frame.function,
            reason,
        };

        match function {
            FunctionCode::ReadCoils => {
                let data = counted_data(&frame.payload).ok_or_else(|| malformed("byte count"))?;
                let coils = data
                    .iter()
                    .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
                    .collect();
                Ok(Response::Coils(coils))
            }
            FunctionCode::ReadHoldingRegisters => {
                let data = counted_data(&frame.payload).ok_or_else(|| malformed("byte count"))?;
                if data.len() % 2 != 0 {
                    return Err(malformed("odd register byte count"));
                }
                let registers = (0..data.len())
                    .step_by(2)
                    .filter_map(|i| read_u16(data, i))
                    .collect();
                Ok(Response::Registers(registers))
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                let (address, value) = match (read_u16(&frame.payload, 0), read_u16(&frame.payload, 2)) {
                    (Some(a), Some(v)) if frame.payload.len() == 4 => (a, v),
                    _ => return Err(malformed("expected address and value")),
                };
                if function == FunctionCode::WriteSingleCoil {
                    Ok(Response::WriteAck { address, value })
                } else {
                    Ok(Response::RegisterWriteAck { address, value })
                }
            }
        }
    }

    /// True for a write-coil echo, the generic acknowledgement of a command
    pub fn is_write_ack(&self) -> bool {
        matches!(self, Response::WriteAck { .. })
    }
}

/// Payload after a leading byte count, checked against that count
fn counted_data(payload: &[u8]) -> Option<&[u8]> {
    let (&count, rest) = payload.split_first()?;
    (rest.len() == count as usize).then_some(rest)
}
