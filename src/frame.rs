//! Modbus RTU framing.
//!
//! A frame on the wire is `[address][function code][data...][crc lo][crc hi]`.
//! RTU has no length prefix: a frame ends when the line stays silent for
//! 3.5 character times. [`FrameDecoder`] accumulates received bytes and
//! only hands out a frame once that silence has been observed.

use crc::{Crc, CRC_16_MODBUS};
use std::{fmt, time::Duration};
use tokio::time::Instant;

/// Largest RTU frame the protocol allows.
pub const MAX_FRAME_LEN: usize = 256;
/// Address + function code + CRC.
pub const MIN_FRAME_LEN: usize = 4;

const EXCEPTION_FLAG: u8 = 0x80;
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC16-Modbus: polynomial 0xA001 (reflected), initial value 0xFFFF.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// The function codes the thermostats understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Longest reply a device may send for this function.
    fn max_reply_len(self) -> usize {
        match self {
            // address, function, byte count, 125 registers, crc
            FunctionCode::ReadHoldingRegisters => 3 + 250 + 2,
            FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => 8,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.value())
    }
}

/// Exception code of a Modbus exception reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    Other(u8),
}

impl Exception {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Exception::IllegalFunction,
            0x02 => Exception::IllegalDataAddress,
            0x03 => Exception::IllegalDataValue,
            0x04 => Exception::ServerDeviceFailure,
            0x05 => Exception::Acknowledge,
            0x06 => Exception::ServerDeviceBusy,
            other => Exception::Other(other),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::IllegalFunction => write!(f, "illegal function"),
            Exception::IllegalDataAddress => write!(f, "illegal data address"),
            Exception::IllegalDataValue => write!(f, "illegal data value"),
            Exception::ServerDeviceFailure => write!(f, "server device failure"),
            Exception::Acknowledge => write!(f, "acknowledge"),
            Exception::ServerDeviceBusy => write!(f, "server device busy"),
            Exception::Other(code) => write!(f, "exception code {code:#04X}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("CRC mismatch: expected {expected:#06X}, got {actual:#06X}")]
    Checksum { expected: u16, actual: u16 },

    #[error("Frame has {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown function code {0:#04X}")]
    UnknownFunction(u8),

    #[error("Frame exceeds {limit} bytes")]
    Oversized { limit: usize },
}

/// One RTU frame without its CRC, which is derived from the other fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    /// Raw function code; the high bit is set on exception replies.
    pub function: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(address: u8, function: FunctionCode, data: Vec<u8>) -> Self {
        Self {
            address,
            function: function.value(),
            data,
        }
    }

    /// The function this frame belongs to, with the exception flag stripped.
    pub fn function_code(&self) -> Option<FunctionCode> {
        FunctionCode::from_u8(self.function & !EXCEPTION_FLAG)
    }

    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// The exception carried by an exception reply.
    pub fn exception(&self) -> Option<Exception> {
        if self.is_exception() {
            self.data.first().copied().map(Exception::from_u8)
        } else {
            None
        }
    }

    pub fn crc(&self) -> u16 {
        let mut digest = CRC_MODBUS.digest();
        digest.update(&[self.address, self.function]);
        digest.update(&self.data);
        digest.finalize()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.address, self.function, &self.data)
    }
}

/// Builds the wire representation of a frame, CRC appended little-endian.
pub fn encode(address: u8, function: u8, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() + MIN_FRAME_LEN);
    bytes.push(address);
    bytes.push(function);
    bytes.extend_from_slice(data);
    let crc = crc16(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}

/// Length a reply must have, judged from its first bytes.
fn expected_reply_len(bytes: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(&function) = bytes.get(1) else {
        return Ok(None);
    };
    if function & EXCEPTION_FLAG != 0 {
        return match FunctionCode::from_u8(function & !EXCEPTION_FLAG) {
            Some(_) => Ok(Some(5)),
            None => Err(FrameError::UnknownFunction(function)),
        };
    }
    match FunctionCode::from_u8(function) {
        Some(FunctionCode::ReadHoldingRegisters) => {
            Ok(bytes.get(2).map(|&byte_count| 5 + byte_count as usize))
        }
        Some(_) => Ok(Some(8)),
        None => Err(FrameError::UnknownFunction(function)),
    }
}

/// Hard cap on how many bytes may accumulate for a reply to `bytes[1]`.
fn reply_len_limit(bytes: &[u8]) -> usize {
    match bytes.get(1) {
        Some(&function) if function & EXCEPTION_FLAG != 0 => 5,
        Some(&function) => FunctionCode::from_u8(function)
            .map(FunctionCode::max_reply_len)
            .unwrap_or(MAX_FRAME_LEN),
        None => MAX_FRAME_LEN,
    }
}

/// Validates a complete reply frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            limit: MAX_FRAME_LEN,
        });
    }
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated {
            expected: MIN_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    let (body, crc) = bytes.split_at(bytes.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([crc[0], crc[1]]);
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }
    if let Some(expected) = expected_reply_len(bytes)? {
        if expected != bytes.len() {
            return Err(FrameError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
    }
    Ok(Frame {
        address: body[0],
        function: body[1],
        data: body[2..].to_vec(),
    })
}

/// Streaming accumulator that splits the received byte stream into frames
/// by inter-frame silence.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    last_byte_at: Option<Instant>,
    silent_interval: Duration,
}

impl FrameDecoder {
    pub fn new(silent_interval: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            last_byte_at: None,
            silent_interval,
        }
    }

    pub fn feed(&mut self, bytes: &[u8], now: Instant) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        self.last_byte_at = Some(now);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_byte_at = None;
    }

    /// When the current frame will be complete if nothing else arrives.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.last_byte_at.map(|at| at + self.silent_interval)
    }

    /// Takes the buffered frame once the line has been silent long enough.
    ///
    /// Returns `None` while there is nothing to extract yet. A buffer that
    /// outgrows the limit for its function code is discarded right away,
    /// silence or not.
    pub fn try_extract_frame(&mut self, now: Instant) -> Option<Result<Frame, FrameError>> {
        let limit = reply_len_limit(&self.buffer);
        if self.buffer.len() > limit {
            self.clear();
            return Some(Err(FrameError::Oversized { limit }));
        }
        let deadline = self.silence_deadline()?;
        if now < deadline {
            return None;
        }
        let result = decode(&self.buffer);
        self.clear();
        Some(result)
    }
}
