//! Wire commands, responses and the typed per-phase requests
//!
//! The engine speaks in [`Request`]s. A [`Dialect`] turns each request into a
//! wire [`Command`] (opcode + payload) and interprets the [`Response`] the
//! transport framed for it.

mod dialect;
mod nrc;

pub use dialect::{max_transfer_payload, Dialect, DialectPreference, Reply, UdsProfile};
pub use nrc::NegativeResponseCode;

use bytes::{BufMut, Bytes, BytesMut};

/// Opcodes of the command-enum dialect
pub mod opcode {
    pub const INITIALIZE: u8 = 0x01;
    pub const AUTHENTICATE: u8 = 0x02;
    pub const READ_MEMORY_LAYOUT: u8 = 0x03;
    pub const READ_BLOCK: u8 = 0x04;
    pub const WRITE_BLOCK: u8 = 0x05;
    pub const ERASE_SECTOR: u8 = 0x06;
    pub const FINALIZE: u8 = 0x07;
}

/// UDS / KWP2000 service identifiers used for programming
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Offset added to a service ID in its positive response
    pub const POSITIVE_OFFSET: u8 = 0x40;
}

/// A framed request: one opcode byte followed by its payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Command {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn empty(opcode: u8) -> Self {
        Self::new(opcode, Bytes::new())
    }

    /// Opcode followed by payload, as sent on the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.opcode);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }
}

/// Status reported by the transport for a framed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    Error,
    Busy,
    InvalidCommand,
    AuthRequired,
    ChecksumError,
}

/// A framed response. Equality and hashing compare payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Response {
    pub status: ResponseStatus,
    pub data: Option<Bytes>,
}

impl Response {
    pub fn new(status: ResponseStatus, data: Option<Bytes>) -> Self {
        Self { status, data }
    }

    pub fn success(data: impl Into<Bytes>) -> Self {
        Self::new(ResponseStatus::Success, Some(data.into()))
    }

    pub fn status(status: ResponseStatus) -> Self {
        Self::new(status, None)
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Payload bytes, empty when the response carried none
    pub fn bytes(&self) -> Bytes {
        self.data.clone().unwrap_or_default()
    }
}

/// One typed request per protocol phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Enter the programming / extended diagnostic session
    EnterProgrammingSession,
    /// Challenge/response handshake
    Authenticate { challenge: Bytes },
    /// Seed/key handshake, step 1
    RequestSeed { level: u8 },
    /// Seed/key handshake, step 2
    SendKey { level: u8, key: Bytes },
    ReadMemoryLayout,
    Erase { address: u32, size: u32 },
    RequestDownload { address: u32, length: u32 },
    TransferData { sequence: u8, data: Bytes },
    TransferExit,
    /// Address + payload in a single frame
    WriteBlock { address: u32, data: Bytes },
    /// Direct memory write, used for calibration data
    WriteMemory { address: u32, data: Bytes },
    ReadBlock { address: u32, length: u32 },
    Finalize,
}

impl Request {
    /// Requests that may legitimately keep the ECU busy for a long time
    pub fn is_slow(&self) -> bool {
        matches!(self, Request::Erase { .. } | Request::Finalize)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Request::EnterProgrammingSession => "EnterProgrammingSession",
            Request::Authenticate { .. } => "Authenticate",
            Request::RequestSeed { .. } => "RequestSeed",
            Request::SendKey { .. } => "SendKey",
            Request::ReadMemoryLayout => "ReadMemoryLayout",
            Request::Erase { .. } => "Erase",
            Request::RequestDownload { .. } => "RequestDownload",
            Request::TransferData { .. } => "TransferData",
            Request::TransferExit => "TransferExit",
            Request::WriteBlock { .. } => "WriteBlock",
            Request::WriteMemory { .. } => "WriteMemory",
            Request::ReadBlock { .. } => "ReadBlock",
            Request::Finalize => "Finalize",
        }
    }
}

/// Which memory an operation programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramTarget {
    Firmware,
    Calibration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_response_equality_compares_bytes() {
        let a = Response::success(vec![0x01, 0x02]);
        let b = Response::success(Bytes::copy_from_slice(&[0x01, 0x02]));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(b, Response::success(vec![0x01]));
    }

    #[test]
    fn test_command_to_bytes() {
        let cmd = Command::new(service_id::TRANSFER_DATA, vec![0x01, 0xAA]);
        assert_eq!(cmd.to_bytes(), vec![0x36, 0x01, 0xAA]);
        assert_eq!(Command::empty(opcode::FINALIZE).to_bytes(), vec![0x07]);
    }

    #[test]
    fn test_response_bytes_defaults_to_empty() {
        assert!(Response::status(ResponseStatus::Busy).bytes().is_empty());
    }
}
