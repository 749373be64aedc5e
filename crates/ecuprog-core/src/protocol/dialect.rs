//! Command dialects
//!
//! Two framings drive the same state machine. The command-enum dialect uses
//! one opcode per phase and reports acceptance through the response status.
//! The UDS dialect (also used for KWP2000 with a different session byte)
//! sends raw service identifiers and reads positive/negative responses from
//! the payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{
    opcode, service_id, Command, NegativeResponseCode, ProgramTarget, Request, Response,
    ResponseStatus,
};
use crate::config::UdsConfig;
use crate::ecu::{DiagnosticProtocol, EcuInfo};
use crate::error::{ProgramError, ProgramResult};

/// Address-and-length format identifier: 4-byte size, 4-byte address
const ALFI_4_4: u8 = 0x44;
/// Data format identifier: no compression, no encryption
const DFI_RAW: u8 = 0x00;
/// RoutineControl sub-function: start routine
const START_ROUTINE: u8 = 0x01;
/// Service ID and block sequence counter preceding TransferData payload
const TRANSFER_DATA_OVERHEAD: usize = 2;

const UDS_PROGRAMMING_SESSION: u8 = 0x02;
const KWP2000_PROGRAMMING_SESSION: u8 = 0x85;
const DEFAULT_ERASE_ROUTINE: u16 = 0xFF00;
const DEFAULT_CHECK_ROUTINE: u16 = 0xFF01;
const DEFAULT_LAYOUT_DID: u16 = 0xFD00;

/// Configured dialect choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectPreference {
    /// Derive from the protocols the ECU advertises
    #[default]
    Auto,
    Command,
    Uds,
    Kwp2000,
}

/// Parameters of the UDS-style framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdsProfile {
    pub protocol: DiagnosticProtocol,
    pub programming_session: u8,
    pub erase_routine: u16,
    pub check_routine: u16,
    pub layout_did: u16,
}

impl UdsProfile {
    pub fn uds(config: &UdsConfig) -> Self {
        Self::build(DiagnosticProtocol::Uds, UDS_PROGRAMMING_SESSION, config)
    }

    pub fn kwp2000(config: &UdsConfig) -> Self {
        Self::build(DiagnosticProtocol::Kwp2000, KWP2000_PROGRAMMING_SESSION, config)
    }

    fn build(protocol: DiagnosticProtocol, session: u8, config: &UdsConfig) -> Self {
        Self {
            protocol,
            programming_session: config.programming_session.unwrap_or(session),
            erase_routine: config.erase_routine.unwrap_or(DEFAULT_ERASE_ROUTINE),
            check_routine: config.check_routine.unwrap_or(DEFAULT_CHECK_ROUTINE),
            layout_did: config.layout_did.unwrap_or(DEFAULT_LAYOUT_DID),
        }
    }
}

/// Interpreted response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Accepted; payload with service echo stripped
    Positive(Bytes),
    /// ECU is still working, the final response follows
    Pending,
}

/// Command-encoding strategy, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Command,
    Uds(UdsProfile),
}

impl Dialect {
    /// Pick a dialect for `ecu`.
    ///
    /// The ECU must advertise UDS or KWP2000 whatever the preference, since
    /// those are the only protocol families this engine can program.
    pub fn select(
        ecu: &EcuInfo,
        preference: DialectPreference,
        config: &UdsConfig,
    ) -> ProgramResult<Self> {
        let uds = ecu.supports(DiagnosticProtocol::Uds);
        let kwp = ecu.supports(DiagnosticProtocol::Kwp2000);

        if !uds && !kwp {
            let advertised = if ecu.protocols.is_empty() {
                "none".to_string()
            } else {
                ecu.protocols
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return Err(ProgramError::Compatibility(format!(
                "ECU {} advertises no programmable protocol (advertised: {}; need UDS or KWP2000)",
                ecu.id, advertised
            )));
        }

        match preference {
            DialectPreference::Auto if uds => Ok(Dialect::Uds(UdsProfile::uds(config))),
            DialectPreference::Auto => Ok(Dialect::Uds(UdsProfile::kwp2000(config))),
            DialectPreference::Command => Ok(Dialect::Command),
            DialectPreference::Uds => Ok(Dialect::Uds(UdsProfile::uds(config))),
            DialectPreference::Kwp2000 => Ok(Dialect::Uds(UdsProfile::kwp2000(config))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Command => "command",
            Dialect::Uds(profile) if profile.protocol == DiagnosticProtocol::Kwp2000 => "kwp2000",
            Dialect::Uds(_) => "uds",
        }
    }

    /// Seed/key access instead of challenge/response
    pub fn uses_seed_key(&self) -> bool {
        matches!(self, Dialect::Uds(_))
    }

    /// Frame `request` for the wire
    pub fn encode(&self, request: &Request) -> ProgramResult<Command> {
        match self {
            Dialect::Command => encode_command(request),
            Dialect::Uds(profile) => encode_uds(profile, request),
        }
    }

    /// Requests that program one block of `target` memory
    pub fn write_plan(&self, target: ProgramTarget, address: u32, data: &Bytes) -> Vec<Request> {
        match (self, target) {
            (Dialect::Command, _) => vec![Request::WriteBlock {
                address,
                data: data.clone(),
            }],
            (Dialect::Uds(_), ProgramTarget::Firmware) => vec![
                Request::RequestDownload {
                    address,
                    length: data.len() as u32,
                },
                Request::TransferData {
                    sequence: 1,
                    data: data.clone(),
                },
                Request::TransferExit,
            ],
            (Dialect::Uds(_), ProgramTarget::Calibration) => vec![Request::WriteMemory {
                address,
                data: data.clone(),
            }],
        }
    }

    /// Classify the response to `request`
    pub fn interpret(&self, request: &Request, response: &Response) -> ProgramResult<Reply> {
        match self {
            Dialect::Command => interpret_command(request, response),
            Dialect::Uds(profile) => interpret_uds(profile, request, response),
        }
    }
}

/// Largest TransferData payload accepted, from a RequestDownload reply
/// (`[lengthFormatIdentifier, maxNumberOfBlockLength...]`).
pub fn max_transfer_payload(reply: &[u8]) -> Option<usize> {
    let (&lfi, rest) = reply.split_first()?;
    let width = (lfi >> 4) as usize;
    if width == 0 || width > 4 || rest.len() < width {
        return None;
    }
    let max = rest[..width]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    Some(max.saturating_sub(TRANSFER_DATA_OVERHEAD))
}

fn address_and_size(buf: &mut BytesMut, address: u32, size: u32) {
    buf.put_u32(address);
    buf.put_u32(size);
}

fn unsupported(dialect: &str, request: &Request) -> ProgramError {
    ProgramError::Compatibility(format!(
        "{} is not available in the {} dialect",
        request.name(),
        dialect
    ))
}

fn encode_command(request: &Request) -> ProgramResult<Command> {
    let command = match request {
        Request::EnterProgrammingSession => Command::empty(opcode::INITIALIZE),
        Request::Authenticate { challenge } => Command::new(opcode::AUTHENTICATE, challenge.clone()),
        Request::ReadMemoryLayout => Command::empty(opcode::READ_MEMORY_LAYOUT),
        Request::Erase { address, size } => {
            let mut buf = BytesMut::with_capacity(8);
            address_and_size(&mut buf, *address, *size);
            Command::new(opcode::ERASE_SECTOR, buf.freeze())
        }
        Request::WriteBlock { address, data } | Request::WriteMemory { address, data } => {
            let mut buf = BytesMut::with_capacity(4 + data.len());
            buf.put_u32(*address);
            buf.put_slice(data);
            Command::new(opcode::WRITE_BLOCK, buf.freeze())
        }
        Request::ReadBlock { address, length } => {
            let mut buf = BytesMut::with_capacity(8);
            address_and_size(&mut buf, *address, *length);
            Command::new(opcode::READ_BLOCK, buf.freeze())
        }
        Request::Finalize => Command::empty(opcode::FINALIZE),
        Request::RequestSeed { .. }
        | Request::SendKey { .. }
        | Request::RequestDownload { .. }
        | Request::TransferData { .. }
        | Request::TransferExit => return Err(unsupported("command", request)),
    };
    Ok(command)
}

fn interpret_command(request: &Request, response: &Response) -> ProgramResult<Reply> {
    let authenticate = matches!(request, Request::Authenticate { .. });
    match response.status {
        // The challenge answer only counts with an auth-required status
        ResponseStatus::AuthRequired if authenticate => Ok(Reply::Positive(response.bytes())),
        ResponseStatus::Busy => Ok(Reply::Pending),
        status if authenticate => Err(ProgramError::Security(format!(
            "challenge answered with status {:?} instead of auth-required",
            status
        ))),
        ResponseStatus::Success => Ok(Reply::Positive(response.bytes())),
        status => Err(ProgramError::Protocol(format!(
            "{} failed with status {:?}",
            request.name(),
            status
        ))),
    }
}

fn uds_service(request: &Request) -> Option<u8> {
    match request {
        Request::EnterProgrammingSession => Some(service_id::DIAGNOSTIC_SESSION_CONTROL),
        Request::RequestSeed { .. } | Request::SendKey { .. } => Some(service_id::SECURITY_ACCESS),
        Request::ReadMemoryLayout => Some(service_id::READ_DATA_BY_ID),
        Request::Erase { .. } | Request::Finalize => Some(service_id::ROUTINE_CONTROL),
        Request::RequestDownload { .. } => Some(service_id::REQUEST_DOWNLOAD),
        Request::TransferData { .. } => Some(service_id::TRANSFER_DATA),
        Request::TransferExit => Some(service_id::REQUEST_TRANSFER_EXIT),
        Request::WriteMemory { .. } => Some(service_id::WRITE_MEMORY_BY_ADDRESS),
        Request::ReadBlock { .. } => Some(service_id::READ_MEMORY_BY_ADDRESS),
        Request::Authenticate { .. } | Request::WriteBlock { .. } => None,
    }
}

fn encode_uds(profile: &UdsProfile, request: &Request) -> ProgramResult<Command> {
    let sid = uds_service(request).ok_or_else(|| unsupported("uds", request))?;
    let mut buf = BytesMut::new();

    match request {
        Request::EnterProgrammingSession => buf.put_u8(profile.programming_session),
        Request::RequestSeed { level } => buf.put_u8(level.wrapping_mul(2).wrapping_sub(1)),
        Request::SendKey { level, key } => {
            buf.put_u8(level.wrapping_mul(2));
            buf.put_slice(key);
        }
        Request::ReadMemoryLayout => buf.put_u16(profile.layout_did),
        Request::Erase { address, size } => {
            buf.put_u8(START_ROUTINE);
            buf.put_u16(profile.erase_routine);
            buf.put_u8(ALFI_4_4);
            address_and_size(&mut buf, *address, *size);
        }
        Request::Finalize => {
            buf.put_u8(START_ROUTINE);
            buf.put_u16(profile.check_routine);
        }
        Request::RequestDownload { address, length } => {
            buf.put_u8(DFI_RAW);
            buf.put_u8(ALFI_4_4);
            address_and_size(&mut buf, *address, *length);
        }
        Request::TransferData { sequence, data } => {
            buf.put_u8(*sequence);
            buf.put_slice(data);
        }
        Request::TransferExit => {}
        Request::WriteMemory { address, data } => {
            buf.put_u8(ALFI_4_4);
            address_and_size(&mut buf, *address, data.len() as u32);
            buf.put_slice(data);
        }
        Request::ReadBlock { address, length } => {
            buf.put_u8(ALFI_4_4);
            address_and_size(&mut buf, *address, *length);
        }
        Request::Authenticate { .. } | Request::WriteBlock { .. } => {
            return Err(unsupported("uds", request))
        }
    }

    Ok(Command::new(sid, buf.freeze()))
}

fn interpret_uds(profile: &UdsProfile, request: &Request, response: &Response) -> ProgramResult<Reply> {
    let sid = uds_service(request).ok_or_else(|| unsupported("uds", request))?;

    if !response.is_success() {
        return Err(ProgramError::Protocol(format!(
            "{} failed with transport status {:?}",
            request.name(),
            response.status
        )));
    }

    let data = response.bytes();
    let Some(&first) = data.first() else {
        return Err(ProgramError::Protocol(format!(
            "Empty response to {}",
            request.name()
        )));
    };

    if first == service_id::NEGATIVE_RESPONSE {
        if data.len() < 3 {
            return Err(ProgramError::Protocol(format!(
                "Malformed negative response to {}: {}",
                request.name(),
                hex::encode(&data)
            )));
        }
        let nrc = NegativeResponseCode::from(data[2]);
        if nrc == NegativeResponseCode::ResponsePending {
            return Ok(Reply::Pending);
        }
        return Err(ProgramError::Protocol(format!(
            "{} rejected: {}",
            request.name(),
            nrc
        )));
    }

    let expected = sid.wrapping_add(service_id::POSITIVE_OFFSET);
    if first != expected {
        return Err(ProgramError::Protocol(format!(
            "Unexpected response to {}: expected 0x{:02X}, got 0x{:02X}",
            request.name(),
            expected,
            first
        )));
    }

    let payload = data.slice(1..);
    let echo: Option<Vec<u8>> = match request {
        Request::ReadMemoryLayout => Some(profile.layout_did.to_be_bytes().to_vec()),
        Request::Erase { .. } => {
            let rid = profile.erase_routine.to_be_bytes();
            Some(vec![START_ROUTINE, rid[0], rid[1]])
        }
        Request::Finalize => {
            let rid = profile.check_routine.to_be_bytes();
            Some(vec![START_ROUTINE, rid[0], rid[1]])
        }
        _ => None,
    };

    match echo {
        Some(echo) if !payload.starts_with(&echo) => Err(ProgramError::Protocol(format!(
            "{} response does not echo {}",
            request.name(),
            hex::encode(&echo)
        ))),
        Some(echo) => Ok(Reply::Positive(payload.slice(echo.len()..))),
        None => Ok(Reply::Positive(payload)),
    }
}
