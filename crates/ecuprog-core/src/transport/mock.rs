//! Simulated ECU for testing
//!
//! `MockEcu` answers both the command-enum dialect (opcodes 0x01..=0x07) and
//! the UDS dialect (service IDs 0x10 and up). It keeps a sparse memory image
//! so readback reflects what was written, and records every command it
//! receives for assertions. Clones share the same simulated device.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;

use super::{TransportError, TransportPort};
use crate::checksum::ChecksumAlgorithm;
use crate::layout::{MemoryLayout, MemoryRegion, RegionKind};
use crate::protocol::{opcode, service_id, Command, Response, ResponseStatus};

const DEFAULT_SEED: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
const DEFAULT_SECRET: [u8; 2] = [0xA5, 0x5A];
const DEFAULT_LAYOUT_DID: u16 = 0xFD00;
const ERASED: u8 = 0xFF;

const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_INCORRECT_LENGTH: u8 = 0x13;
const NRC_SEQUENCE_ERROR: u8 = 0x24;
const NRC_OUT_OF_RANGE: u8 = 0x31;
const NRC_ACCESS_DENIED: u8 = 0x33;
const NRC_INVALID_KEY: u8 = 0x35;
const NRC_PROGRAMMING_FAILURE: u8 = 0x72;
const NRC_RESPONSE_PENDING: u8 = 0x78;

/// How an injected block-write failure shows up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Non-success status (command dialect) or NRC 0x72 (UDS)
    Negative,
    /// Request is accepted but no response ever arrives
    Silent,
    /// The link drops while sending
    Disconnect,
}

#[derive(Debug)]
struct Download {
    address: u32,
    remaining: u32,
}

#[derive(Debug)]
struct State {
    layout_record: Vec<u8>,
    layout_did: u16,
    seed: Vec<u8>,
    secret: Vec<u8>,
    memory: BTreeMap<u32, u8>,
    queue: VecDeque<Response>,
    sent: Vec<Command>,
    resets: usize,
    unlocked: bool,
    download: Option<Download>,
    failures: HashMap<u32, (FailureMode, u32)>,
    write_attempts: HashMap<u32, u32>,
    scripted: HashMap<u8, VecDeque<Response>>,
    corrupt_readback: bool,
    reject_auth: bool,
    pending_frames: u32,
    latency: Duration,
}

impl Default for State {
    fn default() -> Self {
        Self {
            layout_record: MockEcu::default_layout().encode(),
            layout_did: DEFAULT_LAYOUT_DID,
            seed: DEFAULT_SEED.to_vec(),
            secret: DEFAULT_SECRET.to_vec(),
            memory: BTreeMap::new(),
            queue: VecDeque::new(),
            sent: Vec::new(),
            resets: 0,
            unlocked: false,
            download: None,
            failures: HashMap::new(),
            write_attempts: HashMap::new(),
            scripted: HashMap::new(),
            corrupt_readback: false,
            reject_auth: false,
            pending_frames: 0,
            latency: Duration::ZERO,
        }
    }
}

/// Scripted ECU implementing [`TransportPort`]
#[derive(Debug, Clone, Default)]
pub struct MockEcu {
    state: Arc<Mutex<State>>,
}

impl MockEcu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootloader 0x0000 (16 KiB, read-only), flash 0x4000 (64 KiB),
    /// EEPROM 0x80_0000 (2 KiB), CRC-32 acceptance checksum
    pub fn default_layout() -> MemoryLayout {
        MemoryLayout::new(
            vec![
                MemoryRegion::new(0x0000_0000, 0x4000, RegionKind::Bootloader, false),
                MemoryRegion::new(0x0000_4000, 0x1_0000, RegionKind::Flash, true),
                MemoryRegion::new(0x0080_0000, 0x800, RegionKind::Eeprom, true),
            ],
            ChecksumAlgorithm::Crc32,
        )
        .expect("default layout is valid")
    }

    pub fn with_layout(self, layout: &MemoryLayout) -> Self {
        self.with_layout_record(layout.encode())
    }

    /// Raw layout record, for malformed or empty layouts
    pub fn with_layout_record(self, record: impl Into<Vec<u8>>) -> Self {
        self.state.lock().layout_record = record.into();
        self
    }

    pub fn with_layout_did(self, did: u16) -> Self {
        self.state.lock().layout_did = did;
        self
    }

    pub fn with_seed(self, seed: impl Into<Vec<u8>>) -> Self {
        self.state.lock().seed = seed.into();
        self
    }

    /// Secret used for both the seed/key and challenge/response checks
    pub fn with_secret(self, secret: impl Into<Vec<u8>>) -> Self {
        self.state.lock().secret = secret.into();
        self
    }

    /// Delay applied before every response
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Number of response-pending frames sent before erase/finalize completes
    pub fn with_pending_frames(self, frames: u32) -> Self {
        self.state.lock().pending_frames = frames;
        self
    }

    /// Make the next `times` writes to the block at `address` fail
    pub fn fail_writes(&self, address: u32, mode: FailureMode, times: u32) {
        self.state.lock().failures.insert(address, (mode, times));
    }

    /// Answer the next command with `opcode` with `response` instead of
    /// simulating it
    pub fn script(&self, opcode: u8, response: Response) {
        self.state
            .lock()
            .scripted
            .entry(opcode)
            .or_default()
            .push_back(response);
    }

    /// Flip the first byte of every readback
    pub fn corrupt_readback(&self) {
        self.state.lock().corrupt_readback = true;
    }

    /// Answer every authentication attempt with a wrong result
    pub fn reject_authentication(&self) {
        self.state.lock().reject_auth = true;
    }

    pub fn sent(&self) -> Vec<Command> {
        self.state.lock().sent.clone()
    }

    pub fn sent_opcodes(&self) -> Vec<u8> {
        self.state.lock().sent.iter().map(|c| c.opcode).collect()
    }

    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    /// Write requests seen for the block starting at `address`
    pub fn write_attempts(&self, address: u32) -> u32 {
        self.state
            .lock()
            .write_attempts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Current memory content; unwritten bytes read as erased (0xFF)
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        self.state.lock().read(address, len)
    }
}

impl State {
    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let addr = address.wrapping_add(i as u32);
                self.memory.get(&addr).copied().unwrap_or(ERASED)
            })
            .collect()
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u32), *byte);
        }
    }

    fn erase(&mut self, address: u32, size: u32) {
        let end = u64::from(address) + u64::from(size);
        self.memory
            .retain(|addr, _| u64::from(*addr) < u64::from(address) || u64::from(*addr) >= end);
    }

    fn readback(&self, address: u32, len: usize) -> Vec<u8> {
        let mut data = self.read(address, len);
        if self.corrupt_readback {
            if let Some(first) = data.first_mut() {
                *first ^= 0xFF;
            }
        }
        data
    }

    fn respond(&mut self, response: Response) {
        self.queue.push_back(response);
    }

    fn respond_uds(&mut self, payload: Vec<u8>) {
        self.respond(Response::success(payload));
    }

    fn negative(&mut self, sid: u8, nrc: u8) {
        self.respond_uds(vec![service_id::NEGATIVE_RESPONSE, sid, nrc]);
    }

    fn challenge_answer(&self, challenge: &[u8]) -> Vec<u8> {
        challenge
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.secret[i % self.secret.len()])
            .collect()
    }

    fn expected_key(&self) -> Vec<u8> {
        self.challenge_answer(&self.seed)
    }

    /// Record a block write attempt; returns the injected failure, if any
    fn write_attempt(&mut self, address: u32) -> Option<FailureMode> {
        *self.write_attempts.entry(address).or_insert(0) += 1;
        match self.failures.get_mut(&address) {
            Some((mode, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*mode)
            }
            _ => None,
        }
    }

    /// Handle one command; `Err` means the send itself failed
    fn handle(&mut self, command: &Command) -> Result<(), TransportError> {
        self.sent.push(command.clone());

        if let Some(response) = self
            .scripted
            .get_mut(&command.opcode)
            .and_then(VecDeque::pop_front)
        {
            self.respond(response);
            return Ok(());
        }

        if (opcode::INITIALIZE..=opcode::FINALIZE).contains(&command.opcode) {
            self.handle_command(command)
        } else {
            self.handle_uds(command)
        }
    }

    fn handle_command(&mut self, command: &Command) -> Result<(), TransportError> {
        let mut payload = command.payload.clone();

        match command.opcode {
            opcode::INITIALIZE => self.respond(Response::status(ResponseStatus::Success)),
            opcode::AUTHENTICATE => {
                let mut answer = self.challenge_answer(&payload);
                if self.reject_auth {
                    answer.iter_mut().for_each(|b| *b = !*b);
                } else {
                    self.unlocked = true;
                }
                self.respond(Response::new(
                    ResponseStatus::AuthRequired,
                    Some(Bytes::from(answer)),
                ));
            }
            opcode::READ_MEMORY_LAYOUT => {
                let record = self.layout_record.clone();
                self.respond(Response::success(record));
            }
            opcode::READ_BLOCK => {
                if payload.len() < 8 {
                    self.respond(Response::status(ResponseStatus::InvalidCommand));
                    return Ok(());
                }
                let address = payload.get_u32();
                let length = payload.get_u32();
                let data = self.readback(address, length as usize);
                self.respond(Response::success(data));
            }
            opcode::WRITE_BLOCK => {
                if payload.len() < 4 {
                    self.respond(Response::status(ResponseStatus::InvalidCommand));
                    return Ok(());
                }
                let address = payload.get_u32();
                match self.write_attempt(address) {
                    Some(FailureMode::Negative) => {
                        self.respond(Response::status(ResponseStatus::Error))
                    }
                    Some(FailureMode::Silent) => {}
                    Some(FailureMode::Disconnect) => return Err(TransportError::ConnectionClosed),
                    None if !self.unlocked => {
                        self.respond(Response::status(ResponseStatus::AuthRequired))
                    }
                    None => {
                        self.write(address, &payload);
                        self.respond(Response::status(ResponseStatus::Success));
                    }
                }
            }
            opcode::ERASE_SECTOR => {
                if payload.len() < 8 {
                    self.respond(Response::status(ResponseStatus::InvalidCommand));
                    return Ok(());
                }
                let address = payload.get_u32();
                let size = payload.get_u32();
                for _ in 0..self.pending_frames {
                    self.respond(Response::status(ResponseStatus::Busy));
                }
                self.erase(address, size);
                self.respond(Response::status(ResponseStatus::Success));
            }
            opcode::FINALIZE => {
                for _ in 0..self.pending_frames {
                    self.respond(Response::status(ResponseStatus::Busy));
                }
                self.respond(Response::status(ResponseStatus::Success));
            }
            _ => self.respond(Response::status(ResponseStatus::InvalidCommand)),
        }
        Ok(())
    }

    fn handle_uds(&mut self, command: &Command) -> Result<(), TransportError> {
        let sid = command.opcode;
        let positive = sid.wrapping_add(service_id::POSITIVE_OFFSET);
        let mut payload = command.payload.clone();

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => {
                let Some(&session) = payload.first() else {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                };
                self.respond_uds(vec![positive, session, 0x00, 0x19, 0x01, 0xF4]);
            }
            service_id::SECURITY_ACCESS => {
                let Some(&sub) = payload.first() else {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                };
                if sub % 2 == 1 {
                    let mut reply = vec![positive, sub];
                    if self.unlocked {
                        reply.extend(std::iter::repeat(0).take(self.seed.len()));
                    } else {
                        reply.extend_from_slice(&self.seed);
                    }
                    self.respond_uds(reply);
                } else if !self.reject_auth && payload[1..] == self.expected_key()[..] {
                    self.unlocked = true;
                    self.respond_uds(vec![positive, sub]);
                } else {
                    self.negative(sid, NRC_INVALID_KEY);
                }
            }
            service_id::READ_DATA_BY_ID => {
                if payload.len() < 2 {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                }
                let did = payload.get_u16();
                if did != self.layout_did {
                    self.negative(sid, NRC_OUT_OF_RANGE);
                    return Ok(());
                }
                let mut reply = vec![positive];
                reply.extend_from_slice(&did.to_be_bytes());
                reply.extend_from_slice(&self.layout_record);
                self.respond_uds(reply);
            }
            service_id::ROUTINE_CONTROL => {
                if payload.len() < 3 {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                }
                let echo = payload.slice(..3);
                payload.advance(3);
                // Erase carries an address/size record, the check routine does not
                if payload.len() >= 9 {
                    payload.advance(1);
                    let address = payload.get_u32();
                    let size = payload.get_u32();
                    self.erase(address, size);
                }
                for _ in 0..self.pending_frames {
                    self.negative(sid, NRC_RESPONSE_PENDING);
                }
                let mut reply = vec![positive];
                reply.extend_from_slice(&echo);
                reply.push(0x00);
                self.respond_uds(reply);
            }
            service_id::REQUEST_DOWNLOAD => {
                if payload.len() < 10 {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                }
                payload.advance(2);
                let address = payload.get_u32();
                let length = payload.get_u32();
                match self.write_attempt(address) {
                    Some(FailureMode::Negative) => self.negative(sid, NRC_PROGRAMMING_FAILURE),
                    Some(FailureMode::Silent) => {}
                    Some(FailureMode::Disconnect) => return Err(TransportError::ConnectionClosed),
                    None if !self.unlocked => self.negative(sid, NRC_ACCESS_DENIED),
                    None => {
                        self.download = Some(Download {
                            address,
                            remaining: length,
                        });
                        // maxNumberOfBlockLength 0x0402 (1024 data bytes + SID + counter)
                        self.respond_uds(vec![positive, 0x20, 0x04, 0x02]);
                    }
                }
            }
            service_id::TRANSFER_DATA => {
                let Some(&sequence) = payload.first() else {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                };
                let data = payload.slice(1..);
                match self.download.as_mut() {
                    Some(download) if data.len() as u32 <= download.remaining => {
                        let address = download.address;
                        download.address = download.address.wrapping_add(data.len() as u32);
                        download.remaining -= data.len() as u32;
                        self.write(address, &data);
                        self.respond_uds(vec![positive, sequence]);
                    }
                    Some(_) => self.negative(sid, NRC_OUT_OF_RANGE),
                    None => self.negative(sid, NRC_SEQUENCE_ERROR),
                }
            }
            service_id::REQUEST_TRANSFER_EXIT => {
                if self.download.take().is_some() {
                    self.respond_uds(vec![positive]);
                } else {
                    self.negative(sid, NRC_SEQUENCE_ERROR);
                }
            }
            service_id::WRITE_MEMORY_BY_ADDRESS => {
                if payload.len() < 9 {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                }
                let header = payload.slice(..9);
                payload.advance(1);
                let address = payload.get_u32();
                let size = payload.get_u32();
                match self.write_attempt(address) {
                    Some(FailureMode::Negative) => self.negative(sid, NRC_PROGRAMMING_FAILURE),
                    Some(FailureMode::Silent) => {}
                    Some(FailureMode::Disconnect) => return Err(TransportError::ConnectionClosed),
                    None if !self.unlocked => self.negative(sid, NRC_ACCESS_DENIED),
                    None if payload.len() != size as usize => {
                        self.negative(sid, NRC_INCORRECT_LENGTH)
                    }
                    None => {
                        self.write(address, &payload);
                        let mut reply = vec![positive];
                        reply.extend_from_slice(&header);
                        self.respond_uds(reply);
                    }
                }
            }
            service_id::READ_MEMORY_BY_ADDRESS => {
                if payload.len() < 9 {
                    self.negative(sid, NRC_INCORRECT_LENGTH);
                    return Ok(());
                }
                payload.advance(1);
                let address = payload.get_u32();
                let size = payload.get_u32();
                let mut reply = vec![positive];
                reply.extend(self.readback(address, size as usize));
                self.respond_uds(reply);
            }
            _ => self.negative(sid, NRC_SERVICE_NOT_SUPPORTED),
        }
        Ok(())
    }
}

#[async_trait]
impl TransportPort for MockEcu {
    async fn send(&self, command: &Command) -> Result<(), TransportError> {
        tracing::debug!(command = %hex::encode(command.to_bytes()), "Mock ECU: received command");
        self.state.lock().handle(command)
    }

    async fn receive(&self, timeout: Duration) -> Result<Response, TransportError> {
        let (latency, next) = {
            let mut state = self.state.lock();
            (state.latency, state.queue.pop_front())
        };

        match next {
            Some(response) if latency <= timeout => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                Ok(response)
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(format!(
                    "No response within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn reset(&self) {
        let mut state = self.state.lock();
        state.resets += 1;
        state.queue.clear();
        state.download = None;
        state.unlocked = false;
    }
}
