//! End-to-end programming sessions against the simulated ECU
//!
//! Every test drives the public engine API over a `MockEcu` and checks both
//! the outcome and what actually went over the wire.

use std::sync::Arc;
use std::time::Duration;

use ecuprog_core::checksum::{append_checksum, ChecksumAlgorithm};
use ecuprog_core::protocol::{opcode, service_id};
use ecuprog_core::security::XorKeyDerivation;
use ecuprog_core::{
    DiagnosticProtocol, EcuInfo, EngineConfig, ErrorKind, FailureMode, MemoryLayout, MemoryRegion,
    MockEcu, ProgramError, ProgramOptions, ProgrammingEngine, RegionKind, SessionState,
    VerifyMode,
};
use pretty_assertions::assert_eq;

const FLASH_BASE: u32 = 0x4000;
const EEPROM_BASE: u32 = 0x0080_0000;

// =============================================================================
// Helpers
// =============================================================================

fn config(dialect: &str) -> EngineConfig {
    EngineConfig::from_toml(&format!(
        r#"
        dialect = "{dialect}"

        [timeouts]
        response_ms = 50
        erase_ms = 500
        operation_ms = 10000

        [program]
        retry_base_delay_ms = 1

        [security]
        secret = "a55a"
        "#
    ))
    .unwrap()
}

fn ecu_info(protocols: &[DiagnosticProtocol]) -> EcuInfo {
    EcuInfo::new("engine", "Engine Control Module")
        .with_manufacturer("acme")
        .with_protocols(protocols.iter().copied())
}

fn engine(ecu: &MockEcu, dialect: &str) -> ProgrammingEngine {
    ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Uds]),
        config(dialect),
    )
    .unwrap()
}

/// `len` bytes including a CRC-32 trailer
fn image(len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..len - 4).map(|i| (i * 7 % 251) as u8).collect();
    append_checksum(&payload, ChecksumAlgorithm::Crc32)
}

fn count(opcodes: &[u8], op: u8) -> usize {
    opcodes.iter().filter(|o| **o == op).count()
}

// =============================================================================
// Command dialect
// =============================================================================

#[tokio::test]
async fn test_program_2305_bytes_in_three_blocks() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    let firmware = image(2305);

    let report = engine.program_firmware(firmware.clone(), None).await.unwrap();

    assert_eq!(report.blocks_written, 3);
    assert_eq!(report.bytes_programmed, 2305);
    assert_eq!(report.bytes_verified, 2305);
    assert_eq!(report.retries, 0);
    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(report.progress_percent, 100);

    assert_eq!(
        ecu.sent_opcodes(),
        vec![
            opcode::INITIALIZE,
            opcode::AUTHENTICATE,
            opcode::READ_MEMORY_LAYOUT,
            opcode::ERASE_SECTOR,
            opcode::WRITE_BLOCK,
            opcode::WRITE_BLOCK,
            opcode::WRITE_BLOCK,
            opcode::READ_BLOCK,
            opcode::READ_BLOCK,
            opcode::READ_BLOCK,
            opcode::FINALIZE,
        ]
    );
    assert_eq!(ecu.memory(FLASH_BASE, firmware.len()), firmware);
    assert_eq!(ecu.memory(FLASH_BASE + 2305, 1), vec![0xFF]);

    // Transport reset and session back to Idle
    assert_eq!(ecu.reset_count(), 1);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_oversized_image_rejected_before_any_write() {
    let layout = MemoryLayout::new(
        vec![MemoryRegion::new(0x1000, 1000, RegionKind::Flash, true)],
        ChecksumAlgorithm::Crc32,
    )
    .unwrap();
    assert_eq!(layout.total_size(), 1000);

    let ecu = MockEcu::new().with_layout(&layout);
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(1200), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    let sent = ecu.sent_opcodes();
    assert_eq!(count(&sent, opcode::ERASE_SECTOR), 0);
    assert_eq!(count(&sent, opcode::WRITE_BLOCK), 0);
    assert_eq!(ecu.reset_count(), 1);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_image_larger_than_flash_rejected() {
    // 0x14000 bytes fit the 0x14800 total, but flash is only 0x10000
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    assert!(0x14000 <= MockEcu::default_layout().total_size());

    let err = engine.program_firmware(image(0x14000), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    let sent = ecu.sent_opcodes();
    assert_eq!(count(&sent, opcode::ERASE_SECTOR), 0);
    assert_eq!(count(&sent, opcode::WRITE_BLOCK), 0);
    assert_eq!(ecu.memory(FLASH_BASE + 0x1_0000, 4), vec![0xFF; 4]);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_calibration_stops_at_eeprom_gap() {
    let layout = MemoryLayout::new(
        vec![
            MemoryRegion::new(FLASH_BASE, 0x1_0000, RegionKind::Flash, true),
            MemoryRegion::new(EEPROM_BASE, 0x400, RegionKind::Eeprom, true),
            MemoryRegion::new(EEPROM_BASE + 0x1000, 0x400, RegionKind::Eeprom, true),
        ],
        ChecksumAlgorithm::Crc32,
    )
    .unwrap();
    let ecu = MockEcu::new().with_layout(&layout);
    let mut engine = engine(&ecu, "command");

    engine.initialize_session().await.unwrap();
    let err = engine
        .program_calibration(image(0x600), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::WRITE_BLOCK), 0);
}

#[tokio::test]
async fn test_checksum_mismatch_rejected() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    let mut firmware = image(512);
    firmware[10] ^= 0x01;

    let err = engine.program_firmware(firmware, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("crc32"));
    assert_eq!(count(&ecu.sent_opcodes(), opcode::WRITE_BLOCK), 0);
}

#[tokio::test]
async fn test_block_entry_point_rejected_while_idle() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");

    let err = engine.flash_firmware(image(64), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = engine.program_calibration(image(64), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    assert!(ecu.sent().is_empty());
    assert_eq!(ecu.reset_count(), 0);
}

#[tokio::test]
async fn test_initialize_then_flash() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");

    engine.initialize_session().await.unwrap();
    assert_eq!(engine.state(), SessionState::Ready);
    assert!(engine.session().security_granted);

    // Layout is read once per session
    let layout = engine.read_memory_layout().await.unwrap();
    assert_eq!(layout, MockEcu::default_layout());
    engine.read_memory_layout().await.unwrap();
    assert_eq!(count(&ecu.sent_opcodes(), opcode::READ_MEMORY_LAYOUT), 1);

    // A second initialize is a contract violation and leaves the session alone
    let err = engine.initialize_session().await.unwrap_err();
    assert!(matches!(
        err,
        ProgramError::InvalidState {
            expected: SessionState::Idle,
            actual: SessionState::Ready
        }
    ));
    assert_eq!(engine.state(), SessionState::Ready);

    let report = engine.flash_firmware(image(300), None).await.unwrap();
    assert_eq!(report.blocks_written, 1);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::READ_MEMORY_LAYOUT), 1);
    assert_eq!(engine.state(), SessionState::Idle);
}

// =============================================================================
// Retry law
// =============================================================================

#[tokio::test]
async fn test_block_recovers_after_retry_count_failures() {
    let ecu = MockEcu::new();
    ecu.fail_writes(FLASH_BASE + 1024, FailureMode::Negative, 3);
    let mut engine = engine(&ecu, "command");

    let report = engine.program_firmware(image(2305), None).await.unwrap();

    assert_eq!(report.retries, 3);
    assert_eq!(ecu.write_attempts(FLASH_BASE), 1);
    assert_eq!(ecu.write_attempts(FLASH_BASE + 1024), 4);
    assert_eq!(ecu.write_attempts(FLASH_BASE + 2048), 1);
}

#[tokio::test]
async fn test_block_failing_beyond_retry_count_aborts_session() {
    let ecu = MockEcu::new();
    ecu.fail_writes(FLASH_BASE + 1024, FailureMode::Negative, 4);
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(2305), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(ecu.write_attempts(FLASH_BASE + 1024), 4);
    // No further blocks after the fatal one
    assert_eq!(ecu.write_attempts(FLASH_BASE + 2048), 0);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::FINALIZE), 0);
    assert_eq!(ecu.reset_count(), 1);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_transport_failures_are_retried() {
    let ecu = MockEcu::new();
    ecu.fail_writes(FLASH_BASE, FailureMode::Disconnect, 1);
    ecu.fail_writes(FLASH_BASE + 1024, FailureMode::Silent, 1);
    let mut engine = engine(&ecu, "command");

    let report = engine.program_firmware(image(2305), None).await.unwrap();

    assert_eq!(report.retries, 2);
    assert_eq!(ecu.write_attempts(FLASH_BASE), 2);
    assert_eq!(ecu.write_attempts(FLASH_BASE + 1024), 2);
}

#[tokio::test]
async fn test_zero_retry_count_fails_on_first_error() {
    let ecu = MockEcu::new();
    ecu.fail_writes(FLASH_BASE, FailureMode::Negative, 1);
    let mut engine = engine(&ecu, "command");
    let options = ProgramOptions {
        retry_count: 0,
        ..ProgramOptions::default()
    };

    let err = engine
        .program_firmware(image(100), Some(options))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(ecu.write_attempts(FLASH_BASE), 1);
}

// =============================================================================
// Failure categories
// =============================================================================

#[tokio::test]
async fn test_readback_mismatch_is_verification_error() {
    let ecu = MockEcu::new();
    ecu.corrupt_readback();
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(2305), None).await.unwrap_err();

    match err {
        ProgramError::Verification { address, .. } => assert_eq!(address, FLASH_BASE),
        other => panic!("expected verification failure, got {other}"),
    }
    assert_eq!(count(&ecu.sent_opcodes(), opcode::FINALIZE), 0);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_verification_can_be_skipped() {
    let ecu = MockEcu::new();
    ecu.corrupt_readback();
    let mut engine = engine(&ecu, "command");
    let options = ProgramOptions {
        verify_after_write: false,
        ..ProgramOptions::default()
    };

    let report = engine
        .program_firmware(image(2305), Some(options))
        .await
        .unwrap();
    assert_eq!(report.bytes_verified, 0);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::READ_BLOCK), 0);
}

#[tokio::test]
async fn test_full_verification_reads_whole_image() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    let options = ProgramOptions {
        block_size: 2048,
        verify_mode: VerifyMode::Full,
        ..ProgramOptions::default()
    };

    let report = engine
        .program_firmware(image(5000), Some(options))
        .await
        .unwrap();
    assert_eq!(report.blocks_written, 3);
    assert_eq!(report.bytes_verified, 5000);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::READ_BLOCK), 3);
}

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    let ecu = MockEcu::new();
    ecu.reject_authentication();
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(512), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Security);
    assert_eq!(
        ecu.sent_opcodes(),
        vec![opcode::INITIALIZE, opcode::AUTHENTICATE]
    );
    assert_eq!(ecu.reset_count(), 1);
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_unsupported_protocols_are_compatibility_errors() {
    let ecu = MockEcu::new();
    let mut engine = ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Obd2]),
        config("auto"),
    )
    .unwrap();

    let err = engine.program_firmware(image(512), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Compatibility);
    assert!(ecu.sent().is_empty());
    assert_eq!(engine.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_zero_region_layout_fails_fast() {
    let ecu = MockEcu::new().with_layout_record(vec![0x04, 0x00]);
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(512), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Compatibility);
    assert_eq!(count(&ecu.sent_opcodes(), opcode::ERASE_SECTOR), 0);
}

#[tokio::test]
async fn test_zero_region_layout_fails_initialization() {
    let ecu = MockEcu::new().with_layout_record(vec![0x04, 0x00]);
    let mut engine = engine(&ecu, "command");

    let err = engine.initialize_session().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Compatibility);
    assert_eq!(engine.state(), SessionState::Idle);
    assert_eq!(ecu.reset_count(), 1);
}

#[tokio::test]
async fn test_truncated_layout_is_protocol_error() {
    let ecu = MockEcu::new().with_layout_record(vec![0x04, 0x01, 0x00]);
    let mut engine = engine(&ecu, "command");

    let err = engine.program_firmware(image(512), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_abort_is_honoured_before_next_block() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    let handle = engine.abort_handle();
    handle.abort();

    let err = engine.program_firmware(image(2305), None).await.unwrap_err();

    assert!(matches!(err, ProgramError::Aborted));
    assert_eq!(count(&ecu.sent_opcodes(), opcode::WRITE_BLOCK), 0);
    assert_eq!(ecu.reset_count(), 1);
    assert!(!handle.is_aborted());

    // The engine is usable again afterwards
    engine.program_firmware(image(2305), None).await.unwrap();
}

#[tokio::test]
async fn test_operation_timeout_tears_session_down() {
    let ecu = MockEcu::new().with_latency(Duration::from_millis(20));
    let mut config = config("command");
    config.timeouts.operation_ms = 60;
    let mut engine = ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Uds]),
        config,
    )
    .unwrap();

    let err = engine.program_firmware(image(2305), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(ecu.reset_count(), 1);
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(engine.session().memory_layout.is_none());
}

#[tokio::test]
async fn test_busy_frames_are_waited_out() {
    let ecu = MockEcu::new().with_pending_frames(3);
    let mut engine = engine(&ecu, "command");

    engine.program_firmware(image(600), None).await.unwrap();
}

// =============================================================================
// Observation
// =============================================================================

#[tokio::test]
async fn test_progress_events_per_block() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "command");
    let mut progress = engine.subscribe_progress();
    let status = engine.watch_status();

    engine.program_firmware(image(2305), None).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = progress.try_recv() {
        events.push(event);
    }

    let blocks: Vec<u8> = events
        .iter()
        .filter(|e| e.description.starts_with("Block"))
        .map(|e| e.percent)
        .collect();
    assert_eq!(blocks, vec![33, 66, 100]);
    assert_eq!(events.first().map(|e| e.description.as_str()), Some("Initializing session"));
    assert!(events.iter().any(|e| e.description == "Verifying"));

    let last = events.last().unwrap();
    assert_eq!(last.percent, 100);
    assert_eq!(last.description, "Completed");

    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.state, SessionState::Idle);
}

// =============================================================================
// UDS dialect
// =============================================================================

#[tokio::test]
async fn test_uds_firmware_download() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "auto");
    let firmware = image(2305);

    let report = engine.program_firmware(firmware.clone(), None).await.unwrap();
    assert_eq!(report.blocks_written, 3);

    let sent = ecu.sent_opcodes();
    assert_eq!(
        &sent[..5],
        &[
            service_id::DIAGNOSTIC_SESSION_CONTROL,
            service_id::SECURITY_ACCESS,
            service_id::SECURITY_ACCESS,
            service_id::READ_DATA_BY_ID,
            service_id::ROUTINE_CONTROL,
        ]
    );
    assert_eq!(count(&sent, service_id::REQUEST_DOWNLOAD), 3);
    assert_eq!(count(&sent, service_id::TRANSFER_DATA), 3);
    assert_eq!(count(&sent, service_id::REQUEST_TRANSFER_EXIT), 3);
    assert_eq!(count(&sent, service_id::READ_MEMORY_BY_ADDRESS), 3);
    assert_eq!(sent.last(), Some(&service_id::ROUTINE_CONTROL));

    // Programming session byte
    assert_eq!(ecu.sent()[0].payload.as_ref(), &[0x02]);
    assert_eq!(ecu.memory(FLASH_BASE, firmware.len()), firmware);
}

#[tokio::test]
async fn test_uds_response_pending_on_erase() {
    let ecu = MockEcu::new().with_pending_frames(5);
    let mut engine = engine(&ecu, "uds");

    engine.program_firmware(image(1500), None).await.unwrap();
}

#[tokio::test]
async fn test_uds_negative_block_response_is_retried() {
    let ecu = MockEcu::new();
    ecu.fail_writes(FLASH_BASE, FailureMode::Negative, 2);
    let mut engine = engine(&ecu, "uds");

    let report = engine.program_firmware(image(900), None).await.unwrap();
    assert_eq!(report.retries, 2);
    assert_eq!(ecu.write_attempts(FLASH_BASE), 3);
}

#[tokio::test]
async fn test_uds_calibration_uses_write_memory_by_address() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "uds");
    let calibration = image(300);

    engine.initialize_session().await.unwrap();
    let report = engine
        .program_calibration(calibration.clone(), None)
        .await
        .unwrap();

    assert_eq!(report.target, "calibration");
    assert_eq!(report.blocks_written, 1);
    let sent = ecu.sent_opcodes();
    assert_eq!(count(&sent, service_id::WRITE_MEMORY_BY_ADDRESS), 1);
    assert_eq!(count(&sent, service_id::REQUEST_DOWNLOAD), 0);
    // Only the finalize routine, no erase
    assert_eq!(count(&sent, service_id::ROUTINE_CONTROL), 1);
    assert_eq!(ecu.memory(EEPROM_BASE, calibration.len()), calibration);
}

#[tokio::test]
async fn test_calibration_limited_to_eeprom_capacity() {
    let ecu = MockEcu::new();
    let mut engine = engine(&ecu, "uds");

    engine.initialize_session().await.unwrap();
    let err = engine
        .program_calibration(image(0x900), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(count(&ecu.sent_opcodes(), service_id::WRITE_MEMORY_BY_ADDRESS), 0);
}

#[tokio::test]
async fn test_manufacturer_key_derivation() {
    let ecu = MockEcu::new().with_secret(vec![0x3C, 0x96, 0x0F]);
    let mut config = config("uds");
    config.security.secret = None;
    let mut engine = ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Uds]),
        config,
    )
    .unwrap()
    .with_key_derivation(
        "ACME",
        Arc::new(XorKeyDerivation::new(vec![0x3C, 0x96, 0x0F]).unwrap()),
    );

    engine.program_firmware(image(256), None).await.unwrap();
}

#[tokio::test]
async fn test_missing_key_derivation_is_security_error() {
    let ecu = MockEcu::new();
    let mut config = config("uds");
    config.security.secret = None;
    let mut engine = ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Uds]),
        config,
    )
    .unwrap();

    let err = engine.program_firmware(image(256), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
    assert!(!ecu.is_unlocked());
}

#[tokio::test]
async fn test_kwp2000_session_byte() {
    let ecu = MockEcu::new();
    let mut engine = ProgrammingEngine::new(
        Box::new(ecu.clone()),
        ecu_info(&[DiagnosticProtocol::Kwp2000]),
        config("auto"),
    )
    .unwrap();

    engine.initialize_session().await.unwrap();
    assert_eq!(engine.dialect().map(|d| d.name()), Some("kwp2000"));
    assert_eq!(ecu.sent()[0].payload.as_ref(), &[0x85]);
}
