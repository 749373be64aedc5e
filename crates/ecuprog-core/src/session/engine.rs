//! Programming engine
//!
//! Drives one session at a time over an exclusively owned transport:
//! initialize, authenticate, read layout, validate, erase, write blocks,
//! verify, finalize. Any failure tears the session down (transport reset,
//! state back to `Idle`) before the error reaches the caller. Blocks already
//! written are not rolled back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::blocks::split_blocks;
use super::link::Link;
use super::transfer::{verify_image, write_block_with_retry};
use super::{Session, SessionSnapshot, SessionState};
use crate::checksum;
use crate::config::{decode_secret, ConfigError, EngineConfig, ProgramOptions};
use crate::ecu::EcuInfo;
use crate::error::{ProgramError, ProgramResult};
use crate::events::{block_percent, AbortHandle, ProgressEvent};
use crate::layout::{MemoryLayout, RegionKind};
use crate::protocol::{Dialect, ProgramTarget, Request};
use crate::security::{
    ChallengeVerifier, KeyDerivation, KeyDerivationRegistry, SecurityAccess, XorChallengeVerifier,
};
use crate::transport::TransportPort;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a successful programming operation
#[derive(Debug, Clone, Serialize)]
pub struct ProgramReport {
    pub session_id: Uuid,
    pub target: &'static str,
    pub blocks_written: usize,
    pub bytes_programmed: u32,
    pub bytes_verified: usize,
    /// Block write attempts beyond the first, summed over all blocks
    pub retries: u32,
    pub elapsed: Duration,
    pub final_state: SessionState,
    pub progress_percent: u8,
}

/// ECU programming engine bound to one transport and one ECU
pub struct ProgrammingEngine {
    transport: Box<dyn TransportPort>,
    ecu: EcuInfo,
    config: EngineConfig,
    keys: Arc<KeyDerivationRegistry>,
    verifier: Option<Arc<dyn ChallengeVerifier>>,
    session: Session,
    dialect: Option<Dialect>,
    abort: AbortHandle,
    status_tx: watch::Sender<SessionSnapshot>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgrammingEngine {
    pub fn new(
        transport: Box<dyn TransportPort>,
        ecu: EcuInfo,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let keys = KeyDerivationRegistry::from_config(&config.security)?;
        let verifier = match &config.security.secret {
            Some(secret) => {
                let secret = decode_secret("security.secret", secret)?;
                let verifier = XorChallengeVerifier::new(secret)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Some(Arc::new(verifier) as Arc<dyn ChallengeVerifier>)
            }
            None => None,
        };

        let session = Session::default();
        let (status_tx, _) = watch::channel(session.snapshot());
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

        Ok(Self {
            transport,
            ecu,
            config,
            keys: Arc::new(keys),
            verifier,
            session,
            dialect: None,
            abort: AbortHandle::new(),
            status_tx,
            progress_tx,
        })
    }

    /// Register a key derivation strategy for `manufacturer`
    pub fn with_key_derivation(
        mut self,
        manufacturer: &str,
        strategy: Arc<dyn KeyDerivation>,
    ) -> Self {
        Arc::make_mut(&mut self.keys).register(manufacturer, strategy);
        self
    }

    /// Key derivation used when no manufacturer-specific strategy matches
    pub fn with_default_key_derivation(mut self, strategy: Arc<dyn KeyDerivation>) -> Self {
        Arc::make_mut(&mut self.keys).set_fallback(strategy);
        self
    }

    pub fn with_challenge_verifier(mut self, verifier: Arc<dyn ChallengeVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn ecu(&self) -> &EcuInfo {
        &self.ecu
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Dialect chosen for the current session, if one is active
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status_tx.subscribe()
    }

    /// Enter the programming session and authenticate: `Idle -> Ready`
    pub async fn initialize_session(&mut self) -> ProgramResult<()> {
        self.require(SessionState::Idle)?;
        let deadline = self.config.timeouts.operation();
        let result = match tokio::time::timeout(deadline, self.initialize()).await {
            Ok(result) => result,
            Err(_) => Err(operation_timeout(deadline)),
        };
        self.finish(result).await
    }

    /// Memory layout of the target, read once per session
    pub async fn read_memory_layout(&mut self) -> ProgramResult<MemoryLayout> {
        if !matches!(
            self.session.state,
            SessionState::Ready | SessionState::Programming
        ) {
            return Err(ProgramError::InvalidState {
                expected: SessionState::Ready,
                actual: self.session.state,
            });
        }
        let result = self.load_layout().await;
        self.finish(result).await
    }

    /// Program firmware into flash. Requires `Ready`.
    pub async fn flash_firmware(
        &mut self,
        image: impl Into<Bytes>,
        options: Option<ProgramOptions>,
    ) -> ProgramResult<ProgramReport> {
        self.require(SessionState::Ready)?;
        self.run(ProgramTarget::Firmware, image.into(), options, false)
            .await
    }

    /// Program calibration data into EEPROM. Requires `Ready`.
    pub async fn program_calibration(
        &mut self,
        data: impl Into<Bytes>,
        options: Option<ProgramOptions>,
    ) -> ProgramResult<ProgramReport> {
        self.require(SessionState::Ready)?;
        self.run(ProgramTarget::Calibration, data.into(), options, false)
            .await
    }

    /// Full programming operation, initializing the session first when idle
    pub async fn program_firmware(
        &mut self,
        image: impl Into<Bytes>,
        options: Option<ProgramOptions>,
    ) -> ProgramResult<ProgramReport> {
        let initialize = match self.session.state {
            SessionState::Idle => true,
            SessionState::Ready => false,
            actual => {
                return Err(ProgramError::InvalidState {
                    expected: SessionState::Idle,
                    actual,
                })
            }
        };
        self.run(ProgramTarget::Firmware, image.into(), options, initialize)
            .await
    }

    async fn run(
        &mut self,
        target: ProgramTarget,
        image: Bytes,
        options: Option<ProgramOptions>,
        initialize: bool,
    ) -> ProgramResult<ProgramReport> {
        let deadline = self.config.timeouts.operation();
        let operation = async {
            if initialize {
                self.initialize().await?;
            }
            self.program(target, image, options).await
        };
        let result = match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(operation_timeout(deadline)),
        };
        self.finish(result).await
    }

    fn require(&self, expected: SessionState) -> ProgramResult<()> {
        if self.session.state != expected {
            return Err(ProgramError::InvalidState {
                expected,
                actual: self.session.state,
            });
        }
        Ok(())
    }

    fn active_dialect(&self) -> ProgramResult<Dialect> {
        self.dialect.ok_or(ProgramError::InvalidState {
            expected: SessionState::Ready,
            actual: self.session.state,
        })
    }

    fn link(&self) -> ProgramResult<Link<'_>> {
        Ok(Link {
            transport: self.transport.as_ref(),
            dialect: self.active_dialect()?,
            timeouts: &self.config.timeouts,
        })
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.session.snapshot());
    }

    fn emit(&self, percent: u8, description: impl Into<String>) {
        // No subscribers is fine
        let _ = self.progress_tx.send(ProgressEvent::new(percent, description));
    }

    fn enter(&mut self, state: SessionState, description: &str) {
        debug!(from = %self.session.state, to = %state, "Session state change");
        self.session.state = state;
        self.publish_status();
        self.emit(self.session.progress_percent, description);
    }

    async fn initialize(&mut self) -> ProgramResult<()> {
        self.session = Session::default();
        self.enter(SessionState::Initializing, "Initializing session");

        let dialect = Dialect::select(&self.ecu, self.config.dialect, &self.config.uds)?;
        self.dialect = Some(dialect);
        info!(
            session_id = %self.session.id,
            ecu = %self.ecu.id,
            dialect = dialect.name(),
            "Initializing programming session"
        );

        let access = if dialect.uses_seed_key() {
            SecurityAccess::SeedKey {
                level: self.config.security.level,
                keys: self.keys.clone(),
            }
        } else {
            SecurityAccess::ChallengeResponse(self.verifier.clone())
        };

        {
            let link = self.link()?;
            link.exchange(&Request::EnterProgrammingSession).await?;
            access.authenticate(&link, &self.ecu).await?;
        }
        // An unusable layout fails here rather than at the first write
        self.load_layout().await?;

        self.session.security_granted = true;
        self.enter(SessionState::Ready, "Session ready");
        Ok(())
    }

    async fn load_layout(&mut self) -> ProgramResult<MemoryLayout> {
        if let Some(layout) = &self.session.memory_layout {
            return Ok(layout.clone());
        }

        let record = self.link()?.exchange(&Request::ReadMemoryLayout).await?;
        let layout = MemoryLayout::decode(&record)?;
        info!(
            regions = layout.regions().len(),
            total_size = layout.total_size(),
            checksum = %layout.checksum_kind(),
            "Memory layout read"
        );
        self.session.memory_layout = Some(layout.clone());
        Ok(layout)
    }

    async fn program(
        &mut self,
        target: ProgramTarget,
        image: Bytes,
        options: Option<ProgramOptions>,
    ) -> ProgramResult<ProgramReport> {
        let options = options.unwrap_or_else(|| self.config.program_options());
        options.validate()?;
        let started = Instant::now();

        self.session.bytes_programmed = 0;
        self.session.progress_percent = 0;
        self.enter(SessionState::Programming, "Programming");

        let layout = self.load_layout().await?;
        let base = validate_image(&layout, target, &image)?;
        let blocks = split_blocks(base, &image, options.block_size);
        let total = blocks.len();
        info!(
            target = target_name(target),
            base = %format!("0x{:08X}", base),
            bytes = image.len(),
            blocks = total,
            "Image accepted"
        );

        // Field borrows only, so the session stays writable below
        let link = Link {
            transport: self.transport.as_ref(),
            dialect: self.active_dialect()?,
            timeouts: &self.config.timeouts,
        };

        if target == ProgramTarget::Firmware {
            self.emit(0, "Erasing");
            for region in layout.regions_overlapping(base, image.len() as u32) {
                debug!(
                    start = %format!("0x{:08X}", region.start),
                    size = region.size,
                    "Erasing region"
                );
                link.exchange(&Request::Erase {
                    address: region.start,
                    size: region.size,
                })
                .await?;
            }
        }

        let base_delay = self.config.program.retry_base_delay();
        let mut retries = 0u32;
        for block in &blocks {
            if self.abort.is_aborted() {
                warn!(block = block.index, "Abort requested");
                return Err(ProgramError::Aborted);
            }

            retries +=
                write_block_with_retry(&link, target, block, options.retry_count, base_delay)
                    .await?;

            let done = block.index + 1;
            self.session.bytes_programmed += block.data.len() as u32;
            self.session.progress_percent = block_percent(done, total);
            self.publish_status();
            self.emit(
                self.session.progress_percent,
                format!("Block {}/{} written", done, total),
            );
        }

        let bytes_verified = if options.verify_after_write {
            self.emit(self.session.progress_percent, "Verifying");
            let limit = options.verify_mode.limit(image.len());
            verify_image(&link, base, &image, limit, options.block_size).await?
        } else {
            0
        };

        link.exchange(&Request::Finalize).await?;

        self.session.state = SessionState::Completed;
        self.session.progress_percent = 100;
        self.publish_status();
        self.emit(100, "Completed");

        let report = ProgramReport {
            session_id: self.session.id,
            target: target_name(target),
            blocks_written: total,
            bytes_programmed: self.session.bytes_programmed,
            bytes_verified,
            retries,
            elapsed: started.elapsed(),
            final_state: SessionState::Completed,
            progress_percent: 100,
        };
        info!(
            session_id = %report.session_id,
            blocks = report.blocks_written,
            bytes = report.bytes_programmed,
            verified = report.bytes_verified,
            retries = report.retries,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Programming completed"
        );
        Ok(report)
    }

    /// Close out an operation: completed sessions and failures both reset
    /// the transport and return to `Idle`
    async fn finish<T>(&mut self, result: ProgramResult<T>) -> ProgramResult<T> {
        match result {
            Ok(value) => {
                if self.session.state == SessionState::Completed {
                    self.transport.reset().await;
                    self.reset_session();
                }
                Ok(value)
            }
            Err(err) => {
                self.teardown(&err).await;
                Err(err)
            }
        }
    }

    async fn teardown(&mut self, err: &ProgramError) {
        warn!(
            session_id = %self.session.id,
            state = %self.session.state,
            error = %err,
            "Programming session failed, tearing down"
        );
        self.session.state = SessionState::Error;
        self.publish_status();
        self.emit(self.session.progress_percent, format!("Failed: {}", err));

        self.transport.reset().await;
        self.reset_session();
    }

    fn reset_session(&mut self) {
        self.session = Session::default();
        self.dialect = None;
        self.abort.clear();
        self.publish_status();
    }
}

fn operation_timeout(deadline: Duration) -> ProgramError {
    ProgramError::Timeout(format!(
        "operation exceeded {}ms",
        deadline.as_millis()
    ))
}

fn target_name(target: ProgramTarget) -> &'static str {
    match target {
        ProgramTarget::Firmware => "firmware",
        ProgramTarget::Calibration => "calibration",
    }
}

/// Size and checksum preconditions; returns the programming base address
fn validate_image(layout: &MemoryLayout, target: ProgramTarget, image: &[u8]) -> ProgramResult<u32> {
    let (kind, capacity) = match target {
        ProgramTarget::Firmware => (RegionKind::Flash, layout.total_size()),
        ProgramTarget::Calibration => {
            let eeprom = layout.capacity_of(RegionKind::Eeprom);
            let capacity = if eeprom > 0 { eeprom } else { layout.total_size() };
            (RegionKind::Eeprom, capacity)
        }
    };

    if image.is_empty() {
        return Err(ProgramError::Validation("image is empty".to_string()));
    }
    if image.len() as u64 > u64::from(capacity) {
        return Err(ProgramError::Validation(format!(
            "image of {} bytes exceeds {} bytes available",
            image.len(),
            capacity
        )));
    }

    let algorithm = layout.checksum_kind();
    if image.len() < algorithm.trailer_size() {
        return Err(ProgramError::Validation(format!(
            "image of {} bytes is shorter than the {} trailer",
            image.len(),
            algorithm
        )));
    }
    if !checksum::verify(image, algorithm) {
        return Err(ProgramError::Validation(format!(
            "{} checksum mismatch",
            algorithm
        )));
    }

    let base = layout.program_base(kind).ok_or_else(|| {
        ProgramError::Compatibility(format!("layout has no writable {:?} region", kind))
    })?;

    if let Some(region) = layout
        .regions_overlapping(base, image.len() as u32)
        .find(|r| !r.writable)
    {
        return Err(ProgramError::Compatibility(format!(
            "image at 0x{:08X} would overlap read-only {:?} region at 0x{:08X}",
            base, region.kind, region.start
        )));
    }

    let span = layout.contiguous_writable(kind, base);
    if image.len() as u64 > span {
        return Err(ProgramError::Validation(format!(
            "image of {} bytes at 0x{:08X} exceeds the {} contiguous writable {:?} bytes",
            image.len(),
            base,
            span,
            kind
        )));
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{append_checksum, ChecksumAlgorithm};
    use crate::ecu::DiagnosticProtocol;
    use crate::error::ErrorKind;
    use crate::layout::MemoryRegion;
    use crate::transport::MockEcu;

    fn layout(flash: u32) -> MemoryLayout {
        MemoryLayout::new(
            vec![
                MemoryRegion::new(0x0, 0x100, RegionKind::Bootloader, false),
                MemoryRegion::new(0x100, flash, RegionKind::Flash, true),
            ],
            ChecksumAlgorithm::Sum8,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_image_checks_size_then_checksum() {
        let layout = layout(0x200);
        let image = append_checksum(&[1, 2, 3], ChecksumAlgorithm::Sum8);
        assert_eq!(validate_image(&layout, ProgramTarget::Firmware, &image).unwrap(), 0x100);

        let err = validate_image(&layout, ProgramTarget::Firmware, &[1, 2, 3, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let big = append_checksum(&vec![0u8; 0x400], ChecksumAlgorithm::Sum8);
        let err = validate_image(&layout, ProgramTarget::Firmware, &big).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        // No EEPROM: calibration falls back to the total size, but has no base
        let err = validate_image(&layout, ProgramTarget::Calibration, &image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compatibility);
    }

    #[test]
    fn test_validate_image_stays_inside_target_regions() {
        // Fits the total size (bootloader included) but not the flash
        let layout = layout(0x200);
        let image = append_checksum(&vec![0u8; 0x24F], ChecksumAlgorithm::Sum8);
        assert!(image.len() as u32 <= layout.total_size());

        let err = validate_image(&layout, ProgramTarget::Firmware, &image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("contiguous"));

        let fits = append_checksum(&vec![0u8; 0x1FF], ChecksumAlgorithm::Sum8);
        assert!(validate_image(&layout, ProgramTarget::Firmware, &fits).is_ok());
    }

    #[tokio::test]
    async fn test_calls_outside_ready_touch_nothing() {
        let ecu = MockEcu::new();
        let info = EcuInfo::new("ecu", "ECU").with_protocols([DiagnosticProtocol::Uds]);
        let mut engine =
            ProgrammingEngine::new(Box::new(ecu.clone()), info, EngineConfig::default()).unwrap();

        let err = engine.flash_firmware(vec![0u8; 8], None).await.unwrap_err();
        assert!(matches!(
            err,
            ProgramError::InvalidState {
                expected: SessionState::Ready,
                actual: SessionState::Idle
            }
        ));
        assert!(engine.read_memory_layout().await.is_err());
        assert!(ecu.sent().is_empty());
        assert_eq!(ecu.reset_count(), 0);
    }

    #[test]
    fn test_invalid_secret_rejected_at_construction() {
        let mut config = EngineConfig::default();
        config.security.secret = Some("not-hex".to_string());
        let result = ProgrammingEngine::new(
            Box::new(MockEcu::new()),
            EcuInfo::default(),
            config,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
