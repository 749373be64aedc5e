//! ecuprog-core - ECU programming and diagnostic protocol engine
//!
//! Authenticates against an ECU over a byte-oriented transport, then erases,
//! writes and verifies firmware or calibration memory. Every image is
//! checksum-validated against the layout the ECU reports before any write.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ProgrammingEngine                          │
//! │  Idle -> Initializing -> Ready -> Programming -> Completed  │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ Security    │  │ MemoryLayout│  │ Checksum engine     │ │
//! │  │ (seed/key,  │  │ (regions,   │  │ (sum, crc, xor)     │ │
//! │  │  challenge) │  │  checksum)  │  │                     │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! │                          │                                  │
//! │                    ┌─────┴─────┐                            │
//! │                    │  Dialect  │                            │
//! │                    │ (Command, │                            │
//! │                    │ UDS/KWP)  │                            │
//! │                    └─────┬─────┘                            │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │  TransportPort  │                         │
//! │                 │ (link / MockEcu)│                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod checksum;
pub mod coding;
pub mod config;
pub mod ecu;
pub mod error;
pub mod events;
pub mod layout;
pub mod protocol;
pub mod security;
pub mod session;
pub mod transport;

pub use checksum::{append_checksum, calculate_checksum, ChecksumAlgorithm};
pub use coding::CodingBytes;
pub use config::{ConfigError, EngineConfig, ProgramOptions, VerifyMode};
pub use ecu::{DiagnosticProtocol, EcuInfo};
pub use error::{ErrorKind, ProgramError, ProgramResult};
pub use events::{AbortHandle, ProgressEvent};
pub use layout::{MemoryLayout, MemoryRegion, RegionKind};
pub use protocol::{Command, Response, ResponseStatus};
pub use security::{ChallengeVerifier, KeyDerivation, KeyDerivationRegistry};
pub use session::{ProgramReport, ProgrammingEngine, SessionSnapshot, SessionState};
pub use transport::{FailureMode, MockEcu, TransportError, TransportPort};
