//! Transport layer
//!
//! The engine talks to an ECU through a [`TransportPort`]. Physical links
//! (Bluetooth, serial) live outside this crate; [`MockEcu`] simulates a
//! programmable ECU for both command dialects.
//!
//! # Example
//!
//! ```ignore
//! use ecuprog_core::transport::{MockEcu, TransportPort};
//!
//! let ecu = MockEcu::new();
//! let engine = ProgrammingEngine::new(Box::new(ecu.clone()), info, EngineConfig::default());
//! ```

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::TransportPort;
pub use error::TransportError;
pub use mock::{FailureMode, MockEcu};
