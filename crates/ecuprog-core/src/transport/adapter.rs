//! Transport port consumed by the programming engine

use std::time::Duration;

use async_trait::async_trait;

use super::TransportError;
use crate::protocol::{Command, Response};

/// Byte-oriented link to a single ECU
///
/// The transport frames bytes into discrete responses; the engine only relies
/// on "an opcode byte followed by payload". Exactly one command is in flight
/// at a time: the engine never sends before the previous response (or its
/// timeout) resolved.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Send one framed command
    async fn send(&self, command: &Command) -> Result<(), TransportError>;

    /// Wait for the next framed response
    ///
    /// Returns [`TransportError::Timeout`] if no frame arrives in time.
    async fn receive(&self, timeout: Duration) -> Result<Response, TransportError>;

    /// Drop any partial exchange and return the link to its idle state
    async fn reset(&self);
}

