//! Request/response exchange over the transport port

use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::config::TimeoutsConfig;
use crate::error::{ProgramError, ProgramResult};
use crate::protocol::{Dialect, Reply, Request};
use crate::transport::TransportPort;

/// Borrowed view of the transport and dialect for one session
///
/// Every exchange is strictly sequential: the command is fully sent before
/// its response is read, and the next command waits for the final reply or
/// its timeout.
pub(crate) struct Link<'a> {
    pub transport: &'a dyn TransportPort,
    pub dialect: Dialect,
    pub timeouts: &'a TimeoutsConfig,
}

impl Link<'_> {
    /// Send `request` and return the payload of its final positive reply.
    ///
    /// Response-pending frames are followed until the erase timeout budget
    /// is spent.
    pub async fn exchange(&self, request: &Request) -> ProgramResult<Bytes> {
        let command = self.dialect.encode(request)?;
        let frame_timeout = if request.is_slow() {
            self.timeouts.erase()
        } else {
            self.timeouts.response()
        };

        debug!(
            request = request.name(),
            opcode = %format!("0x{:02X}", command.opcode),
            len = command.payload.len(),
            "Sending request"
        );
        self.transport.send(&command).await?;

        let start = Instant::now();
        loop {
            let response = self.transport.receive(frame_timeout).await?;
            match self.dialect.interpret(request, &response)? {
                Reply::Positive(data) => return Ok(data),
                Reply::Pending => {
                    if start.elapsed() > self.timeouts.erase() {
                        return Err(ProgramError::Timeout(format!(
                            "{} still pending after {}ms",
                            request.name(),
                            self.timeouts.erase_ms
                        )));
                    }
                    debug!(request = request.name(), "Response pending");
                }
            }
        }
    }
}
