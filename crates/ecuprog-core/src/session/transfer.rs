//! Block transfer and readback

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::blocks::Block;
use super::link::Link;
use crate::error::{ProgramError, ProgramResult};
use crate::protocol::{max_transfer_payload, ProgramTarget, Request};

/// Write one block, retrying failed attempts.
///
/// Non-success responses and transport failures are retried up to
/// `retry_count` additional times, waiting `base_delay * attempt` before
/// attempt N. Returns the number of retries used.
pub(crate) async fn write_block_with_retry(
    link: &Link<'_>,
    target: ProgramTarget,
    block: &Block,
    retry_count: u32,
    base_delay: Duration,
) -> ProgramResult<u32> {
    let mut attempt = 0u32;
    loop {
        let err = match write_block(link, target, block).await {
            Ok(()) => return Ok(attempt),
            Err(e) => block_failure(block, e),
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= retry_count {
            return Err(ProgramError::Io(format!(
                "block {} at 0x{:08X} failed after {} attempts: {}",
                block.index,
                block.address,
                attempt + 1,
                err
            )));
        }

        attempt += 1;
        let delay = base_delay * attempt;
        warn!(
            block = block.index,
            address = %format!("0x{:08X}", block.address),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Block write failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Failures of a single block write count as I/O failures
fn block_failure(block: &Block, err: ProgramError) -> ProgramError {
    match err {
        ProgramError::Timeout(msg) | ProgramError::Protocol(msg) => ProgramError::Io(format!(
            "block {} at 0x{:08X}: {}",
            block.index, block.address, msg
        )),
        other => other,
    }
}

async fn write_block(link: &Link<'_>, target: ProgramTarget, block: &Block) -> ProgramResult<()> {
    for request in link.dialect.write_plan(target, block.address, &block.data) {
        let reply = link.exchange(&request).await?;

        if let Request::RequestDownload { .. } = request {
            if let Some(max) = max_transfer_payload(&reply) {
                if block.data.len() > max {
                    return Err(ProgramError::Compatibility(format!(
                        "block of {} bytes exceeds ECU transfer limit of {} bytes",
                        block.data.len(),
                        max
                    )));
                }
            }
        }
    }
    debug!(block = block.index, len = block.data.len(), "Block written");
    Ok(())
}

/// Read back the first `limit` bytes at `base` in `chunk`-sized requests
/// and compare them with `image`. Returns the number of bytes compared.
pub(crate) async fn verify_image(
    link: &Link<'_>,
    base: u32,
    image: &Bytes,
    limit: usize,
    chunk: u32,
) -> ProgramResult<usize> {
    let limit = limit.min(image.len());
    let chunk = chunk.max(1) as usize;
    let mut offset = 0usize;

    while offset < limit {
        let len = chunk.min(limit - offset);
        let address = base.wrapping_add(offset as u32);
        let readback = link
            .exchange(&Request::ReadBlock {
                address,
                length: len as u32,
            })
            .await?;

        let expected = &image[offset..offset + len];
        if readback.len() < len {
            return Err(ProgramError::Verification {
                address,
                message: format!("short readback: {} of {} bytes", readback.len(), len),
            });
        }
        if let Some(pos) = expected
            .iter()
            .zip(readback.iter())
            .position(|(a, b)| a != b)
        {
            return Err(ProgramError::Verification {
                address: address.wrapping_add(pos as u32),
                message: format!(
                    "expected 0x{:02X}, read 0x{:02X}",
                    expected[pos], readback[pos]
                ),
            });
        }
        offset += len;
    }

    debug!(bytes = offset, "Readback matches image");
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TimeoutsConfig, UdsConfig};
    use crate::error::ErrorKind;
    use crate::protocol::{opcode, Dialect, UdsProfile};
    use crate::transport::{FailureMode, MockEcu, TransportPort};

    fn timeouts() -> TimeoutsConfig {
        TimeoutsConfig {
            response_ms: 20,
            erase_ms: 100,
            operation_ms: 1_000,
        }
    }

    fn block(address: u32, len: usize) -> Block {
        Block {
            index: 0,
            address,
            data: Bytes::from(vec![0x5A; len]),
        }
    }

    async fn unlocked_command_ecu() -> MockEcu {
        let ecu = MockEcu::new();
        ecu.send(&crate::protocol::Command::new(opcode::AUTHENTICATE, vec![0]))
            .await
            .unwrap();
        ecu.receive(Duration::from_millis(10)).await.unwrap();
        ecu
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let ecu = unlocked_command_ecu().await;
        ecu.fail_writes(0x4000, FailureMode::Negative, 3);
        let timeouts = timeouts();
        let link = Link {
            transport: &ecu,
            dialect: Dialect::Command,
            timeouts: &timeouts,
        };

        let retries = write_block_with_retry(
            &link,
            ProgramTarget::Firmware,
            &block(0x4000, 16),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(retries, 3);
        assert_eq!(ecu.write_attempts(0x4000), 4);
        assert_eq!(ecu.memory(0x4000, 16), vec![0x5A; 16]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_io() {
        let ecu = unlocked_command_ecu().await;
        ecu.fail_writes(0x4000, FailureMode::Silent, 10);
        let timeouts = timeouts();
        let link = Link {
            transport: &ecu,
            dialect: Dialect::Command,
            timeouts: &timeouts,
        };

        let err = write_block_with_retry(
            &link,
            ProgramTarget::Firmware,
            &block(0x4000, 16),
            2,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(ecu.write_attempts(0x4000), 3);
    }

    #[tokio::test]
    async fn test_oversized_uds_block_is_not_retried() {
        let ecu = MockEcu::new();
        let timeouts = timeouts();
        let link = Link {
            transport: &ecu,
            dialect: Dialect::Uds(UdsProfile::uds(&UdsConfig::default())),
            timeouts: &timeouts,
        };
        // Unlock through the seed/key exchange
        link.exchange(&Request::RequestSeed { level: 1 }).await.unwrap();
        link.exchange(&Request::SendKey {
            level: 1,
            key: Bytes::from_static(&[0xB4, 0x78, 0x96, 0x1E]),
        })
        .await
        .unwrap();

        let err = write_block_with_retry(
            &link,
            ProgramTarget::Firmware,
            &block(0x4000, 2048),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compatibility);
        assert_eq!(ecu.write_attempts(0x4000), 1);
    }

    #[tokio::test]
    async fn test_verify_reports_first_mismatch() {
        let ecu = unlocked_command_ecu().await;
        let timeouts = timeouts();
        let link = Link {
            transport: &ecu,
            dialect: Dialect::Command,
            timeouts: &timeouts,
        };
        let image = Bytes::from(vec![0x5A; 64]);
        write_block(&link, ProgramTarget::Firmware, &block(0x4000, 64))
            .await
            .unwrap();

        assert_eq!(verify_image(&link, 0x4000, &image, 4096, 16).await.unwrap(), 64);
        assert_eq!(verify_image(&link, 0x4000, &image, 20, 16).await.unwrap(), 20);

        ecu.corrupt_readback();
        let err = verify_image(&link, 0x4000, &image, 64, 16).await.unwrap_err();
        match err {
            ProgramError::Verification { address, .. } => assert_eq!(address, 0x4000),
            other => panic!("unexpected error: {other}"),
        }
    }
}
