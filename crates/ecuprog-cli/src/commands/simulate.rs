//! Simulate command - full programming run against the built-in ECU model

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ecuprog_core::checksum::append_checksum;
use ecuprog_core::protocol::DialectPreference;
use ecuprog_core::{
    DiagnosticProtocol, EcuInfo, EngineConfig, FailureMode, MockEcu, ProgramOptions,
    ProgramReport, ProgrammingEngine, RegionKind, VerifyMode,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::output::OutputContext;

/// Secret shared by the simulated ECU when the configuration has none
const SIMULATOR_SECRET: &str = "a55a";

/// Parameters of one simulated run
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    pub file: PathBuf,
    pub dialect: DialectPreference,
    pub calibration: bool,
    /// Append the layout checksum before programming
    pub sign: bool,
    pub block_size: Option<u32>,
    pub full_verify: bool,
    /// Fail the first block write this many times
    pub inject_failures: u32,
    pub latency_ms: u64,
}

fn protocols_for(dialect: DialectPreference) -> Vec<DiagnosticProtocol> {
    match dialect {
        DialectPreference::Kwp2000 => vec![DiagnosticProtocol::Kwp2000],
        _ => vec![DiagnosticProtocol::Uds],
    }
}

/// Program an image into a simulated ECU and report the outcome
pub async fn simulate(
    args: &SimulateArgs,
    mut config: EngineConfig,
    ctx: &OutputContext,
) -> Result<()> {
    let mut image = std::fs::read(&args.file)
        .with_context(|| format!("Failed to read image: {}", args.file.display()))?;
    ctx.info(&format!(
        "Image {} ({} bytes)",
        args.file.display(),
        image.len()
    ));

    let layout = MockEcu::default_layout();
    if args.sign {
        image = append_checksum(&image, layout.checksum_kind());
        ctx.info(&format!("Appended {} trailer", layout.checksum_kind()));
    }

    config.dialect = args.dialect;
    let secret = config
        .security
        .secret
        .get_or_insert_with(|| SIMULATOR_SECRET.to_string())
        .clone();
    let secret = hex::decode(&secret).context("Invalid security secret")?;

    let mock = MockEcu::new()
        .with_layout(&layout)
        .with_secret(secret)
        .with_latency(Duration::from_millis(args.latency_ms));

    let target_base = if args.calibration {
        layout.program_base(RegionKind::Eeprom)
    } else {
        layout.program_base(RegionKind::Flash)
    };
    if args.inject_failures > 0 {
        if let Some(base) = target_base {
            mock.fail_writes(base, FailureMode::Negative, args.inject_failures);
        }
    }

    let mut options = config.program_options();
    if let Some(block_size) = args.block_size {
        options.block_size = block_size;
    }
    if args.full_verify {
        options.verify_mode = VerifyMode::Full;
    }

    let info = EcuInfo::new("sim", "Simulated ECU")
        .with_manufacturer("simulator")
        .with_protocols(protocols_for(args.dialect));
    let mut engine = ProgrammingEngine::new(Box::new(mock.clone()), info, config)
        .context("Invalid engine configuration")?;

    let abort = engine.abort_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let pb = if ctx.interactive() {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                .context("Invalid progress template")?
                .progress_chars("=>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut progress = engine.subscribe_progress();
    let bar = pb.clone();
    let listener = tokio::spawn(async move {
        loop {
            match progress.recv().await {
                Ok(event) => {
                    bar.set_position(u64::from(event.percent));
                    bar.set_message(event.description);
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Progress events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = run(&mut engine, args.calibration, image, options).await;

    drop(engine);
    interrupt.abort();
    let _ = listener.await;

    let report = match result {
        Ok(report) => {
            pb.finish_with_message("Complete!");
            report
        }
        Err(e) => {
            pb.abandon_with_message("Failed!");
            return Err(e);
        }
    };

    ctx.print_kv(
        &[
            ("session", report.session_id.to_string()),
            ("target", report.target.to_string()),
            ("blocks", report.blocks_written.to_string()),
            ("bytes", report.bytes_programmed.to_string()),
            ("verified", report.bytes_verified.to_string()),
            ("retries", report.retries.to_string()),
            ("elapsed", format!("{:.2?}", report.elapsed)),
            ("state", report.final_state.to_string()),
            ("ecu resets", mock.reset_count().to_string()),
        ],
        &report,
    );
    ctx.success("\nSimulated programming completed successfully");
    Ok(())
}

async fn run(
    engine: &mut ProgrammingEngine,
    calibration: bool,
    image: Vec<u8>,
    options: ProgramOptions,
) -> Result<ProgramReport> {
    if calibration {
        engine
            .initialize_session()
            .await
            .context("Session initialization failed")?;
        engine
            .program_calibration(image, Some(options))
            .await
            .context("Calibration programming failed")
    } else {
        engine
            .program_firmware(image, Some(options))
            .await
            .context("Firmware programming failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    fn args(file: PathBuf) -> SimulateArgs {
        SimulateArgs {
            file,
            dialect: DialectPreference::Auto,
            calibration: false,
            sign: true,
            block_size: Some(512),
            full_verify: true,
            inject_failures: 0,
            latency_ms: 0,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::from_toml(
            r#"
            [program]
            retry_base_delay_ms = 1
            "#,
        )
        .unwrap()
    }

    fn quiet() -> OutputContext {
        OutputContext::new(OutputFormat::Text, true, true)
    }

    #[tokio::test]
    async fn test_simulated_firmware_run() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(&file, vec![0x42; 1500]).unwrap();

        let mut args = args(file);
        args.inject_failures = 2;
        simulate(&args, config(), &quiet()).await.unwrap();
    }

    #[tokio::test]
    async fn test_simulated_calibration_run() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cal.bin");
        std::fs::write(&file, vec![0x10; 300]).unwrap();

        let mut args = args(file);
        args.calibration = true;
        args.dialect = DialectPreference::Command;
        simulate(&args, config(), &quiet()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsigned_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(&file, vec![0x42; 64]).unwrap();

        let mut args = args(file);
        args.sign = false;
        let err = simulate(&args, config(), &quiet()).await.unwrap_err();
        assert!(err.to_string().contains("Firmware programming failed"));
    }
}
