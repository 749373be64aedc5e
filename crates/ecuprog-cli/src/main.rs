//! ecuprog - ECU image tooling and simulated programming
//!
//! Checksum and coding commands work on plain files and strings and need no
//! ECU. `simulate` runs a complete programming session against the built-in
//! ECU model, which is handy for checking an image and a configuration before
//! touching hardware.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ecuprog_core::checksum::ChecksumAlgorithm;
use ecuprog_core::protocol::DialectPreference;
use ecuprog_core::EngineConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::SimulateArgs;
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "ecuprog")]
#[command(author, version, about = "ECU programming and checksum tool")]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "ECUPROG_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute checksums of a file
    Checksum {
        /// Input file
        file: PathBuf,

        /// Algorithm (sum8, sum16, crc8, crc16-ccitt, crc32, xor); all when omitted
        #[arg(short, long)]
        algorithm: Option<ChecksumAlgorithm>,
    },

    /// Check the checksum trailer at the end of an image
    Verify {
        /// Signed image
        file: PathBuf,

        #[arg(short, long, default_value = "crc32")]
        algorithm: ChecksumAlgorithm,
    },

    /// Append a checksum trailer to an image
    Sign {
        /// Unsigned image
        input: PathBuf,

        /// Where to write the signed image
        output: PathBuf,

        #[arg(short, long, default_value = "crc32")]
        algorithm: ChecksumAlgorithm,
    },

    /// Read or change a bit field in a coding string
    Coding {
        /// Coding bytes as hex, whitespace allowed
        coding: String,

        /// Byte index
        #[arg(short, long)]
        byte: usize,

        /// Lowest bit of the field (0 = LSB)
        #[arg(short, long, default_value_t = 0)]
        shift: u8,

        /// Field width in bits
        #[arg(short, long, default_value_t = 1)]
        width: u8,

        /// New field value
        #[arg(long)]
        set: Option<u8>,
    },

    /// Program an image into the simulated ECU
    Simulate {
        /// Image file
        file: PathBuf,

        /// Command dialect
        #[arg(short, long, value_enum, default_value = "auto")]
        dialect: DialectArg,

        /// Program calibration data into EEPROM instead of firmware into flash
        #[arg(long)]
        calibration: bool,

        /// Append the ECU's layout checksum before programming
        #[arg(long)]
        sign: bool,

        /// Override the configured block size
        #[arg(long)]
        block_size: Option<u32>,

        /// Read back the whole image instead of the configured prefix
        #[arg(long)]
        full_verify: bool,

        /// Reject the first block write this many times
        #[arg(long, default_value_t = 0)]
        inject_failures: u32,

        /// Simulated response latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
}

/// Dialect choice on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DialectArg {
    Auto,
    Command,
    Uds,
    Kwp2000,
}

impl From<DialectArg> for DialectPreference {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Auto => DialectPreference::Auto,
            DialectArg::Command => DialectPreference::Command,
            DialectArg::Uds => DialectPreference::Uds,
            DialectArg::Kwp2000 => DialectPreference::Kwp2000,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over the verbosity flag
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    if let Err(e) = execute(&cli, &ctx).await {
        ctx.error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
}

async fn execute(cli: &Cli, ctx: &OutputContext) -> Result<()> {
    match &cli.command {
        Commands::Checksum { file, algorithm } => {
            commands::checksum(file, *algorithm, ctx)?;
        }

        Commands::Verify { file, algorithm } => {
            commands::verify(file, *algorithm, ctx)?;
        }

        Commands::Sign {
            input,
            output,
            algorithm,
        } => {
            commands::sign(input, output, *algorithm, ctx)?;
        }

        Commands::Coding {
            coding,
            byte,
            shift,
            width,
            set,
        } => {
            let field = commands::FieldSpec {
                byte: *byte,
                shift: *shift,
                width: *width,
            };
            commands::coding(coding, field, *set, ctx)?;
        }

        Commands::Simulate {
            file,
            dialect,
            calibration,
            sign,
            block_size,
            full_verify,
            inject_failures,
            latency_ms,
        } => {
            let config = load_config(cli.config.as_ref())?;
            if config.security.secret.is_none() {
                ctx.warn("No security secret configured, using the simulator default");
            }
            let args = SimulateArgs {
                file: file.clone(),
                dialect: (*dialect).into(),
                calibration: *calibration,
                sign: *sign,
                block_size: *block_size,
                full_verify: *full_verify,
                inject_failures: *inject_failures,
                latency_ms: *latency_ms,
            };
            commands::simulate(&args, config, ctx).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::try_parse_from([
            "ecuprog",
            "-q",
            "simulate",
            "app.bin",
            "--dialect",
            "kwp2000",
            "--sign",
            "--inject-failures",
            "2",
        ])
        .unwrap();

        assert!(cli.quiet);
        match cli.command {
            Commands::Simulate {
                dialect,
                sign,
                inject_failures,
                ..
            } => {
                assert_eq!(DialectPreference::from(dialect), DialectPreference::Kwp2000);
                assert!(sign);
                assert_eq!(inject_failures, 2);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_parse_coding() {
        let cli = Cli::try_parse_from([
            "ecuprog", "coding", "00 A5 FF", "-b", "2", "-s", "2", "-w", "3", "--set", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Coding {
                coding,
                byte,
                shift,
                width,
                set,
            } => {
                assert_eq!(coding, "00 A5 FF");
                assert_eq!((byte, shift, width, set), (2, 2, 3, Some(2)));
            }
            _ => panic!("expected coding"),
        }
    }

    #[test]
    fn test_parse_algorithm_names() {
        let cli = Cli::try_parse_from(["ecuprog", "sign", "a.bin", "b.bin", "-a", "crc16-ccitt"])
            .unwrap();
        match cli.command {
            Commands::Sign { algorithm, .. } => {
                assert_eq!(algorithm, ChecksumAlgorithm::Crc16Ccitt)
            }
            _ => panic!("expected sign"),
        }
        assert!(Cli::try_parse_from(["ecuprog", "checksum", "a.bin", "-a", "md5"]).is_err());
    }
}
