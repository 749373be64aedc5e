//! Output formatting for ecuprog (text, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable key/value lines (default)
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Progress bars and status chatter are only shown for interactive text output
    pub fn interactive(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }

    /// Print a success message (unless in quiet mode or JSON output)
    pub fn success(&self, msg: &str) {
        if self.interactive() {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode or JSON output)
    pub fn info(&self, msg: &str) {
        if self.interactive() {
            println!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print key-value pairs, or the serialized `data` in JSON mode
    pub fn print_kv<T: Serialize>(&self, pairs: &[(&str, String)], data: &T) {
        match self.format {
            OutputFormat::Text => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }
}
