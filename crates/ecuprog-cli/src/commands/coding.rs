//! Coding command - read or change a bit field in a coding string

use anyhow::{Context, Result};
use ecuprog_core::CodingBytes;
use serde::Serialize;

use crate::output::OutputContext;

/// Bit field selected on the command line
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub byte: usize,
    pub shift: u8,
    pub width: u8,
}

#[derive(Debug, Serialize)]
struct CodingReport {
    coding: String,
    byte: usize,
    shift: u8,
    width: u8,
    value: u8,
}

/// Print the field value; with `set`, write it first and print the new coding
pub fn coding(
    coding: &str,
    field: FieldSpec,
    set: Option<u8>,
    ctx: &OutputContext,
) -> Result<String> {
    let mut bytes: CodingBytes = coding.parse().context("Invalid coding string")?;

    if let Some(value) = set {
        bytes
            .set_field(field.byte, field.shift, field.width, value)
            .context("Failed to update coding")?;
    }
    let value = bytes
        .field(field.byte, field.shift, field.width)
        .context("Failed to read coding")?;

    let report = CodingReport {
        coding: bytes.to_hex(),
        byte: field.byte,
        shift: field.shift,
        width: field.width,
        value,
    };
    ctx.print_kv(
        &[
            ("coding", report.coding.clone()),
            (
                "field",
                format!("byte {} bits {}..{}", field.byte, field.shift, field.shift + field.width),
            ),
            ("value", format!("0x{:02X} ({})", value, value)),
        ],
        &report,
    );
    Ok(report.coding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    fn quiet() -> OutputContext {
        OutputContext::new(OutputFormat::Text, true, true)
    }

    #[test]
    fn test_set_field_rewrites_coding() {
        let field = FieldSpec {
            byte: 2,
            shift: 2,
            width: 3,
        };
        let updated = coding("00 A5 FF", field, Some(0b010), &quiet()).unwrap();
        assert_eq!(updated, "00A5EB");
    }

    #[test]
    fn test_read_leaves_coding_unchanged() {
        let field = FieldSpec {
            byte: 1,
            shift: 4,
            width: 4,
        };
        assert_eq!(coding("00a5", field, None, &quiet()).unwrap(), "00A5");
    }

    #[test]
    fn test_out_of_range_byte_fails() {
        let field = FieldSpec {
            byte: 4,
            shift: 0,
            width: 1,
        };
        let err = coding("00A5", field, None, &quiet()).unwrap_err();
        assert!(err.to_string().contains("Failed to read coding"));
        assert!(coding("0G", field, None, &quiet()).is_err());
    }
}
