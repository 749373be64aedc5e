//! ECU identification

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Diagnostic protocol families an ECU may advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiagnosticProtocol {
    Uds,
    Kwp2000,
    Obd2,
    J1939,
}

impl fmt::Display for DiagnosticProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticProtocol::Uds => "UDS",
            DiagnosticProtocol::Kwp2000 => "KWP2000",
            DiagnosticProtocol::Obd2 => "OBD2",
            DiagnosticProtocol::J1939 => "J1939",
        };
        f.write_str(name)
    }
}

impl FromStr for DiagnosticProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace(['-', '_', ' '], "").as_str() {
            "UDS" => Ok(DiagnosticProtocol::Uds),
            "KWP2000" | "KWP" => Ok(DiagnosticProtocol::Kwp2000),
            "OBD2" | "OBDII" => Ok(DiagnosticProtocol::Obd2),
            "J1939" => Ok(DiagnosticProtocol::J1939),
            other => Err(format!("Unknown diagnostic protocol: {}", other)),
        }
    }
}

/// Identification of a discovered ECU. Read-only once populated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EcuInfo {
    pub id: String,
    pub name: String,
    /// Selects the key derivation strategy for seed/key access
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub hardware_version: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub calibration_id: String,
    #[serde(default)]
    pub protocols: Vec<DiagnosticProtocol>,
    #[serde(default)]
    pub flash_size: u32,
    #[serde(default)]
    pub eeprom_size: u32,
}

impl EcuInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = DiagnosticProtocol>) -> Self {
        self.protocols = protocols.into_iter().collect();
        self
    }

    pub fn supports(&self, protocol: DiagnosticProtocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("uds".parse(), Ok(DiagnosticProtocol::Uds));
        assert_eq!("KWP-2000".parse(), Ok(DiagnosticProtocol::Kwp2000));
        assert_eq!("obd_ii".parse(), Ok(DiagnosticProtocol::Obd2));
        assert!("can".parse::<DiagnosticProtocol>().is_err());
    }

    #[test]
    fn test_ecu_info_deserializes_from_toml() {
        let info: EcuInfo = toml::from_str(
            r#"
            id = "engine"
            name = "Engine Control Module"
            manufacturer = "acme"
            protocols = ["UDS", "OBD2"]
            flash_size = 65536
            "#,
        )
        .unwrap();

        assert!(info.supports(DiagnosticProtocol::Uds));
        assert!(!info.supports(DiagnosticProtocol::Kwp2000));
        assert_eq!(info.flash_size, 65536);
        assert_eq!(info.eeprom_size, 0);
    }
}
