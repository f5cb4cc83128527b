//! Register map model and validation
//!
//! A register map is a declarative description of the registers exposed by a
//! device: where they live, whether they can be written, and how the bits of
//! each byte-wide register should be interpreted. Maps are parsed by an
//! external loader (usually from JSON) and validated before use.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use thiserror::Error;

/// Width of a single hardware register in bits
pub const REGISTER_WIDTH_BITS: u8 = 8;

/// Slave address used when a document does not specify one
pub const DEFAULT_SLAVE_ADDRESS: u16 = 0x50;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("Duplicate register address 0x{0:02X}")]
    DuplicateAddress(u16),
    #[error("Register 0x{address:02X}: bit {bit} is outside 0..{width}", width = REGISTER_WIDTH_BITS)]
    BitOutOfRange { address: u16, bit: u8 },
    #[error("Register 0x{address:02X}: bit {bit} is referenced more than once")]
    DuplicateBit { address: u16, bit: u8 },
    #[error("Register 0x{address:02X}: min {min} is greater than max {max}")]
    InvalidRange { address: u16, min: f64, max: f64 },
}

/// Display format hint for indicator registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorFormat {
    Binary,
    Hex,
    Decimal,
}

/// Presentation mode hint for compact control registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Debug,
    Compact,
}

/// One selectable option of an enum register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumOption {
    /// Raw logical value written for this option
    pub value: u32,
    /// Display label
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single named bit of a bit-field register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitFieldEntry {
    /// Hardware bit position within the register
    pub bit: u8,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether this bit may be changed by a write
    #[serde(default = "default_true")]
    pub writable: bool,
}

fn default_true() -> bool {
    true
}

/// Kind-specific interpretation of a register
///
/// The document tag (`type`) uses the short names of the register map
/// format: `byte`, `indicator`, `slider`, `combobox`, `bitfield`, `control`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RegisterKind {
    /// Whole byte, edited bit by bit
    #[serde(rename = "byte")]
    RawByte,
    /// Read-only display of the whole byte
    #[serde(rename = "indicator")]
    ReadOnlyIndicator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<IndicatorFormat>,
    },
    /// Numeric range packed into a subset of bits
    #[serde(rename = "slider")]
    RangeSlider {
        /// Hardware bit positions, logical LSB first
        bits: Vec<u8>,
        min: f64,
        max: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        /// Opaque value-transform expression, never evaluated here
        #[serde(default, skip_serializing_if = "Option::is_none")]
        formula: Option<String>,
    },
    /// Selection among labelled values
    #[serde(rename = "combobox")]
    EnumSelect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bits: Option<Vec<u8>>,
        options: Vec<EnumOption>,
    },
    /// Individually named bits
    #[serde(rename = "bitfield")]
    BitField { fields: Vec<BitFieldEntry> },
    /// Compact presentation of the whole byte
    #[serde(rename = "control")]
    CompactControl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<ControlMode>,
    },
}

impl RegisterKind {
    /// Short document name of this kind
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RawByte => "byte",
            Self::ReadOnlyIndicator { .. } => "indicator",
            Self::RangeSlider { .. } => "slider",
            Self::EnumSelect { .. } => "combobox",
            Self::BitField { .. } => "bitfield",
            Self::CompactControl { .. } => "control",
        }
    }

    /// Hardware bit positions that make up the logical value, LSB first.
    ///
    /// `None` means the logical value is the whole raw byte.
    pub fn bit_positions(&self) -> Option<Vec<u8>> {
        match self {
            Self::RawByte | Self::ReadOnlyIndicator { .. } | Self::CompactControl { .. } => None,
            Self::RangeSlider { bits, .. } => Some(bits.clone()),
            Self::EnumSelect { bits, .. } => bits.clone(),
            Self::BitField { fields } => Some(fields.iter().map(|f| f.bit).collect()),
        }
    }

    /// Hardware bit positions a write is allowed to change.
    ///
    /// Only bit-field registers restrict this further than
    /// [`bit_positions`](Self::bit_positions): bits of read-only fields keep
    /// their current value.
    pub fn writable_positions(&self) -> Option<Vec<u8>> {
        match self {
            Self::BitField { fields } => Some(
                fields
                    .iter()
                    .filter(|f| f.writable)
                    .map(|f| f.bit)
                    .collect(),
            ),
            Self::RawByte
            | Self::ReadOnlyIndicator { .. }
            | Self::RangeSlider { .. }
            | Self::EnumSelect { .. }
            | Self::CompactControl { .. } => self.bit_positions(),
        }
    }
}

/// A single register definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    /// Register address on the device
    #[serde(with = "hex_address")]
    pub address: u16,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the register accepts writes
    #[serde(default)]
    pub writable: bool,
    #[serde(flatten)]
    pub kind: RegisterKind,
}

impl RegisterDefinition {
    /// Check the per-register bit invariants
    pub fn validate(&self) -> Result<(), MapError> {
        match &self.kind {
            RegisterKind::RawByte
            | RegisterKind::ReadOnlyIndicator { .. }
            | RegisterKind::CompactControl { .. } => Ok(()),
            RegisterKind::RangeSlider { bits, min, max, .. } => {
                check_bits(self.address, bits)?;
                if min > max {
                    return Err(MapError::InvalidRange {
                        address: self.address,
                        min: *min,
                        max: *max,
                    });
                }
                Ok(())
            }
            RegisterKind::EnumSelect { bits, .. } => match bits {
                Some(bits) => check_bits(self.address, bits),
                None => Ok(()),
            },
            RegisterKind::BitField { fields } => {
                let bits: Vec<u8> = fields.iter().map(|f| f.bit).collect();
                check_bits(self.address, &bits)
            }
        }
    }
}

fn check_bits(address: u16, bits: &[u8]) -> Result<(), MapError> {
    let mut seen = HashSet::new();
    for &bit in bits {
        if bit >= REGISTER_WIDTH_BITS {
            return Err(MapError::BitOutOfRange { address, bit });
        }
        if !seen.insert(bit) {
            return Err(MapError::DuplicateBit { address, bit });
        }
    }
    Ok(())
}

/// A named, versioned register map document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMap {
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Bus address used when a request does not override it
    #[serde(with = "hex_address", default = "default_slave_address")]
    pub default_slave_address: u16,
    #[serde(default)]
    pub registers: Vec<RegisterDefinition>,
}

fn default_slave_address() -> u16 {
    DEFAULT_SLAVE_ADDRESS
}

impl RegisterMap {
    /// Parse a map from a JSON document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the map back to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check address uniqueness and every register's bit invariants
    pub fn validate(&self) -> Result<(), MapError> {
        let mut addresses = HashSet::new();
        for register in &self.registers {
            if !addresses.insert(register.address) {
                return Err(MapError::DuplicateAddress(register.address));
            }
            register.validate()?;
        }
        Ok(())
    }
}

/// Parse a hex address such as `0x12`, `0X12` or `12`
pub fn parse_hex_address(s: &str) -> Option<u16> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

/// Format an address the way register map documents write it
pub fn format_hex_address(address: u16) -> String {
    format!("0x{:02X}", address)
}

/// Serde adapter for addresses written as hex strings (or plain integers)
pub mod hex_address {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u16),
    }

    pub fn serialize<S: Serializer>(address: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_hex_address(*address))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => parse_hex_address(&s).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid hex address: {:?}", s))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "1.0",
        "name": "PMIC",
        "defaultSlaveAddress": "0x48",
        "registers": [
            { "address": "0x00", "name": "ID", "writable": false, "type": "indicator", "format": "hex" },
            { "address": "0x01", "name": "CTRL", "writable": true, "type": "byte" },
            { "address": "0x02", "name": "VOUT", "writable": true, "type": "slider",
              "bits": [0, 1, 2, 3], "min": 0.8, "max": 3.3, "step": 0.1, "unit": "V",
              "formula": "0.8 + value * 0.1" },
            { "address": "0x03", "name": "MODE", "writable": true, "type": "combobox",
              "bits": [4, 5], "options": [
                { "value": 0, "label": "Off" },
                { "value": 1, "label": "Eco", "description": "Low power" }
              ] },
            { "address": "0x12", "name": "STATUS", "writable": true, "type": "bitfield",
              "fields": [
                { "bit": 0, "name": "EN", "writable": true },
                { "bit": 2, "name": "FAULT", "writable": false },
                { "bit": 5, "name": "PG" }
              ] },
            { "address": "0x20", "name": "DBG", "writable": true, "type": "control", "mode": "compact" }
        ]
    }"#;

    #[test]
    fn test_parse_register_map() {
        let map = RegisterMap::from_json(SAMPLE).unwrap();
        assert_eq!(map.name, "PMIC");
        assert_eq!(map.default_slave_address, 0x48);
        assert_eq!(map.registers.len(), 6);
        assert!(map.validate().is_ok());

        let status = &map.registers[4];
        assert_eq!(status.address, 0x12);
        assert_eq!(status.kind.type_name(), "bitfield");
        assert_eq!(status.kind.bit_positions(), Some(vec![0, 2, 5]));
        assert_eq!(status.kind.writable_positions(), Some(vec![0, 5]));

        match &map.registers[2].kind {
            RegisterKind::RangeSlider { bits, unit, formula, .. } => {
                assert_eq!(bits, &vec![0, 1, 2, 3]);
                assert_eq!(unit.as_deref(), Some("V"));
                assert_eq!(formula.as_deref(), Some("0.8 + value * 0.1"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }

        assert_eq!(map.registers[1].kind.bit_positions(), None);
        assert_eq!(
            map.registers[0].kind,
            RegisterKind::ReadOnlyIndicator {
                format: Some(IndicatorFormat::Hex)
            }
        );
    }

    #[test]
    fn test_default_slave_address() {
        let map = RegisterMap::from_json(r#"{"version": "1", "name": "empty"}"#).unwrap();
        assert_eq!(map.default_slave_address, DEFAULT_SLAVE_ADDRESS);
        assert!(map.registers.is_empty());
    }

    #[test]
    fn test_json_roundtrip_keeps_hex_addresses() {
        let map = RegisterMap::from_json(SAMPLE).unwrap();
        let json = map.to_json().unwrap();
        assert!(json.contains("\"address\": \"0x12\""));
        assert!(json.contains("\"defaultSlaveAddress\": \"0x48\""));
        assert_eq!(RegisterMap::from_json(&json).unwrap(), map);
    }

    #[test]
    fn test_parse_hex_address() {
        assert_eq!(parse_hex_address("0x12"), Some(0x12));
        assert_eq!(parse_hex_address("0XfF"), Some(0xFF));
        assert_eq!(parse_hex_address("50"), Some(0x50));
        assert_eq!(parse_hex_address("0x"), None);
        assert_eq!(parse_hex_address("zz"), None);
        assert_eq!(format_hex_address(0x7), "0x07");
    }

    #[test]
    fn test_numeric_address_accepted() {
        let json = r#"{"address": 18, "name": "R", "type": "byte"}"#;
        let register: RegisterDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(register.address, 0x12);
        assert!(!register.writable);
    }

    #[test]
    fn test_validate_duplicate_address() {
        let mut map = RegisterMap::from_json(SAMPLE).unwrap();
        let mut dup = map.registers[1].clone();
        dup.name = "CTRL2".to_string();
        map.registers.push(dup);
        assert_eq!(map.validate(), Err(MapError::DuplicateAddress(0x01)));
    }

    #[test]
    fn test_validate_bits() {
        let json = r#"{"address": "0x05", "name": "S", "type": "slider", "bits": [0, 8], "min": 0, "max": 1}"#;
        let register: RegisterDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(
            register.validate(),
            Err(MapError::BitOutOfRange { address: 5, bit: 8 })
        );

        let json = r#"{"address": "0x05", "name": "F", "type": "bitfield",
            "fields": [{"bit": 3, "name": "A"}, {"bit": 3, "name": "B"}]}"#;
        let register: RegisterDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(
            register.validate(),
            Err(MapError::DuplicateBit { address: 5, bit: 3 })
        );

        let json = r#"{"address": "0x05", "name": "S", "type": "slider", "bits": [0], "min": 5, "max": 1}"#;
        let register: RegisterDefinition = serde_json::from_str(json).unwrap();
        assert!(matches!(register.validate(), Err(MapError::InvalidRange { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"address": "0x05", "name": "X", "type": "knob"}"#;
        assert!(serde_json::from_str::<RegisterDefinition>(json).is_err());
    }
}
