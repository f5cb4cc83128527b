//! Register catalog
//!
//! Holds the loaded register map, an address index over it, and the cache of
//! observed values. Value reads and writes go through a
//! [`ConnectionManager`]; the catalog itself never holds transport state.
//!
//! Each transfer runs under the catalog's transfer lock, from reading the
//! cached byte through recording the result, so writes to the same register
//! never pack against a stale byte and the cache follows device order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regscope_core::{
    extract_bits, field_mask, format_hex_address, pack_bits, set_bit, MapError,
    RegisterDefinition, RegisterKind, RegisterMap, RegisterValue, ValueCache,
    REGISTER_WIDTH_BITS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::IoError;
use crate::manager::ConnectionManager;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("No register map loaded")]
    MapNotLoaded,
    #[error("Unknown register address 0x{0:02X}")]
    UnknownAddress(u16),
    #[error("Register 0x{0:02X} is not writable")]
    NotWritable(u16),
    #[error("Register 0x{address:02X}: bit {bit} cannot be written")]
    InvalidBit { address: u16, bit: u8 },
    #[error("Invalid register map: {0}")]
    InvalidMap(#[from] MapError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// A completed observation with its decoded logical value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(flatten)]
    pub value: RegisterValue,
    /// Value as interpreted by the register definition
    pub logical: u32,
}

/// Decode a raw register byte into the register's logical value
pub fn decode_value(definition: &RegisterDefinition, raw: u8) -> u32 {
    match definition.kind.bit_positions() {
        Some(positions) => extract_bits(raw, &positions),
        None => u32::from(raw),
    }
}

/// Encode a logical value into the byte to write.
///
/// Registers that use a subset of bits are packed against `current` so the
/// other bits survive; bits of read-only bit-field entries also keep their
/// current value. Whole-byte registers take the low byte of `logical`.
pub fn encode_value(definition: &RegisterDefinition, current: u8, logical: u32) -> u8 {
    let Some(positions) = definition.kind.bit_positions() else {
        return (logical & 0xFF) as u8;
    };
    let packed = pack_bits(current, &positions, logical);
    let writable = field_mask(&definition.kind.writable_positions().unwrap_or_default());
    (packed & writable) | (current & !writable)
}

/// Register definitions of one map plus their observed values
#[derive(Debug, Default)]
pub struct RegisterCatalog {
    map: Option<RegisterMap>,
    index: BTreeMap<u16, usize>,
    cache: Mutex<ValueCache>,
    transfer: tokio::sync::Mutex<()>,
}

impl RegisterCatalog {
    /// Create a catalog with no map loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog and load `map` into it
    pub fn with_map(map: RegisterMap) -> Result<Self, MapError> {
        let mut catalog = Self::new();
        catalog.load_map(map)?;
        Ok(catalog)
    }

    /// Replace the loaded map and forget every cached value.
    ///
    /// An invalid map is rejected and the current one stays loaded.
    pub fn load_map(&mut self, map: RegisterMap) -> Result<(), MapError> {
        map.validate()?;

        self.index = map
            .registers
            .iter()
            .enumerate()
            .map(|(i, r)| (r.address, i))
            .collect();
        self.cache.lock().clear();

        info!(
            name = %map.name,
            version = %map.version,
            registers = map.registers.len(),
            "Register map loaded"
        );
        self.map = Some(map);
        Ok(())
    }

    /// The loaded map, if any
    pub fn map(&self) -> Option<&RegisterMap> {
        self.map.as_ref()
    }

    /// All register definitions in document order
    pub fn registers(&self) -> &[RegisterDefinition] {
        self.map.as_ref().map_or(&[], |m| m.registers.as_slice())
    }

    pub fn default_slave_address(&self) -> Option<u16> {
        self.map.as_ref().map(|m| m.default_slave_address)
    }

    /// Find the definition of the register at `address`
    pub fn lookup_definition(&self, address: u16) -> Option<&RegisterDefinition> {
        let map = self.map.as_ref()?;
        self.index.get(&address).map(|&i| &map.registers[i])
    }

    fn resolve(
        &self,
        address: u16,
        slave_override: Option<u16>,
    ) -> Result<(&RegisterDefinition, u16), CatalogError> {
        let map = self.map.as_ref().ok_or(CatalogError::MapNotLoaded)?;
        let definition = self
            .lookup_definition(address)
            .ok_or(CatalogError::UnknownAddress(address))?;
        Ok((definition, slave_override.unwrap_or(map.default_slave_address)))
    }

    /// Read a register from the device and return its logical value
    pub async fn read_value(
        &self,
        link: &ConnectionManager,
        address: u16,
        slave_override: Option<u16>,
    ) -> Result<u32, CatalogError> {
        Ok(self.read_observation(link, address, slave_override).await?.logical)
    }

    /// Like [`read_value`](Self::read_value), returning the cache entry too
    pub async fn read_observation(
        &self,
        link: &ConnectionManager,
        address: u16,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let (definition, slave) = self.resolve(address, slave_override)?;

        let _transfer = self.transfer.lock().await;
        let data = link.read_register(slave, address, 1).await?;
        let raw = *data.first().ok_or(IoError::Truncated {
            expected: 1,
            actual: 0,
        })?;

        let value = self.cache.lock().record(address, raw);
        let logical = decode_value(definition, raw);
        debug!(
            register = %definition.name,
            address = %format_hex_address(address),
            raw = raw,
            logical = logical,
            "Register read"
        );
        Ok(Observation { value, logical })
    }

    /// Encode `logical` and write it to the register
    pub async fn write_value(
        &self,
        link: &ConnectionManager,
        address: u16,
        logical: u32,
        slave_override: Option<u16>,
    ) -> Result<(), CatalogError> {
        self.write_observation(link, address, logical, slave_override)
            .await
            .map(|_| ())
    }

    /// Like [`write_value`](Self::write_value), returning the cache entry too
    pub async fn write_observation(
        &self,
        link: &ConnectionManager,
        address: u16,
        logical: u32,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let (definition, slave) = self.resolve(address, slave_override)?;
        if !definition.writable {
            return Err(CatalogError::NotWritable(address));
        }

        let _transfer = self.transfer.lock().await;
        let current = self.cached_raw(address).unwrap_or(0);
        let raw = encode_value(definition, current, logical);
        self.send(link, definition, slave, raw).await
    }

    /// Set or clear a single bit, keeping the others from the cached byte
    pub async fn write_bit(
        &self,
        link: &ConnectionManager,
        address: u16,
        bit: u8,
        value: bool,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let (definition, slave) = self.resolve(address, slave_override)?;
        if !definition.writable {
            return Err(CatalogError::NotWritable(address));
        }
        if bit >= REGISTER_WIDTH_BITS || !bit_is_writable(&definition.kind, bit) {
            return Err(CatalogError::InvalidBit { address, bit });
        }

        let _transfer = self.transfer.lock().await;
        let current = self.cached_raw(address).unwrap_or(0);
        let raw = set_bit(current, bit, value);
        self.send(link, definition, slave, raw).await
    }

    /// Write `raw` and record it; callers hold the transfer lock
    async fn send(
        &self,
        link: &ConnectionManager,
        definition: &RegisterDefinition,
        slave: u16,
        raw: u8,
    ) -> Result<Observation, CatalogError> {
        link.write_register(slave, definition.address, &[raw]).await?;

        let value = self.cache.lock().record(definition.address, raw);
        let logical = decode_value(definition, raw);
        debug!(
            register = %definition.name,
            address = %format_hex_address(definition.address),
            raw = raw,
            logical = logical,
            "Register written"
        );
        Ok(Observation { value, logical })
    }

    /// Last observed logical value of `address` and when it was observed
    pub fn cached_value(&self, address: u16) -> Option<(u32, DateTime<Utc>)> {
        self.cached_observation(address)
            .map(|o| (o.logical, o.value.observed_at))
    }

    /// Last observation of `address`, decoded
    pub fn cached_observation(&self, address: u16) -> Option<Observation> {
        let value = *self.cache.lock().get(address)?;
        let logical = match self.lookup_definition(address) {
            Some(definition) => decode_value(definition, value.raw),
            None => u32::from(value.raw),
        };
        Some(Observation { value, logical })
    }

    /// Last observed raw byte of `address`
    pub fn cached_raw(&self, address: u16) -> Option<u8> {
        self.cache.lock().raw(address)
    }

    /// Every cached observation ordered by address
    pub fn values(&self) -> Vec<RegisterValue> {
        self.cache.lock().values().copied().collect()
    }
}

fn bit_is_writable(kind: &RegisterKind, bit: u8) -> bool {
    match kind {
        RegisterKind::BitField { fields } => fields.iter().any(|f| f.bit == bit && f.writable),
        RegisterKind::RawByte
        | RegisterKind::ReadOnlyIndicator { .. }
        | RegisterKind::RangeSlider { .. }
        | RegisterKind::EnumSelect { .. }
        | RegisterKind::CompactControl { .. } => true,
    }
}
