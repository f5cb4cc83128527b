//! regscope Core - Register map model, bit-field codec, and value cache
//!
//! This crate provides the transport-independent building blocks of regscope:
//! - Register map documents with a closed set of register kinds
//! - Pure bit-field functions for packing logical values into byte registers
//! - A timestamped cache of observed register values

pub mod bitfield;
pub mod cache;
pub mod register;

pub use bitfield::{extract_bits, extract_bits_width, field_mask, get_bit, pack_bits, set_bit};
pub use cache::{RegisterValue, ValueCache};
pub use register::{
    format_hex_address, parse_hex_address, BitFieldEntry, ControlMode, EnumOption,
    IndicatorFormat, MapError, RegisterDefinition, RegisterKind, RegisterMap,
    DEFAULT_SLAVE_ADDRESS, REGISTER_WIDTH_BITS,
};
