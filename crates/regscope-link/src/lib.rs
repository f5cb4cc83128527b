//! regscope Link - Device communication for register sessions
//!
//! This crate connects the register model from `regscope-core` to devices:
//! - The transport-agnostic [`CommunicationBackend`] contract and an
//!   in-memory [`SimulatedBackend`]
//! - A [`ConnectionManager`] owning the active backend and its state machine
//! - The [`RegisterCatalog`] that reads, writes and caches register values
//! - A [`Session`] bundling both and broadcasting [`SessionEvent`]s

pub mod backend;
pub mod catalog;
pub mod manager;
pub mod session;
pub mod simulated;

pub use backend::{
    CommunicationBackend, ConnectError, DeviceConfig, DisconnectError, IoError, Protocol,
};
pub use catalog::{decode_value, encode_value, CatalogError, Observation, RegisterCatalog};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStatus, LastError, LinkError};
pub use session::{MapSummary, RegisterSnapshot, Session, SessionEvent, SessionSnapshot};
pub use simulated::{Fault, RegisterKey, SimulatedBackend, SimulatedBus};
