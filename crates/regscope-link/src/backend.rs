//! Transport-agnostic communication contract
//!
//! A [`CommunicationBackend`] moves bytes between regscope and one device
//! transport (I2C adapter, serial bridge, SPI, ...). Backends are selected by
//! the caller and handed to the [`ConnectionManager`](crate::ConnectionManager),
//! which serializes every call, so methods take `&mut self`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectError {
    #[error("Device unreachable: {0}")]
    Unreachable(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Connection attempt already in progress")]
    ConnectInProgress,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectError {
    #[error("Disconnect failed: {0}")]
    Transport(String),
    #[error("Connection state is changing")]
    InProgress,
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum IoError {
    #[error("Not connected to device")]
    NotConnected,
    #[error("Device did not respond in time")]
    Timeout,
    #[error("Transfer truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Transport protocol named in a device configuration.
///
/// Advisory only: the caller uses it to pick a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    I2C,
    Serial,
    SPI,
    USB,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I2C => "I2C",
            Self::Serial => "Serial",
            Self::SPI => "SPI",
            Self::USB => "USB",
        };
        write!(f, "{}", s)
    }
}

/// Parameters of a connection request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub protocol: Protocol,
    /// Port name or device node, e.g. `/dev/i2c-1`
    pub device_path: String,
    /// Line speed for serial transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    /// Preferred bus address of the target device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_address: Option<u16>,
}

impl DeviceConfig {
    pub fn new(protocol: Protocol, device_path: impl Into<String>) -> Self {
        Self {
            protocol,
            device_path: device_path.into(),
            baud_rate: None,
            slave_address: None,
        }
    }
}

/// Communication contract every transport implements.
///
/// # Contract
///
/// - `read`/`write` fail with [`IoError::NotConnected`] while disconnected.
/// - A successful `read` returns exactly `length` bytes.
/// - `write` stores `data` byte by byte starting at `register`.
/// - `disconnect` on a disconnected backend succeeds without doing anything.
/// - `is_connected` and `device_info` are pure queries.
#[async_trait]
pub trait CommunicationBackend: Send + Sync {
    /// Open a session with `device`
    async fn connect(&mut self, device: &str) -> Result<(), ConnectError>;

    /// Close the current session
    async fn disconnect(&mut self) -> Result<(), DisconnectError>;

    /// Read `length` consecutive bytes starting at `register`
    async fn read(&mut self, slave: u16, register: u16, length: usize)
        -> Result<Vec<u8>, IoError>;

    /// Write `data` starting at `register`
    async fn write(&mut self, slave: u16, register: u16, data: &[u8]) -> Result<(), IoError>;

    fn is_connected(&self) -> bool;

    /// Identifier of the connected device, empty when disconnected
    fn device_info(&self) -> String;
}
