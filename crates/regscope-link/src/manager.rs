//! Connection manager
//!
//! Owns at most one active backend and tracks the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! `Connecting` and `Disconnecting` only mark a transition in flight. A
//! second connect or disconnect during a transition is rejected instead of
//! racing, and a transition whose future is dropped falls back to
//! `Disconnected`. A backend left in place by an abandoned disconnect is
//! closed by the next connect. Register transfers are serialized through a single async
//! mutex around the backend.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{
    CommunicationBackend, ConnectError, DeviceConfig, DisconnectError, IoError,
};

/// Connection state of a manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "device", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected to the named device
    Connected(String),
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Returns `true` while a connect or disconnect is running
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected(device) => write!(f, "connected to {}", device),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Any failure reported through the manager
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "error", rename_all = "snake_case")]
pub enum LinkError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Disconnect(#[from] DisconnectError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Most recent failure together with when it happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub error: LinkError,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of the manager for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub device_info: String,
    pub device_config: Option<DeviceConfig>,
    pub last_error: Option<LastError>,
}

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    config: Option<DeviceConfig>,
    last_error: Option<LastError>,
}

impl Status {
    fn record_error(&mut self, error: impl Into<LinkError>) {
        let error = error.into();
        self.last_error = Some(LastError {
            message: error.to_string(),
            error,
            at: Utc::now(),
        });
    }
}

/// Resets a transient state to `Disconnected` unless the transition
/// completed.
struct TransitionGuard<'a> {
    status: &'a Mutex<Status>,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(status: &'a Mutex<Status>) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut status = self.status.lock();
            if status.state.is_transitional() {
                debug!(from = %status.state, "Transition abandoned, resetting to disconnected");
                status.state = ConnectionState::Disconnected;
                status.config = None;
            }
        }
    }
}

/// Owns the active backend and its connection state
#[derive(Default)]
pub struct ConnectionManager {
    status: Mutex<Status>,
    backend: tokio::sync::Mutex<Option<Box<dyn CommunicationBackend>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `backend` to the device described by `config`.
    ///
    /// On failure the manager stays `Disconnected`, the backend is dropped
    /// and the error is kept as the last error.
    pub async fn connect(
        &self,
        config: DeviceConfig,
        mut backend: Box<dyn CommunicationBackend>,
    ) -> Result<(), ConnectError> {
        {
            let mut status = self.status.lock();
            let rejected = match status.state {
                ConnectionState::Disconnected => None,
                ConnectionState::Connected(_) => Some(ConnectError::AlreadyConnected),
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    Some(ConnectError::ConnectInProgress)
                }
            };
            if let Some(err) = rejected {
                debug!(state = %status.state, "Connect rejected");
                return Err(err);
            }
            status.state = ConnectionState::Connecting;
            status.last_error = None;
        }
        let guard = TransitionGuard::new(&self.status);

        info!(
            protocol = %config.protocol,
            device = %config.device_path,
            "Connecting to device"
        );

        let mut slot = self.backend.lock().await;
        // left behind by a disconnect that was dropped while waiting for the slot
        if let Some(mut stale) = slot.take() {
            debug!(device = %stale.device_info(), "Closing abandoned backend");
            if let Err(e) = stale.disconnect().await {
                warn!(error = %e, "Abandoned backend failed to disconnect");
            }
        }
        if let Err(e) = backend.connect(&config.device_path).await {
            warn!(device = %config.device_path, error = %e, "Connection failed");
            self.status.lock().record_error(e.clone());
            return Err(e);
        }
        *slot = Some(backend);

        {
            let mut status = self.status.lock();
            status.state = ConnectionState::Connected(config.device_path.clone());
            status.config = Some(config);
        }
        guard.disarm();

        info!(device = %self.device_info(), "Connected");
        Ok(())
    }

    /// Disconnect from the current device.
    ///
    /// Always ends `Disconnected` with the backend released, even when the
    /// backend reports a failure; that failure is still returned.
    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        {
            let mut status = self.status.lock();
            match status.state {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    return Err(DisconnectError::InProgress)
                }
                ConnectionState::Connected(_) => {}
            }
            status.state = ConnectionState::Disconnecting;
            status.last_error = None;
        }
        let _guard = TransitionGuard::new(&self.status);

        info!("Disconnecting from device");

        let backend = self.backend.lock().await.take();
        let result = match backend {
            Some(mut backend) => backend.disconnect().await,
            None => Ok(()),
        };

        let mut status = self.status.lock();
        status.state = ConnectionState::Disconnected;
        status.config = None;
        if let Err(e) = &result {
            warn!(error = %e, "Backend disconnect failed, session released anyway");
            status.record_error(e.clone());
        } else {
            info!("Disconnected");
        }
        result
    }

    /// Read `length` bytes starting at `register` on `slave`
    pub async fn read_register(
        &self,
        slave: u16,
        register: u16,
        length: usize,
    ) -> Result<Vec<u8>, IoError> {
        let result = self.read_inner(slave, register, length).await;
        if let Err(e) = &result {
            self.fail_io(e);
        }
        result
    }

    async fn read_inner(
        &self,
        slave: u16,
        register: u16,
        length: usize,
    ) -> Result<Vec<u8>, IoError> {
        self.ensure_connected()?;
        let mut slot = self.backend.lock().await;
        let backend = slot.as_mut().ok_or(IoError::NotConnected)?;

        let data = backend.read(slave, register, length).await?;
        if data.len() != length {
            return Err(IoError::Truncated {
                expected: length,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Write `data` starting at `register` on `slave`
    pub async fn write_register(
        &self,
        slave: u16,
        register: u16,
        data: &[u8],
    ) -> Result<(), IoError> {
        let result = self.write_inner(slave, register, data).await;
        if let Err(e) = &result {
            self.fail_io(e);
        }
        result
    }

    async fn write_inner(&self, slave: u16, register: u16, data: &[u8]) -> Result<(), IoError> {
        self.ensure_connected()?;
        let mut slot = self.backend.lock().await;
        let backend = slot.as_mut().ok_or(IoError::NotConnected)?;
        backend.write(slave, register, data).await
    }

    fn ensure_connected(&self) -> Result<(), IoError> {
        if self.status.lock().state.is_connected() {
            Ok(())
        } else {
            Err(IoError::NotConnected)
        }
    }

    fn fail_io(&self, error: &IoError) {
        debug!(error = %error, "Register transfer failed");
        self.status.lock().record_error(error.clone());
    }

    /// Current state of the state machine
    pub fn state(&self) -> ConnectionState {
        self.status.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.lock().state.is_connected()
    }

    /// Identifier of the connected device, empty when not connected
    pub fn device_info(&self) -> String {
        match &self.status.lock().state {
            ConnectionState::Connected(device) => device.clone(),
            _ => String::new(),
        }
    }

    /// Configuration of the active connection
    pub fn device_config(&self) -> Option<DeviceConfig> {
        self.status.lock().config.clone()
    }

    /// Most recent failure, kept until the next connect/disconnect or
    /// [`clear_error`](Self::clear_error)
    pub fn last_error(&self) -> Option<LastError> {
        self.status.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.status.lock().last_error = None;
    }

    /// Snapshot of everything a display needs
    pub fn status(&self) -> ConnectionStatus {
        let status = self.status.lock();
        let device_info = match &status.state {
            ConnectionState::Connected(device) => device.clone(),
            _ => String::new(),
        };
        ConnectionStatus {
            connected: status.state.is_connected(),
            state: status.state.clone(),
            device_info,
            device_config: status.config.clone(),
            last_error: status.last_error.clone(),
        }
    }
}
