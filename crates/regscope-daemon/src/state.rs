//! Application state management

use anyhow::Result;
use regscope_link::{
    CommunicationBackend, ConnectError, DeviceConfig, Session, SimulatedBackend, SimulatedBus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::map_loader::load_register_map;

/// Shared application state
pub struct AppState {
    /// Register session served by this daemon
    pub session: Arc<Session>,
    /// Configuration
    pub config: Config,
    /// Memory behind every simulated backend, kept across reconnects
    bus: SimulatedBus,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let session = Arc::new(Session::new());

        if let Some(path) = &config.register_map.path {
            let map = load_register_map(Path::new(path))?;
            session.load_map(map).await?;
        } else {
            info!("No register map configured, waiting for one over the API");
        }

        let state = Arc::new(Self {
            session,
            config,
            bus: SimulatedBus::new(),
        });

        if state.config.device.auto_connect {
            let device = state.config.to_device_config();
            if let Err(e) = state.connect(device).await {
                warn!(error = %e, "Auto-connect failed");
            }
        }

        info!(session = %state.session.id(), "Session ready");
        Ok(state)
    }

    /// Build the backend for a connection request
    fn backend_for(&self, device: &DeviceConfig) -> Result<Box<dyn CommunicationBackend>, ConnectError> {
        if !self.config.simulator.enabled {
            return Err(ConnectError::Unreachable(format!(
                "no {} transport available for {}",
                device.protocol, device.device_path
            )));
        }

        let latency = Duration::from_millis(self.config.simulator.latency_ms);
        Ok(Box::new(
            SimulatedBackend::with_bus(self.bus.clone()).with_latency(latency),
        ))
    }

    /// Connect the session to `device`
    pub async fn connect(&self, device: DeviceConfig) -> Result<(), ConnectError> {
        let backend = self.backend_for(&device)?;
        info!(
            protocol = %device.protocol,
            device = %device.device_path,
            "Connecting"
        );
        self.session.connect(device, backend).await
    }

    /// Slave address for a request: explicit, then the connection's, then
    /// the map default (applied by the catalog)
    pub fn slave_for(&self, requested: Option<u16>) -> Option<u16> {
        requested.or_else(|| {
            self.session
                .connection()
                .device_config()
                .and_then(|c| c.slave_address)
        })
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<regscope_link::SessionEvent> {
        self.session.subscribe()
    }
}
