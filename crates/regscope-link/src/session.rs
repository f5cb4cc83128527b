//! Register session
//!
//! A [`Session`] ties one [`ConnectionManager`] to one [`RegisterCatalog`]
//! and broadcasts what happens to them so display layers can follow along
//! without polling.

use chrono::{DateTime, Utc};
use regscope_core::{RegisterDefinition, RegisterMap};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{CommunicationBackend, ConnectError, DeviceConfig, DisconnectError};
use crate::catalog::{CatalogError, Observation, RegisterCatalog};
use crate::manager::{ConnectionManager, ConnectionStatus};

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 100;

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Connection established
    Connected { device: String },
    /// Connection closed
    Disconnected,
    /// A new register map replaced the previous one
    MapLoaded {
        name: String,
        version: String,
        registers: usize,
    },
    /// A register value was read or written
    ValueObserved(Observation),
    /// A session operation failed
    OperationFailed { operation: String, message: String },
}

/// Identifying fields of the loaded map
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSummary {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(with = "regscope_core::register::hex_address")]
    pub default_slave_address: u16,
    pub registers: usize,
}

impl From<&RegisterMap> for MapSummary {
    fn from(map: &RegisterMap) -> Self {
        Self {
            name: map.name.clone(),
            version: map.version.clone(),
            description: map.description.clone(),
            default_slave_address: map.default_slave_address,
            registers: map.registers.len(),
        }
    }
}

/// A register definition with its last observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterSnapshot {
    #[serde(flatten)]
    pub definition: RegisterDefinition,
    pub value: Option<Observation>,
}

/// Everything a display needs to render the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub connection: ConnectionStatus,
    pub map: Option<MapSummary>,
    pub registers: Vec<RegisterSnapshot>,
}

/// One connection plus one register catalog
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    connection: ConnectionManager,
    catalog: RwLock<RegisterCatalog>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a disconnected session without a register map
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            connection: ConnectionManager::new(),
            catalog: RwLock::new(RegisterCatalog::new()),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Read access to the catalog; held guards delay map loads
    pub async fn catalog(&self) -> RwLockReadGuard<'_, RegisterCatalog> {
        self.catalog.read().await
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn report<E: std::fmt::Display>(&self, operation: &str, error: &E) {
        warn!(session = %self.id, operation = operation, error = %error, "Session operation failed");
        self.emit(SessionEvent::OperationFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        });
    }

    /// Connect through `backend`
    pub async fn connect(
        &self,
        config: DeviceConfig,
        backend: Box<dyn CommunicationBackend>,
    ) -> Result<(), ConnectError> {
        let device = config.device_path.clone();
        match self.connection.connect(config, backend).await {
            Ok(()) => {
                info!(session = %self.id, device = %device, "Session connected");
                self.emit(SessionEvent::Connected { device });
                Ok(())
            }
            Err(e) => {
                self.report("connect", &e);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), DisconnectError> {
        let was_connected = self.connection.is_connected();
        let result = self.connection.disconnect().await;
        if let Err(e) = &result {
            self.report("disconnect", e);
        }
        // a failed disconnect still releases the device
        if was_connected && !self.connection.is_connected() {
            self.emit(SessionEvent::Disconnected);
        }
        result
    }

    /// Replace the register map; an invalid map leaves the old one loaded
    pub async fn load_map(&self, map: RegisterMap) -> Result<(), CatalogError> {
        let summary = MapSummary::from(&map);
        let result = self.catalog.write().await.load_map(map);
        match result {
            Ok(()) => {
                self.emit(SessionEvent::MapLoaded {
                    name: summary.name,
                    version: summary.version,
                    registers: summary.registers,
                });
                Ok(())
            }
            Err(e) => {
                let err = CatalogError::from(e);
                self.report("load_map", &err);
                Err(err)
            }
        }
    }

    fn observed(
        &self,
        operation: &str,
        result: Result<Observation, CatalogError>,
    ) -> Result<Observation, CatalogError> {
        match &result {
            Ok(observation) => self.emit(SessionEvent::ValueObserved(*observation)),
            Err(e) => self.report(operation, e),
        }
        result
    }

    /// Read a register and return the full observation
    pub async fn read_observation(
        &self,
        address: u16,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let catalog = self.catalog.read().await;
        let result = catalog
            .read_observation(&self.connection, address, slave_override)
            .await;
        self.observed("read", result)
    }

    /// Read a register and return its logical value
    pub async fn read_value(
        &self,
        address: u16,
        slave_override: Option<u16>,
    ) -> Result<u32, CatalogError> {
        Ok(self.read_observation(address, slave_override).await?.logical)
    }

    /// Write a logical value and return the resulting observation
    pub async fn write_value(
        &self,
        address: u16,
        logical: u32,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let catalog = self.catalog.read().await;
        let result = catalog
            .write_observation(&self.connection, address, logical, slave_override)
            .await;
        self.observed("write", result)
    }

    /// Set or clear one bit of a register
    pub async fn write_bit(
        &self,
        address: u16,
        bit: u8,
        value: bool,
        slave_override: Option<u16>,
    ) -> Result<Observation, CatalogError> {
        let catalog = self.catalog.read().await;
        let result = catalog
            .write_bit(&self.connection, address, bit, value, slave_override)
            .await;
        self.observed("write_bit", result)
    }

    /// Snapshot of the connection, the map, and every cached value
    pub async fn snapshot(&self) -> SessionSnapshot {
        let catalog = self.catalog.read().await;
        let registers = catalog
            .registers()
            .iter()
            .map(|definition| RegisterSnapshot {
                definition: definition.clone(),
                value: catalog.cached_observation(definition.address),
            })
            .collect();

        SessionSnapshot {
            id: self.id,
            started_at: self.started_at,
            connection: self.connection.status(),
            map: catalog.map().map(MapSummary::from),
            registers,
        }
    }

    /// Snapshot of a single register, if the loaded map defines it
    pub async fn register(&self, address: u16) -> Option<RegisterSnapshot> {
        let catalog = self.catalog.read().await;
        let definition = catalog.lookup_definition(address)?.clone();
        Some(RegisterSnapshot {
            value: catalog.cached_observation(address),
            definition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IoError, Protocol};
    use crate::simulated::{Fault, SimulatedBackend, SimulatedBus};

    const MAP: &str = r#"{
        "version": "2.1",
        "name": "Fan controller",
        "registers": [
            { "address": "0x10", "name": "SPEED", "writable": true, "type": "slider",
              "bits": [0, 1, 2, 3], "min": 0, "max": 15 },
            { "address": "0x11", "name": "FAULTS", "type": "bitfield",
              "fields": [ { "bit": 0, "name": "STALL", "writable": false } ] }
        ]
    }"#;

    fn config() -> DeviceConfig {
        DeviceConfig::new(Protocol::I2C, "/dev/i2c-1")
    }

    async fn session(bus: &SimulatedBus) -> Session {
        let session = Session::new();
        session
            .load_map(RegisterMap::from_json(MAP).unwrap())
            .await
            .unwrap();
        session
            .connect(config(), Box::new(SimulatedBackend::with_bus(bus.clone())))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_events_follow_operations() {
        let bus = SimulatedBus::new();
        let session = Session::new();
        let mut events = session.subscribe();

        session
            .load_map(RegisterMap::from_json(MAP).unwrap())
            .await
            .unwrap();
        session
            .connect(config(), Box::new(SimulatedBackend::with_bus(bus.clone())))
            .await
            .unwrap();
        session.write_value(0x10, 9, None).await.unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::MapLoaded {
                name: "Fan controller".to_string(),
                version: "2.1".to_string(),
                registers: 2,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Connected {
                device: "/dev/i2c-1".to_string()
            }
        );
        match events.recv().await.unwrap() {
            SessionEvent::ValueObserved(observation) => {
                assert_eq!(observation.value.address, 0x10);
                assert_eq!(observation.logical, 9);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let bus = SimulatedBus::new();
        let session = session(&bus).await;
        let mut events = session.subscribe();

        assert_eq!(
            session.write_value(0x11, 1, None).await,
            Err(CatalogError::NotWritable(0x11))
        );
        match events.recv().await.unwrap() {
            SessionEvent::OperationFailed { operation, .. } => assert_eq!(operation, "write"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_uses_default_slave() {
        let bus = SimulatedBus::new();
        bus.poke(0x50, 0x10, 0xF7);
        let session = session(&bus).await;

        assert_eq!(session.read_value(0x10, None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let bus = SimulatedBus::new();
        let session = session(&bus).await;
        session.write_value(0x10, 3, None).await.unwrap();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.id, session.id());
        assert!(snapshot.connection.connected);
        assert_eq!(snapshot.map.as_ref().unwrap().registers, 2);
        assert_eq!(snapshot.registers.len(), 2);
        assert_eq!(snapshot.registers[0].value.unwrap().logical, 3);
        assert!(snapshot.registers[1].value.is_none());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["map"]["defaultSlaveAddress"], "0x50");
        assert_eq!(json["registers"][0]["address"], "0x10");
        assert_eq!(json["registers"][0]["type"], "slider");
    }

    #[tokio::test]
    async fn test_invalid_map_keeps_previous() {
        let bus = SimulatedBus::new();
        let session = session(&bus).await;

        let mut map = RegisterMap::from_json(MAP).unwrap();
        map.registers[0].address = 0x11;
        assert!(matches!(
            session.load_map(map).await,
            Err(CatalogError::InvalidMap(_))
        ));
        assert!(session.register(0x10).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_reports_disconnected() {
        let bus = SimulatedBus::new();
        let session = session(&bus).await;
        let mut events = session.subscribe();

        bus.fail_next(Fault::DisconnectFailure);
        assert!(session.disconnect().await.is_err());
        assert!(!session.connection().is_connected());

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::OperationFailed { .. }
        ));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert_eq!(
            session.read_value(0x10, None).await,
            Err(CatalogError::Io(IoError::NotConnected))
        );
    }
}
