//! Simulated communication backend
//!
//! Models a bus full of byte-addressable devices in memory so the upper
//! layers can be exercised without hardware. It enforces the same contract
//! as a real transport and can be told to fail the next operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use regscope_core::format_hex_address;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::{CommunicationBackend, ConnectError, DisconnectError, IoError};

/// Location of one byte on the simulated bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterKey {
    pub slave: u16,
    pub register: u16,
}

impl RegisterKey {
    pub fn new(slave: u16, register: u16) -> Self {
        Self { slave, register }
    }

    /// Key of the byte `offset` places after this one, wrapping at the end
    /// of the register space
    pub fn offset(self, offset: usize) -> Self {
        Self {
            slave: self.slave,
            register: self.register.wrapping_add(offset as u16),
        }
    }
}

/// Failure to produce on the next matching operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Next `connect` fails with [`ConnectError::Unreachable`]
    Unreachable,
    /// Next `read` or `write` fails with [`IoError::Timeout`]
    Timeout,
    /// Next `read` returns only this many bytes
    ShortRead(usize),
    /// Next `disconnect` fails with [`DisconnectError::Transport`]
    DisconnectFailure,
}

#[derive(Debug, Default)]
struct BusState {
    memory: HashMap<RegisterKey, u8>,
    faults: VecDeque<Fault>,
    reads: u64,
    writes: u64,
    disconnects: u64,
}

impl BusState {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        self.faults.remove(index)
    }
}

/// Shared handle onto the simulated bus memory.
///
/// Clones refer to the same memory, so a test can keep a handle while the
/// backend itself is owned by a connection manager.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a byte without going through a session; unset bytes are zero
    pub fn peek(&self, slave: u16, register: u16) -> u8 {
        self.state
            .lock()
            .memory
            .get(&RegisterKey::new(slave, register))
            .copied()
            .unwrap_or(0)
    }

    /// Store a byte without going through a session
    pub fn poke(&self, slave: u16, register: u16, value: u8) {
        self.state
            .lock()
            .memory
            .insert(RegisterKey::new(slave, register), value);
    }

    /// Queue a failure for the next matching operation
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Number of completed reads
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Number of completed writes
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of sessions torn down, including failed disconnects
    pub fn disconnect_count(&self) -> u64 {
        self.state.lock().disconnects
    }
}

/// In-memory backend implementing the full communication contract
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    bus: SimulatedBus,
    device: Option<String>,
    latency: Duration,
}

impl SimulatedBackend {
    /// Create a backend with its own empty bus and no latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend attached to an existing bus
    pub fn with_bus(bus: SimulatedBus) -> Self {
        Self {
            bus,
            device: None,
            latency: Duration::ZERO,
        }
    }

    /// Delay every operation by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle onto this backend's bus memory
    pub fn bus(&self) -> SimulatedBus {
        self.bus.clone()
    }

    async fn transfer_delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl CommunicationBackend for SimulatedBackend {
    async fn connect(&mut self, device: &str) -> Result<(), ConnectError> {
        if self.device.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.transfer_delay().await;

        if self
            .bus
            .state
            .lock()
            .take_fault(|f| *f == Fault::Unreachable)
            .is_some()
        {
            return Err(ConnectError::Unreachable(device.to_string()));
        }
        if device.trim().is_empty() {
            return Err(ConnectError::Unreachable("empty device path".to_string()));
        }

        self.device = Some(device.to_string());
        debug!(device = %device, "Simulated backend connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DisconnectError> {
        if self.device.is_none() {
            return Ok(());
        }
        self.transfer_delay().await;

        // the session is gone even when the bus reports a failure
        let device = self.device.take();
        let mut state = self.bus.state.lock();
        state.disconnects += 1;
        if state
            .take_fault(|f| *f == Fault::DisconnectFailure)
            .is_some()
        {
            return Err(DisconnectError::Transport(
                "simulated disconnect failure".to_string(),
            ));
        }

        debug!(device = ?device, "Simulated backend disconnected");
        Ok(())
    }

    async fn read(
        &mut self,
        slave: u16,
        register: u16,
        length: usize,
    ) -> Result<Vec<u8>, IoError> {
        if self.device.is_none() {
            return Err(IoError::NotConnected);
        }
        self.transfer_delay().await;

        let mut state = self.bus.state.lock();
        let fault = state.take_fault(|f| matches!(f, Fault::Timeout | Fault::ShortRead(_)));
        if fault == Some(Fault::Timeout) {
            return Err(IoError::Timeout);
        }
        let count = match fault {
            Some(Fault::ShortRead(n)) => n.min(length),
            _ => length,
        };

        let start = RegisterKey::new(slave, register);
        let data: Vec<u8> = (0..count)
            .map(|i| state.memory.get(&start.offset(i)).copied().unwrap_or(0))
            .collect();
        state.reads += 1;

        debug!(
            slave = %format_hex_address(slave),
            register = %format_hex_address(register),
            data = ?data,
            "Simulated read"
        );
        Ok(data)
    }

    async fn write(&mut self, slave: u16, register: u16, data: &[u8]) -> Result<(), IoError> {
        if self.device.is_none() {
            return Err(IoError::NotConnected);
        }
        self.transfer_delay().await;

        let mut state = self.bus.state.lock();
        if state.take_fault(|f| *f == Fault::Timeout).is_some() {
            return Err(IoError::Timeout);
        }

        let start = RegisterKey::new(slave, register);
        for (i, &byte) in data.iter().enumerate() {
            state.memory.insert(start.offset(i), byte);
        }
        state.writes += 1;

        debug!(
            slave = %format_hex_address(slave),
            register = %format_hex_address(register),
            data = ?data,
            "Simulated write"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn device_info(&self) -> String {
        self.device.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> SimulatedBackend {
        let mut backend = SimulatedBackend::new();
        backend.connect("/dev/i2c-1").await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_read_unwritten_returns_zeros() {
        let mut backend = connected().await;
        let data = backend.read(0x50, 0x07, 3).await.unwrap();
        assert_eq!(data, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut backend = connected().await;
        backend.write(0x50, 0x10, &[1, 2, 3]).await.unwrap();

        assert_eq!(backend.read(0x50, 0x10, 3).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(backend.read(0x50, 0x11, 1).await.unwrap(), vec![2]);
        // other slaves have their own memory
        assert_eq!(backend.read(0x51, 0x10, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_write_wraps_register_space() {
        let mut backend = connected().await;
        backend.write(0x50, 0xFFFF, &[0xAA, 0xBB]).await.unwrap();
        let bus = backend.bus();
        assert_eq!(bus.peek(0x50, 0xFFFF), 0xAA);
        assert_eq!(bus.peek(0x50, 0x0000), 0xBB);
    }

    #[tokio::test]
    async fn test_io_requires_connection() {
        let mut backend = SimulatedBackend::new();
        assert_eq!(
            backend.read(0x50, 0, 1).await,
            Err(IoError::NotConnected)
        );
        assert_eq!(
            backend.write(0x50, 0, &[1]).await,
            Err(IoError::NotConnected)
        );
        assert_eq!(backend.bus().write_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let mut backend = SimulatedBackend::new();
        assert!(!backend.is_connected());
        assert_eq!(backend.device_info(), "");

        backend.connect("/dev/ttyUSB0").await.unwrap();
        assert!(backend.is_connected());
        assert_eq!(backend.device_info(), "/dev/ttyUSB0");
        assert_eq!(
            backend.connect("/dev/ttyUSB0").await,
            Err(ConnectError::AlreadyConnected)
        );

        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
        assert_eq!(backend.device_info(), "");

        // disconnecting again is a no-op
        backend.disconnect().await.unwrap();
        assert_eq!(backend.device_info(), "");
    }

    #[tokio::test]
    async fn test_memory_survives_reconnect() {
        let mut backend = connected().await;
        backend.write(0x20, 0x01, &[0x42]).await.unwrap();
        backend.disconnect().await.unwrap();
        backend.connect("/dev/i2c-1").await.unwrap();
        assert_eq!(backend.read(0x20, 0x01, 1).await.unwrap(), vec![0x42]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let mut backend = SimulatedBackend::new();
        let bus = backend.bus();

        bus.fail_next(Fault::Unreachable);
        assert!(matches!(
            backend.connect("/dev/i2c-1").await,
            Err(ConnectError::Unreachable(_))
        ));
        assert!(!backend.is_connected());
        backend.connect("/dev/i2c-1").await.unwrap();

        bus.fail_next(Fault::Timeout);
        assert_eq!(backend.write(0x50, 0, &[9]).await, Err(IoError::Timeout));
        assert_eq!(bus.peek(0x50, 0), 0);

        bus.fail_next(Fault::ShortRead(1));
        assert_eq!(backend.read(0x50, 0, 4).await.unwrap().len(), 1);
        assert_eq!(backend.read(0x50, 0, 4).await.unwrap().len(), 4);

        bus.fail_next(Fault::DisconnectFailure);
        assert!(backend.disconnect().await.is_err());
        assert!(!backend.is_connected());
        assert_eq!(bus.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_path() {
        let mut backend = SimulatedBackend::new();
        assert!(matches!(
            backend.connect("  ").await,
            Err(ConnectError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_latency() {
        let mut backend = SimulatedBackend::new().with_latency(Duration::from_millis(20));
        let started = std::time::Instant::now();
        backend.connect("/dev/i2c-1").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
