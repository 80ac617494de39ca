//! In-memory Modbus device.
//!
//! [`SimulatedDevice`] implements [`Transport`] against a shared register
//! image. Clones share the image, so a test can keep one handle to seed
//! values and inject faults while a session owns another. Every transport
//! call is recorded as a [`SimEvent`].

use crate::register_map::{RegisterKind, RegisterMap};
use crate::transport::{Transport, TransportError};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A transport call seen by the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Connect,
    Select(u8),
    Read {
        slave: u8,
        kind: RegisterKind,
        address: u16,
    },
    Disconnect,
}

type Point = (u8, RegisterKind, u16);

#[derive(Debug, Default)]
struct DeviceImage {
    values: HashMap<Point, u16>,
    faults: HashSet<Point>,
    stalls: HashSet<Point>,
    refuse_connect: bool,
    broken_pipe: bool,
    events: Vec<SimEvent>,
}

/// Simulated device answering from an in-memory register image.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    image: Arc<Mutex<DeviceImage>>,
    slave: u8,
    open: bool,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            image: Arc::new(Mutex::new(DeviceImage::default())),
            slave: 1,
            open: false,
        }
    }

    fn image(&self) -> MutexGuard<'_, DeviceImage> {
        self.image.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed one point of the image.
    pub fn set_value(&self, slave: u8, kind: RegisterKind, address: u16, value: u16) {
        self.image().values.insert((slave, kind, address), value);
    }

    pub fn set_coil(&self, slave: u8, address: u16, value: bool) {
        self.set_value(slave, RegisterKind::Coil, address, u16::from(value));
    }

    pub fn set_discrete_input(&self, slave: u8, address: u16, value: bool) {
        self.set_value(slave, RegisterKind::DiscreteInput, address, u16::from(value));
    }

    pub fn set_holding_register(&self, slave: u8, address: u16, value: u16) {
        self.set_value(slave, RegisterKind::HoldingRegister, address, value);
    }

    pub fn set_input_register(&self, slave: u8, address: u16, value: u16) {
        self.set_value(slave, RegisterKind::InputRegister, address, value);
    }

    /// Give every item of `map` a value: its address for registers, the
    /// address parity for bits.
    pub fn populate(&self, map: &RegisterMap, default_slave: u8) {
        let mut image = self.image();
        for item in map.items() {
            let slave = item.slave().unwrap_or(default_slave);
            let value = if item.kind().is_bit() {
                item.address() % 2
            } else {
                item.address()
            };
            image
                .values
                .insert((slave, item.kind(), item.address()), value);
        }
    }

    /// Make reads of one point fail with a device exception.
    pub fn fail_point(&self, slave: u8, kind: RegisterKind, address: u16) {
        self.image().faults.insert((slave, kind, address));
    }

    /// Make reads of one point time out. Like a real link, the handle that
    /// saw the timeout drops its connection.
    pub fn stall_point(&self, slave: u8, kind: RegisterKind, address: u16) {
        self.image().stalls.insert((slave, kind, address));
    }

    /// Refuse (or accept again) connection attempts.
    pub fn refuse_connections(&self, refuse: bool) {
        self.image().refuse_connect = refuse;
    }

    /// Fail (or stop failing) every read with a broken pipe.
    pub fn break_pipe(&self, broken: bool) {
        self.image().broken_pipe = broken;
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.image().events.clone()
    }

    pub fn clear_events(&self) {
        self.image().events.clear();
    }

    /// Points read so far, in order.
    pub fn reads(&self) -> Vec<Point> {
        self.image()
            .events
            .iter()
            .filter_map(|event| match *event {
                SimEvent::Read {
                    slave,
                    kind,
                    address,
                } => Some((slave, kind, address)),
                _ => None,
            })
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.image()
            .events
            .iter()
            .filter(|event| matches!(event, SimEvent::Connect))
            .count()
    }

    fn read(&mut self, kind: RegisterKind, address: u16) -> Result<u16, TransportError> {
        let result = self.answer(kind, address);
        if matches!(&result, Err(e) if e.poisons_link()) {
            self.open = false;
        }
        result
    }

    fn answer(&self, kind: RegisterKind, address: u16) -> Result<u16, TransportError> {
        let slave = self.slave;
        let mut image = self.image();
        image.events.push(SimEvent::Read {
            slave,
            kind,
            address,
        });

        if !self.open {
            return Err(TransportError::NotConnected);
        }
        if image.broken_pipe {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        if image.stalls.contains(&(slave, kind, address)) {
            return Err(TransportError::Timeout(Duration::from_millis(1)));
        }
        if image.faults.contains(&(slave, kind, address)) {
            return Err(TransportError::Exception("ServerDeviceFailure".to_string()));
        }
        image
            .values
            .get(&(slave, kind, address))
            .copied()
            .ok_or_else(|| TransportError::Exception("IllegalDataAddress".to_string()))
    }
}

impl Transport for SimulatedDevice {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let refused = {
            let mut image = self.image();
            image.events.push(SimEvent::Connect);
            image.refuse_connect
        };

        if refused {
            self.open = false;
            return Err(TransportError::Connection(
                "Connection refused by simulated device".to_string(),
            ));
        }
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn select_slave(&mut self, slave: u8) {
        self.slave = slave;
        self.image().events.push(SimEvent::Select(slave));
    }

    async fn read_coil(&mut self, address: u16) -> Result<bool, TransportError> {
        self.read(RegisterKind::Coil, address).map(|v| v != 0)
    }

    async fn read_discrete_input(&mut self, address: u16) -> Result<bool, TransportError> {
        self.read(RegisterKind::DiscreteInput, address)
            .map(|v| v != 0)
    }

    async fn read_holding_register(&mut self, address: u16) -> Result<u16, TransportError> {
        self.read(RegisterKind::HoldingRegister, address)
    }

    async fn read_input_register(&mut self, address: u16) -> Result<u16, TransportError> {
        self.read(RegisterKind::InputRegister, address)
    }

    async fn disconnect(&mut self) {
        self.open = false;
        self.image().events.push(SimEvent::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_follow_selected_slave() {
        let device = SimulatedDevice::new();
        device.set_holding_register(1, 0, 11);
        device.set_holding_register(2, 0, 22);

        let mut link = device.clone();
        link.connect().await.unwrap();
        link.select_slave(2);
        assert_eq!(link.read_holding_register(0).await.unwrap(), 22);
        link.select_slave(1);
        assert_eq!(link.read_holding_register(0).await.unwrap(), 11);

        assert_eq!(
            device.reads(),
            vec![
                (2, RegisterKind::HoldingRegister, 0),
                (1, RegisterKind::HoldingRegister, 0)
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let device = SimulatedDevice::new();
        device.set_coil(1, 3, true);
        device.fail_point(1, RegisterKind::Coil, 3);

        let mut link = device.clone();
        link.select_slave(1);
        assert!(matches!(
            link.read_coil(3).await,
            Err(TransportError::NotConnected)
        ));

        link.connect().await.unwrap();
        assert!(matches!(
            link.read_coil(3).await,
            Err(TransportError::Exception(_))
        ));
        assert!(matches!(
            link.read_input_register(9).await,
            Err(TransportError::Exception(_))
        ));

        device.stall_point(1, RegisterKind::Coil, 4);
        assert!(matches!(
            link.read_coil(4).await,
            Err(TransportError::Timeout(_))
        ));
        assert!(!link.is_open());
        assert!(link.read_coil(3).await.unwrap_err().is_broken_pipe());

        link.connect().await.unwrap();
        device.break_pipe(true);
        assert!(link.read_coil(3).await.unwrap_err().is_broken_pipe());

        device.refuse_connections(true);
        assert!(link.connect().await.is_err());
        assert!(!link.is_open());
        assert_eq!(device.connect_attempts(), 3);
    }

    #[test]
    fn test_populate_from_map() {
        let mut map = RegisterMap::new();
        map.add_legacy_coil("run", 5);
        map.add_input_register(4, "speed", 12, 1.0, 0.0);

        let device = SimulatedDevice::new();
        device.populate(&map, 1);

        let image = device.image();
        assert_eq!(image.values.get(&(1, RegisterKind::Coil, 5)), Some(&1));
        assert_eq!(
            image.values.get(&(4, RegisterKind::InputRegister, 12)),
            Some(&12)
        );
    }
}
