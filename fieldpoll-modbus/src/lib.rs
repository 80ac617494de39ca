//! Modbus south plugin.
//!
//! Polls one Modbus device (TCP or RTU/serial) and turns its register map
//! into one [`Measurement`](fieldpoll_common::Measurement) per poll cycle.
//!
//! # Read order
//!
//! ```text
//! default slave: legacy coils, inputs, registers, input registers
//! coil groups             by ascending slave
//! discrete input groups   by ascending slave
//! holding register groups by ascending slave
//! input register groups   by ascending slave
//! ```
//!
//! Legacy items and coils are reported as raw integers. Every other
//! per-slave item is reported as `offset + raw * scale`.

pub mod config;
pub mod poller;
pub mod register_map;
pub mod session;
pub mod simulator;
pub mod transport;

pub use config::{ConfigError, ModbusPluginConfig};
pub use poller::{LinkState, ModbusPoller};
pub use register_map::{RegisterItem, RegisterKind, RegisterMap};
pub use session::{ModbusSession, SessionError};
pub use simulator::SimulatedDevice;
pub use transport::{ModbusTransport, Transport, TransportError};
