//! Modbus polling engine.
//!
//! One [`ModbusPoller`] owns the transport and register map of one device
//! and turns each [`ModbusPoller::poll`] call into a fresh [`Measurement`].

use crate::register_map::{RegisterItem, RegisterKind, RegisterMap, SlaveSelector};
use crate::transport::{Transport, TransportError};
use fieldpoll_common::{Measurement, MeasurementBuilder};
use tracing::{debug, error, info, warn};

/// Link state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// A poller for a single Modbus device.
pub struct ModbusPoller<T: Transport> {
    transport: T,
    map: RegisterMap,
    default_slave: u8,
    asset: String,
    state: LinkState,
}

impl<T: Transport> ModbusPoller<T> {
    /// Create a poller. No connection is attempted until [`connect`] or
    /// [`poll`] is called.
    ///
    /// [`connect`]: ModbusPoller::connect
    /// [`poll`]: ModbusPoller::poll
    pub fn new(transport: T, map: RegisterMap, default_slave: u8, asset: impl Into<String>) -> Self {
        Self {
            transport,
            map,
            default_slave,
            asset: asset.into(),
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn default_slave(&self) -> u8 {
        self.default_slave
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn set_register_map(&mut self, map: RegisterMap) {
        self.map = map;
    }

    pub fn set_asset(&mut self, asset: impl Into<String>) {
        self.asset = asset.into();
    }

    pub fn set_default_slave(&mut self, slave: u8) {
        self.default_slave = slave;
    }

    /// Swap in a new transport, returning the old one. The engine starts
    /// over from [`LinkState::Disconnected`].
    pub fn replace_transport(&mut self, transport: T) -> T {
        self.state = LinkState::Disconnected;
        std::mem::replace(&mut self.transport, transport)
    }

    /// Try to open the link. Returns whether the engine is now connected.
    pub async fn connect(&mut self) -> bool {
        match self.transport.connect().await {
            Ok(()) => {
                self.state = LinkState::Connected;
                true
            }
            Err(e) => {
                debug!(asset = %self.asset, "Connect attempt failed: {}", e);
                self.state = LinkState::Disconnected;
                false
            }
        }
    }

    /// Close the link.
    pub async fn disconnect(&mut self) {
        self.transport.disconnect().await;
        self.state = LinkState::Disconnected;
    }

    /// Perform a single poll cycle.
    ///
    /// When disconnected, or when the transport has dropped its link after a
    /// failed read, one reconnect is attempted first; if it fails the
    /// result is [`Measurement::failed`]. Otherwise every item of the map is
    /// read once, in [`RegisterMap::read_plan`] order, and items whose read
    /// failed are left out.
    pub async fn poll(&mut self) -> Measurement {
        if self.state == LinkState::Connected && !self.transport.is_open() {
            debug!(asset = %self.asset, "Transport dropped its link, reconnecting");
            self.state = LinkState::Disconnected;
        }

        if self.state == LinkState::Disconnected {
            if !self.connect().await {
                warn!(asset = %self.asset, "Modbus device unreachable, skipping poll");
                return Measurement::failed();
            }
            info!(asset = %self.asset, "Modbus link established");
        }

        let Self {
            transport,
            map,
            default_slave,
            asset,
            state,
        } = self;

        let mut builder = MeasurementBuilder::new();
        for group in map.read_plan() {
            let slave = match group.slave {
                SlaveSelector::Default => *default_slave,
                SlaveSelector::Id(id) => id,
            };
            transport.select_slave(slave);

            for item in group.items {
                if let Some(raw) = read_item(transport, state, slave, item).await {
                    builder.push(item.name(), item.decode(raw));
                }
            }
        }

        debug!(
            asset = %asset,
            datapoints = builder.len(),
            connected = (*state == LinkState::Connected),
            "Poll cycle complete"
        );
        builder.finish(asset.as_str())
    }
}

/// Read one item, widening bits to 0/1.
///
/// Failures yield `None`. A broken-pipe class failure also moves the engine
/// to [`LinkState::Disconnected`] so that the next cycle reconnects.
async fn read_item<T: Transport>(
    transport: &mut T,
    state: &mut LinkState,
    slave: u8,
    item: &RegisterItem,
) -> Option<u16> {
    let address = item.address();
    let result: Result<u16, TransportError> = match item.kind() {
        RegisterKind::Coil => transport.read_coil(address).await.map(u16::from),
        RegisterKind::DiscreteInput => transport.read_discrete_input(address).await.map(u16::from),
        RegisterKind::HoldingRegister => transport.read_holding_register(address).await,
        RegisterKind::InputRegister => transport.read_input_register(address).await,
    };

    match result {
        Ok(raw) => Some(raw),
        Err(e) if e.is_broken_pipe() => {
            if *state == LinkState::Connected {
                warn!(
                    slave,
                    address,
                    kind = %item.kind(),
                    "Modbus link lost: {}", e
                );
                *state = LinkState::Disconnected;
            } else {
                debug!(slave, address, kind = %item.kind(), "Read on lost link: {}", e);
            }
            None
        }
        Err(e) => {
            error!(
                slave,
                address,
                kind = %item.kind(),
                name = item.name(),
                "Modbus read failed: {}", e
            );
            None
        }
    }
}
