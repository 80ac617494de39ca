//! Plugin lifecycle: initialize, poll, reconfigure, shutdown.

use crate::config::{ConfigError, ModbusPluginConfig, TransportConfig};
use crate::poller::ModbusPoller;
use crate::register_map::RegisterMap;
use crate::transport::{ModbusTransport, Transport};
use fieldpoll_common::Measurement;
use tracing::{info, warn};

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session handle: the session has been shut down")]
    InvalidHandle,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builds a transport from its parameters.
pub type Connector<T> = Box<dyn FnMut(&TransportConfig) -> T + Send>;

/// One device session: a poller plus what is needed to rebuild its transport.
pub struct ModbusSession<T: Transport = ModbusTransport> {
    poller: Option<ModbusPoller<T>>,
    transport_config: TransportConfig,
    connector: Connector<T>,
}

impl ModbusSession<ModbusTransport> {
    /// Initialize a session over a real TCP or RTU link.
    pub async fn init(config: &ModbusPluginConfig) -> Result<Self, SessionError> {
        Self::init_with(config, |transport: &TransportConfig| {
            ModbusTransport::new(transport.clone())
        })
        .await
    }
}

impl<T: Transport> ModbusSession<T> {
    /// Initialize a session, building transports with `connector`.
    ///
    /// The configuration is validated in full. A failed first connect is
    /// logged and left to the next poll.
    pub async fn init_with<F>(config: &ModbusPluginConfig, connector: F) -> Result<Self, SessionError>
    where
        F: FnMut(&TransportConfig) -> T + Send + 'static,
    {
        let mut connector: Connector<T> = Box::new(connector);
        let transport_config = config.transport()?;
        let map = RegisterMap::from_config(&config.register_map()?, config.slave)?;

        info!(
            asset = %config.asset,
            endpoint = %transport_config.connection,
            items = map.len(),
            "Initializing Modbus session"
        );

        let transport = connector(&transport_config);
        let mut poller = ModbusPoller::new(transport, map, config.slave, config.asset.clone());
        if !poller.connect().await {
            warn!(asset = %config.asset, "Initial connect failed, will retry on poll");
        }

        Ok(Self {
            poller: Some(poller),
            transport_config,
            connector,
        })
    }

    /// Whether the session has not been shut down.
    pub fn is_active(&self) -> bool {
        self.poller.is_some()
    }

    pub fn poller(&self) -> Option<&ModbusPoller<T>> {
        self.poller.as_ref()
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport_config
    }

    /// Run one poll cycle.
    pub async fn poll(&mut self) -> Result<Measurement, SessionError> {
        let poller = self.poller.as_mut().ok_or(SessionError::InvalidHandle)?;
        Ok(poller.poll().await)
    }

    /// Apply a new configuration.
    ///
    /// Nothing changes if the new configuration is invalid. The transport is
    /// only rebuilt when its parameters differ from the current ones.
    pub async fn reconfigure(&mut self, config: &ModbusPluginConfig) -> Result<(), SessionError> {
        let poller = self.poller.as_mut().ok_or(SessionError::InvalidHandle)?;
        let transport_config = config.transport()?;
        let map = RegisterMap::from_config(&config.register_map()?, config.slave)?;

        info!(asset = %config.asset, items = map.len(), "Reconfiguring Modbus session");
        poller.set_register_map(map);
        poller.set_asset(config.asset.clone());
        poller.set_default_slave(config.slave);

        if transport_config != self.transport_config {
            info!(
                from = %self.transport_config.connection,
                to = %transport_config.connection,
                "Transport parameters changed, reopening link"
            );
            poller.disconnect().await;
            let transport = (self.connector)(&transport_config);
            poller.replace_transport(transport);
            if !poller.connect().await {
                warn!(asset = %config.asset, "Connect after reconfigure failed, will retry on poll");
            }
            self.transport_config = transport_config;
        }

        Ok(())
    }

    /// Close the transport and release the register map.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        let mut poller = self.poller.take().ok_or(SessionError::InvalidHandle)?;
        poller.disconnect().await;
        info!(asset = %poller.asset(), "Modbus session shut down");
        Ok(())
    }
}
