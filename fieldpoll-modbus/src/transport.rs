//! Connection to one physical Modbus device.
//!
//! [`Transport`] is the seam between the polling engine and the wire: one
//! request per call, no internal retries. [`ModbusTransport`] implements it
//! on top of tokio-modbus for TCP and RTU links.

use crate::config::{ConnectionConfig, Parity, TransportConfig};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, error, info};

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Exception: {0}")]
    Exception(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Empty response")]
    EmptyResponse,
}

impl TransportError {
    /// Whether the link is gone and must be reopened before further reads
    /// can succeed.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            TransportError::NotConnected => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether the request/response stream can no longer be trusted. A
    /// late or garbled reply would otherwise be matched to the next request.
    pub(crate) fn poisons_link(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Protocol(_) | TransportError::Timeout(_)
        )
    }
}

/// A link to one device, exclusively owned by one session.
pub trait Transport: Send {
    /// Open the link, replacing any previous one.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Whether a link is currently held.
    fn is_open(&self) -> bool;

    /// Address subsequent reads to `slave`.
    fn select_slave(&mut self, slave: u8);

    fn read_coil(&mut self, address: u16)
    -> impl Future<Output = Result<bool, TransportError>> + Send;

    fn read_discrete_input(
        &mut self,
        address: u16,
    ) -> impl Future<Output = Result<bool, TransportError>> + Send;

    fn read_holding_register(
        &mut self,
        address: u16,
    ) -> impl Future<Output = Result<u16, TransportError>> + Send;

    fn read_input_register(
        &mut self,
        address: u16,
    ) -> impl Future<Output = Result<u16, TransportError>> + Send;

    /// Close the link. Reads fail with [`TransportError::NotConnected`] afterwards.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// tokio-modbus backed transport.
pub struct ModbusTransport {
    config: TransportConfig,
    slave: Slave,
    ctx: Option<Context>,
}

impl ModbusTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            slave: Slave(1),
            ctx: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Drop the link after a failure that leaves the stream out of step.
    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.poisons_link() && self.ctx.take().is_some() {
                debug!(endpoint = %self.config.connection, "Dropping Modbus link: {}", e);
            }
        }
        result
    }
}

/// Open a fresh link to the device.
async fn open(config: &TransportConfig, slave: Slave) -> Result<Context, TransportError> {
    let timeout = config.timeout;

    match &config.connection {
        ConnectionConfig::Tcp { address, port } => {
            let addr = tokio::net::lookup_host((address.as_str(), *port))
                .await
                .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
                .next()
                .ok_or_else(|| {
                    TransportError::Connection(format!("No address found for {}", address))
                })?;

            let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, slave))
                .await
                .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            Ok(ctx)
        }
        ConnectionConfig::Rtu {
            device,
            baud_rate,
            parity,
            data_bits,
            stop_bits,
        } => {
            let builder = tokio_serial::new(device, *baud_rate)
                .parity(serial_parity(*parity))
                .stop_bits(serial_stop_bits(*stop_bits))
                .data_bits(serial_data_bits(*data_bits))
                .timeout(timeout);

            let serial = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

            Ok(rtu::attach_slave(serial, slave))
        }
    }
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn serial_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
    match stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn serial_data_bits(data_bits: u8) -> tokio_serial::DataBits {
    match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

/// Unwrap a one-element response.
fn single<T: Copy>(response: tokio_modbus::Result<Vec<T>>) -> Result<T, TransportError> {
    match response {
        Ok(Ok(values)) => values.first().copied().ok_or(TransportError::EmptyResponse),
        Ok(Err(code)) => Err(TransportError::Exception(format!("{:?}", code))),
        Err(tokio_modbus::Error::Transport(e)) => Err(TransportError::Io(e)),
        Err(e) => Err(TransportError::Protocol(e.to_string())),
    }
}

impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stale) = self.ctx.take() {
            if let Err(e) = stale.disconnect().await {
                debug!("Closing stale Modbus link failed: {}", e);
            }
        }

        match open(&self.config, self.slave).await {
            Ok(ctx) => {
                info!(endpoint = %self.config.connection, "Modbus connected");
                self.ctx = Some(ctx);
                Ok(())
            }
            Err(e) => {
                error!(
                    endpoint = %self.config.connection,
                    "Failed to connect to Modbus device: {}", e
                );
                Err(e)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    fn select_slave(&mut self, slave: u8) {
        self.slave = Slave(slave);
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(self.slave);
        }
    }

    async fn read_coil(&mut self, address: u16) -> Result<bool, TransportError> {
        let timeout = self.config.timeout;
        let ctx = self.context()?;
        let result = match tokio::time::timeout(timeout, ctx.read_coils(address, 1)).await {
            Ok(response) => single(response),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        self.settle(result)
    }

    async fn read_discrete_input(&mut self, address: u16) -> Result<bool, TransportError> {
        let timeout = self.config.timeout;
        let ctx = self.context()?;
        let result = match tokio::time::timeout(timeout, ctx.read_discrete_inputs(address, 1)).await {
            Ok(response) => single(response),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        self.settle(result)
    }

    async fn read_holding_register(&mut self, address: u16) -> Result<u16, TransportError> {
        let timeout = self.config.timeout;
        let ctx = self.context()?;
        let result = match tokio::time::timeout(timeout, ctx.read_holding_registers(address, 1)).await {
            Ok(response) => single(response),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        self.settle(result)
    }

    async fn read_input_register(&mut self, address: u16) -> Result<u16, TransportError> {
        let timeout = self.config.timeout;
        let ctx = self.context()?;
        let result = match tokio::time::timeout(timeout, ctx.read_input_registers(address, 1)).await {
            Ok(response) => single(response),
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        self.settle(result)
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            match ctx.disconnect().await {
                Ok(()) => debug!(endpoint = %self.config.connection, "Modbus disconnected"),
                Err(e) => debug!("Modbus disconnect failed: {}", e),
            }
        }
    }
}
