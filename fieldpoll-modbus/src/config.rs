//! Configuration for the Modbus south plugin.
//!
//! The plugin document names the transport (`protocol` plus its connection
//! parameters), the default slave, the asset name and the register map.

use fieldpoll_common::LoggingConfig;
use serde::de::value::MapAccessDeserializer;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] fieldpoll_common::Error),
    #[error("Failed to parse register map: {0}")]
    Map(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusPluginConfig {
    /// Asset name attached to every measurement
    #[serde(default = "default_asset")]
    pub asset: String,

    /// Transport kind: "TCP" or "RTU"
    #[serde(default)]
    pub protocol: Option<String>,

    /// Modbus TCP server address (host name or IP)
    #[serde(default)]
    pub address: Option<String>,

    /// Modbus TCP server port
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Serial device for Modbus RTU (e.g. "/dev/ttyUSB0")
    #[serde(default)]
    pub device: Option<String>,

    /// RTU baud rate
    #[serde(default = "default_baud_rate")]
    pub baud: u32,

    /// RTU data bits
    #[serde(default = "default_data_bits")]
    pub bits: u8,

    /// RTU stop bits
    #[serde(default = "default_stop_bits", alias = "stopBits")]
    pub stopbits: u8,

    /// RTU parity: "none", "even" or "odd"
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Default slave ID, used by the flat map objects and by entries without `slave`
    #[serde(default = "default_slave")]
    pub slave: u8,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Register map description
    #[serde(default)]
    pub map: MapSource,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_asset() -> String {
    "modbus".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_slave() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// The register map, given inline or as a string holding a JSON document.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MapSource {
    Inline(RegisterMapConfig),
    Text(String),
}

impl<'de> Deserialize<'de> for MapSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapSourceVisitor;

        impl<'de> Visitor<'de> for MapSourceVisitor {
            type Value = MapSource;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a register map object or a string holding one")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(MapSource::Text(value.to_string()))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
                Ok(MapSource::Text(value))
            }

            fn visit_map<A: MapAccess<'de>>(self, access: A) -> Result<Self::Value, A::Error> {
                RegisterMapConfig::deserialize(MapAccessDeserializer::new(access))
                    .map(MapSource::Inline)
            }
        }

        deserializer.deserialize_any(MapSourceVisitor)
    }
}

impl Default for MapSource {
    fn default() -> Self {
        MapSource::Inline(RegisterMapConfig::default())
    }
}

impl MapSource {
    /// Produce the structured register map, parsing the text form if needed.
    pub fn resolve(&self) -> Result<RegisterMapConfig, ConfigError> {
        match self {
            MapSource::Inline(map) => Ok(map.clone()),
            MapSource::Text(text) if text.trim().is_empty() => Ok(RegisterMapConfig::default()),
            MapSource::Text(text) => Ok(serde_json::from_str(text)?),
        }
    }
}

/// Register map description.
///
/// `values` is the per-slave form with optional scaling. The four flat
/// objects map names straight to addresses on the default slave; their
/// member order is kept because it is the output order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMapConfig {
    #[serde(default)]
    pub values: Vec<RegisterEntry>,

    #[serde(default, with = "ordered_entries")]
    pub coils: Vec<(String, u16)>,

    #[serde(default, with = "ordered_entries")]
    pub inputs: Vec<(String, u16)>,

    #[serde(default, with = "ordered_entries")]
    pub registers: Vec<(String, u16)>,

    #[serde(default, with = "ordered_entries")]
    pub input_registers: Vec<(String, u16)>,
}

/// One entry of the `values` array.
///
/// Every kind key present (`coil`, `input`, `register`, `inputRegister`)
/// registers its own item under the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coil: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_register: Option<u16>,

    /// Scaling factor (offset + raw * scale)
    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub offset: f64,
}

fn default_scale() -> f64 {
    1.0
}

/// (De)serializes a JSON object as a list of members in document order.
mod ordered_entries {
    use serde::de::{MapAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        entries: &[(String, u16)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(entries.iter().map(|(name, address)| (name, address)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, u16)>, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Vec<(String, u16)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping names to addresses")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, address)) = access.next_entry::<String, u16>()? {
                    entries.push((name, address));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    /// Parse "none", "even" or "odd" (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" => Some(Parity::None),
            "even" => Some(Parity::Even),
            "odd" => Some(Parity::Odd),
            _ => None,
        }
    }
}

/// Connection parameters for one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp { address: String, port: u16 },
    /// Modbus RTU (serial) connection
    Rtu {
        device: String,
        baud_rate: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    },
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionConfig::Tcp { address, port } => write!(f, "tcp://{}:{}", address, port),
            ConnectionConfig::Rtu {
                device, baud_rate, ..
            } => write!(f, "rtu://{}@{}", device, baud_rate),
        }
    }
}

/// Everything needed to build a transport. Two sessions with equal
/// transport configs talk to the device the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub connection: ConnectionConfig,
    pub timeout: Duration,
}

impl ModbusPluginConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ModbusPluginConfig = fieldpoll_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 document.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: ModbusPluginConfig = fieldpoll_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport()?;
        crate::register_map::RegisterMap::from_config(&self.register_map()?, self.slave)?;
        Ok(())
    }

    /// Resolve the register map description.
    pub fn register_map(&self) -> Result<RegisterMapConfig, ConfigError> {
        self.map.resolve()
    }

    /// Derive the transport parameters from `protocol` and its settings.
    pub fn transport(&self) -> Result<TransportConfig, ConfigError> {
        let Some(protocol) = self.protocol.as_deref() else {
            return Err(ConfigError::Validation(
                "Modbus missing protocol specification".to_string(),
            ));
        };

        let connection = if protocol.eq_ignore_ascii_case("tcp") {
            let address = self
                .address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    ConfigError::Validation("Modbus TCP requires a non-empty address".to_string())
                })?;

            ConnectionConfig::Tcp {
                address: address.to_string(),
                port: self.port,
            }
        } else if protocol.eq_ignore_ascii_case("rtu") {
            let device = self
                .device
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .ok_or_else(|| {
                    ConfigError::Validation("Modbus RTU requires a serial device".to_string())
                })?;

            let parity = Parity::parse(&self.parity).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    self.parity
                ))
            })?;

            if !(5..=8).contains(&self.bits) {
                return Err(ConfigError::Validation(format!(
                    "invalid data bits {} (use 5 to 8)",
                    self.bits
                )));
            }

            if !(1..=2).contains(&self.stopbits) {
                return Err(ConfigError::Validation(format!(
                    "invalid stop bits {} (use 1 or 2)",
                    self.stopbits
                )));
            }

            ConnectionConfig::Rtu {
                device: device.to_string(),
                baud_rate: self.baud,
                parity,
                data_bits: self.bits,
                stop_bits: self.stopbits,
            }
        } else {
            return Err(ConfigError::Validation(format!(
                "Modbus must specify either RTU or TCP as protocol, got '{}'",
                protocol
            )));
        };

        Ok(TransportConfig {
            connection,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{
            protocol: "TCP",
            address: "127.0.0.1",
            port: 2222,
            map: {
                values: [
                    { name: "temperature", slave: 1, register: 0, scale: 0.1, offset: 0.0 },
                    { name: "humidity", register: 1 }
                ]
            }
        }"#;

        let config = ModbusPluginConfig::from_json5(json).unwrap();
        assert_eq!(config.asset, "modbus");
        assert_eq!(config.slave, 1);

        let transport = config.transport().unwrap();
        assert_eq!(
            transport.connection,
            ConnectionConfig::Tcp {
                address: "127.0.0.1".to_string(),
                port: 2222
            }
        );
        assert_eq!(transport.timeout, Duration::from_millis(1000));

        let map = config.register_map().unwrap();
        assert_eq!(map.values.len(), 2);
        assert_eq!(map.values[0].scale, 0.1);
        assert_eq!(map.values[1].slave, None);
        assert_eq!(map.values[1].scale, 1.0);
        assert_eq!(map.values[1].register, Some(1));
    }

    #[test]
    fn test_tcp_default_port() {
        let config = ModbusPluginConfig::from_json5(r#"{ protocol: "tcp", address: "plc" }"#)
            .unwrap();
        let transport = config.transport().unwrap();
        assert_eq!(transport.connection.to_string(), "tcp://plc:502");
    }

    #[test]
    fn test_parse_rtu_config() {
        let json = r#"{
            protocol: "RTU",
            device: "/dev/ttyUSB0",
            baud: 19200,
            parity: "even",
            stopBits: 2,
            slave: 5
        }"#;

        let config = ModbusPluginConfig::from_json5(json).unwrap();
        assert_eq!(config.slave, 5);

        let transport = config.transport().unwrap();
        assert_eq!(
            transport.connection,
            ConnectionConfig::Rtu {
                device: "/dev/ttyUSB0".to_string(),
                baud_rate: 19200,
                parity: Parity::Even,
                data_bits: 8,
                stop_bits: 2,
            }
        );
    }

    #[test]
    fn test_missing_protocol() {
        let err = ModbusPluginConfig::from_json5(r#"{ address: "127.0.0.1" }"#).unwrap_err();
        assert!(err.to_string().contains("missing protocol"));
    }

    #[test]
    fn test_invalid_protocol() {
        let err = ModbusPluginConfig::from_json5(r#"{ protocol: "ASCII" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("ASCII"));
    }

    #[test]
    fn test_tcp_requires_address() {
        assert!(ModbusPluginConfig::from_json5(r#"{ protocol: "TCP" }"#).is_err());
        assert!(ModbusPluginConfig::from_json5(r#"{ protocol: "TCP", address: " " }"#).is_err());
    }

    #[test]
    fn test_rtu_requires_device() {
        let err = ModbusPluginConfig::from_json5(r#"{ protocol: "RTU", device: "" }"#).unwrap_err();
        assert!(err.to_string().contains("serial device"));
    }

    #[test]
    fn test_rtu_invalid_parity() {
        let json = r#"{ protocol: "RTU", device: "/dev/ttyS0", parity: "mark" }"#;
        assert!(ModbusPluginConfig::from_json5(json).is_err());
    }

    #[test]
    fn test_rtu_unsupported_data_bits() {
        let json = r#"{ protocol: "RTU", device: "/dev/ttyS0", bits: 9 }"#;
        let err = ModbusPluginConfig::from_json5(json).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("data bits 9"));
    }

    #[test]
    fn test_rtu_unsupported_stop_bits() {
        for json in [
            r#"{ protocol: "RTU", device: "/dev/ttyS0", stopbits: 3 }"#,
            r#"{ protocol: "RTU", device: "/dev/ttyS0", stopBits: 0 }"#,
        ] {
            let err = ModbusPluginConfig::from_json5(json).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{err}");
            assert!(err.to_string().contains("stop bits"));
        }
    }

    #[test]
    fn test_tcp_ignores_serial_settings() {
        let json = r#"{ protocol: "TCP", address: "h", bits: 9, stopbits: 3 }"#;
        assert!(ModbusPluginConfig::from_json5(json).is_ok());
    }

    #[test]
    fn test_map_as_text() {
        let json = r#"{
            protocol: "TCP",
            address: "10.0.0.2",
            map: "{ \"values\": [ { \"name\": \"speed\", \"inputRegister\": 7, \"slave\": 3 } ], \"coils\": { \"run\": 1 } }"
        }"#;

        let config = ModbusPluginConfig::from_json5(json).unwrap();
        let map = config.register_map().unwrap();
        assert_eq!(map.values[0].input_register, Some(7));
        assert_eq!(map.values[0].slave, Some(3));
        assert_eq!(map.coils, vec![("run".to_string(), 1)]);
    }

    #[test]
    fn test_map_text_parse_error() {
        let config: ModbusPluginConfig =
            json5::from_str(r#"{ protocol: "TCP", address: "a", map: "{ not json" }"#).unwrap();
        assert!(matches!(config.register_map(), Err(ConfigError::Map(_))));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flat_objects_keep_document_order() {
        let json = r#"{
            protocol: "TCP",
            address: "127.0.0.1",
            map: {
                registers: { zeta: 4, alpha: 2, mid: 9 },
                inputRegisters: { b: 1, a: 0 }
            }
        }"#;

        let config = ModbusPluginConfig::from_json5(json).unwrap();
        let map = config.register_map().unwrap();
        let names: Vec<&str> = map.registers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            map.input_registers,
            vec![("b".to_string(), 1), ("a".to_string(), 0)]
        );
    }

    #[test]
    fn test_entry_without_name_is_rejected() {
        let json = r#"{ protocol: "TCP", address: "h", map: { values: [ { register: 1 } ] } }"#;
        let err = ModbusPluginConfig::from_json5(json).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
        assert!(err.to_string().contains("missing field `name`"), "{err}");
    }

    #[test]
    fn test_bad_flat_address_is_reported() {
        let json = r#"{ protocol: "TCP", address: "h", map: { coils: { run: "one" } } }"#;
        let err = ModbusPluginConfig::from_json5(json).unwrap_err();
        assert!(!err.to_string().contains("untagged"), "{err}");
    }

    #[test]
    fn test_map_must_be_object_or_string() {
        let json = r#"{ protocol: "TCP", address: "h", map: 42 }"#;
        let err = ModbusPluginConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("register map object"), "{err}");
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "fieldpoll-modbus-{}-{}.json5",
            std::process::id(),
            fieldpoll_common::current_timestamp_millis()
        ));
        std::fs::write(
            &path,
            r#"{
                // plant floor gateway
                protocol: "TCP",
                address: "10.0.0.9",
                asset: "press",
                map: { registers: { force: 3 } },
            }"#,
        )
        .unwrap();

        let config = ModbusPluginConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.asset, "press");
        assert_eq!(
            config.register_map().unwrap().registers,
            vec![("force".to_string(), 3)]
        );
        assert!(matches!(
            ModbusPluginConfig::load_from_file("/nonexistent/modbus.json5"),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_entry_without_kind_is_rejected() {
        let json = r#"{ protocol: "TCP", address: "h", map: { values: [ { name: "x" } ] } }"#;
        let err = ModbusPluginConfig::from_json5(json).unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }
}
