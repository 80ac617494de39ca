use serde::{Deserialize, Serialize};

/// Asset name carried by a measurement when the device could not be reached at all.
///
/// A failed measurement never carries datapoints, which is what tells it apart
/// from a reachable device whose register map yielded nothing.
pub const FAILED_ASSET: &str = "failed";

/// Typed datapoint value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DatapointValue {
    /// Raw integer reading (bits as 0/1, unscaled 16-bit registers).
    Integer(i64),

    /// Reading with a linear transform applied.
    Float(f64),
}

impl DatapointValue {
    /// Numeric value as a float, whatever the variant.
    pub fn as_f64(&self) -> f64 {
        match self {
            DatapointValue::Integer(v) => *v as f64,
            DatapointValue::Float(v) => *v,
        }
    }

    /// Returns `true` for [`DatapointValue::Integer`].
    pub fn is_integer(&self) -> bool {
        matches!(self, DatapointValue::Integer(_))
    }
}

impl From<i64> for DatapointValue {
    fn from(v: i64) -> Self {
        DatapointValue::Integer(v)
    }
}

impl From<u16> for DatapointValue {
    fn from(v: u16) -> Self {
        DatapointValue::Integer(i64::from(v))
    }
}

impl From<bool> for DatapointValue {
    fn from(v: bool) -> Self {
        DatapointValue::Integer(i64::from(v))
    }
}

impl From<f64> for DatapointValue {
    fn from(v: f64) -> Self {
        DatapointValue::Float(v)
    }
}

impl std::fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatapointValue::Integer(v) => write!(f, "{}", v),
            DatapointValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A named value inside a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub name: String,
    pub value: DatapointValue,
}

/// The output of one poll cycle.
///
/// Datapoints keep the order in which they were read. Names are not
/// deduplicated: an item configured twice shows up twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Asset (subject) name the datapoints belong to.
    pub asset: String,

    /// Unix epoch milliseconds when the measurement was assembled.
    pub timestamp: i64,

    /// Datapoints in read order.
    pub datapoints: Vec<Datapoint>,
}

impl Measurement {
    /// Create a measurement stamped with the current time.
    pub fn new(asset: impl Into<String>, datapoints: Vec<Datapoint>) -> Self {
        Self {
            asset: asset.into(),
            timestamp: current_timestamp_millis(),
            datapoints,
        }
    }

    /// The empty measurement returned when the transport could not be opened.
    pub fn failed() -> Self {
        Self::new(FAILED_ASSET, Vec::new())
    }

    /// Whether this is the transport-failure sentinel.
    pub fn is_failed(&self) -> bool {
        self.asset == FAILED_ASSET && self.datapoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    /// First value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<DatapointValue> {
        self.datapoints
            .iter()
            .find(|dp| dp.name == name)
            .map(|dp| dp.value)
    }

    /// Datapoint names in read order.
    pub fn names(&self) -> Vec<&str> {
        self.datapoints.iter().map(|dp| dp.name.as_str()).collect()
    }
}

/// Append-only builder for a [`Measurement`].
#[derive(Debug, Default)]
pub struct MeasurementBuilder {
    datapoints: Vec<Datapoint>,
}

impl MeasurementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a datapoint after every datapoint pushed so far.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<DatapointValue>) {
        self.datapoints.push(Datapoint {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    /// Seal the collected datapoints into a measurement for `asset`.
    pub fn finish(self, asset: impl Into<String>) -> Measurement {
        Measurement::new(asset, self.datapoints)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
