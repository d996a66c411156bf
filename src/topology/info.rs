//! Immutable processor and device records
//!
//! Both records wrap a flat JSON object of detected properties. They are
//! validated once on construction and can never be changed afterwards: the
//! only write paths are the [`Frozen`] guards, which always fail with
//! [`TopoError::Immutability`].

use crate::error::{TopoError, TopoResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Raw property mapping behind an info record
pub type InfoMap = serde_json::Map<String, Value>;

/// Processor keys holding non-negative integers
const PROCESSOR_COUNT_KEYS: &[&str] = &[
    "num_cpus",
    "num_cpus_per_core",
    "num_cpus_per_socket",
    "num_sockets",
];

/// Processor keys holding strings
const PROCESSOR_STRING_KEYS: &[&str] = &["arch", "vendor", "model", "platform"];

mod private {
    pub trait Sealed {}
}

/// Write guard shared by all info records
///
/// Records expose their properties read-only. Any attempt to assign or remove
/// an attribute, whether it exists or not, is rejected.
pub trait Frozen: private::Sealed {
    /// Record name used in error messages
    const RECORD: &'static str;

    /// Attempt to assign an attribute
    fn set(&mut self, attribute: &str, _value: impl Into<Value>) -> TopoResult<()> {
        Err(TopoError::Immutability {
            record: Self::RECORD,
            attribute: attribute.to_string(),
        })
    }

    /// Attempt to remove an attribute
    fn remove(&mut self, attribute: &str) -> TopoResult<Value> {
        Err(TopoError::Immutability {
            record: Self::RECORD,
            attribute: attribute.to_string(),
        })
    }
}

/// Processor characteristics of a partition's compute nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProcessorInfo {
    info: InfoMap,
}

impl ProcessorInfo {
    /// Build a record from a fully populated mapping
    pub fn new(info: InfoMap) -> TopoResult<Self> {
        for key in PROCESSOR_COUNT_KEYS {
            if let Some(value) = info.get(*key) {
                if value.as_u64().is_none() {
                    return Err(invalid("ProcessorInfo", format!("'{key}' must be a non-negative integer")));
                }
            }
        }
        for key in PROCESSOR_STRING_KEYS {
            if let Some(value) = info.get(*key) {
                if !value.is_string() {
                    return Err(invalid("ProcessorInfo", format!("'{key}' must be a string")));
                }
            }
        }
        if let Some(topology) = info.get("topology") {
            if !topology.is_object() {
                return Err(invalid("ProcessorInfo", "'topology' must be an object"));
            }
        }

        Ok(Self { info })
    }

    /// Build a record from an arbitrary JSON value
    pub fn from_value(value: Value) -> TopoResult<Self> {
        match value {
            Value::Object(info) => Self::new(info),
            other => Err(invalid(
                "ProcessorInfo",
                format!("expected an object, found {}", kind(&other)),
            )),
        }
    }

    /// Full raw mapping
    pub fn info(&self) -> &InfoMap {
        &self.info
    }

    /// True when nothing was detected
    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    /// Number of logical CPUs
    pub fn num_cpus(&self) -> Option<u64> {
        self.count("num_cpus")
    }

    pub fn num_cpus_per_core(&self) -> Option<u64> {
        self.count("num_cpus_per_core")
    }

    pub fn num_cpus_per_socket(&self) -> Option<u64> {
        self.count("num_cpus_per_socket")
    }

    pub fn num_sockets(&self) -> Option<u64> {
        self.count("num_sockets")
    }

    /// Number of physical cores, derived from CPUs and SMT width
    pub fn num_cores(&self) -> Option<u64> {
        match (self.num_cpus(), self.num_cpus_per_core()) {
            (Some(cpus), Some(per_core)) if per_core > 0 => Some(cpus / per_core),
            _ => None,
        }
    }

    pub fn arch(&self) -> Option<&str> {
        self.text("arch")
    }

    pub fn vendor(&self) -> Option<&str> {
        self.text("vendor")
    }

    pub fn model(&self) -> Option<&str> {
        self.text("model")
    }

    pub fn platform(&self) -> Option<&str> {
        self.text("platform")
    }

    /// Nested topology description, if the introspector provided one
    pub fn topology(&self) -> Option<&InfoMap> {
        self.info.get("topology").and_then(Value::as_object)
    }

    fn count(&self, key: &str) -> Option<u64> {
        self.info.get(key).and_then(Value::as_u64)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(Value::as_str)
    }
}

impl private::Sealed for ProcessorInfo {}

impl Frozen for ProcessorInfo {
    const RECORD: &'static str = "ProcessorInfo";
}

impl<'de> Deserialize<'de> for ProcessorInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// An attached device (accelerator) of a partition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceInfo {
    info: InfoMap,
}

impl DeviceInfo {
    /// Build a record from a mapping carrying at least `type` and `arch`
    pub fn new(info: InfoMap) -> TopoResult<Self> {
        for key in ["type", "arch"] {
            match info.get(key) {
                Some(Value::String(_)) => {}
                Some(_) => return Err(invalid("DeviceInfo", format!("'{key}' must be a string"))),
                None => return Err(invalid("DeviceInfo", format!("missing '{key}'"))),
            }
        }
        if let Some(count) = info.get("num_devices") {
            if count.as_u64().is_none() {
                return Err(invalid("DeviceInfo", "'num_devices' must be a non-negative integer"));
            }
        }

        Ok(Self { info })
    }

    /// Build a record from an arbitrary JSON value
    pub fn from_value(value: Value) -> TopoResult<Self> {
        match value {
            Value::Object(info) => Self::new(info),
            other => Err(invalid(
                "DeviceInfo",
                format!("expected an object, found {}", kind(&other)),
            )),
        }
    }

    /// Convenience constructor for a group of identical GPUs
    pub fn gpu(arch: impl Into<String>, num_devices: u64) -> Self {
        let mut info = InfoMap::new();
        info.insert("type".to_string(), Value::from("gpu"));
        info.insert("arch".to_string(), Value::from(arch.into()));
        info.insert("num_devices".to_string(), Value::from(num_devices));
        Self { info }
    }

    /// Full raw mapping
    pub fn info(&self) -> &InfoMap {
        &self.info
    }

    /// Device type, e.g. `gpu`
    pub fn device_type(&self) -> &str {
        self.info.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    /// Device architecture, e.g. `a100`
    pub fn arch(&self) -> &str {
        self.info.get("arch").and_then(Value::as_str).unwrap_or_default()
    }

    /// Number of devices of this kind per node (1 when not recorded)
    pub fn num_devices(&self) -> u64 {
        self.info
            .get("num_devices")
            .and_then(Value::as_u64)
            .unwrap_or(1)
    }
}

impl private::Sealed for DeviceInfo {}

impl Frozen for DeviceInfo {
    const RECORD: &'static str = "DeviceInfo";
}

impl<'de> Deserialize<'de> for DeviceInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Output of a probe job: the host's processor plus its devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub processor: ProcessorInfo,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

fn invalid(record: &'static str, reason: impl Into<String>) -> TopoError {
    TopoError::InvalidRecord {
        record,
        reason: reason.into(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
