//! Domain model for the acquisition gateway
//!
//! Definitional entities (devices, variable tables, variables, brokers,
//! triggers) are owned by the [`Registry`](crate::registry::Registry) and are
//! read-only to the core except for the connection-state fields the session
//! managers update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Field protocol spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    S7,
    OpcUa,
    Modbus,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::S7 => "s7",
            ProtocolKind::OpcUa => "opcua",
            ProtocolKind::Modbus => "modbus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s7" => Some(ProtocolKind::S7),
            "opcua" | "opc-ua" | "opc_ua" => Some(ProtocolKind::OpcUa),
            "modbus" | "modbus-tcp" | "modbustcp" => Some(ProtocolKind::Modbus),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A polled field device (PLC or OPC UA server)
///
/// `connected` and `last_error` are the only fields the core mutates; the
/// rest is configuration owned by the management layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub protocol: ProtocolKind,
    /// Host name or IP for S7/Modbus transports
    pub address: String,
    pub port: u16,
    /// S7 rack number; reused as the unit id for Modbus devices
    pub rack: u16,
    /// S7 CPU slot
    pub slot: u16,
    /// Discovery URL for OPC UA devices
    pub endpoint_url: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Groups variables under one device; the active flag gates polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableTable {
    pub id: u32,
    pub device_id: u32,
    pub name: String,
    pub active: bool,
}

/// Runtime type of a variable's value, used to decode protocol payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    Text,
}

impl DataType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "bit" => Some(DataType::Bool),
            "byte" => Some(DataType::Byte),
            "int16" | "int" => Some(DataType::Int16),
            "uint16" | "word" => Some(DataType::UInt16),
            "int32" | "dint" => Some(DataType::Int32),
            "uint32" | "dword" => Some(DataType::UInt32),
            "float32" | "real" | "float" => Some(DataType::Float32),
            "float64" | "double" => Some(DataType::Float64),
            "text" | "string" => Some(DataType::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Byte => "byte",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Text => "text",
        }
    }
}

/// The unit of acquisition: one addressable tag on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: u32,
    pub table_id: u32,
    pub name: String,
    /// Protocol address: S7 address string, OPC UA node id, or Modbus register
    pub address: String,
    pub data_type: DataType,
    /// Minimum time between successive reads, in milliseconds (> 0)
    pub polling_interval_ms: u64,
    pub active: bool,

    /// Last raw value as read from the device, canonical string form
    #[serde(default)]
    pub last_raw: Option<String>,
    /// Last converted value (canonical string)
    #[serde(default)]
    pub last_value: Option<String>,
    /// Numeric form of the last value, when it parses as a number
    #[serde(default)]
    pub last_numeric: Option<f64>,
    /// Timestamp of the last successful poll
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,

    pub history_enabled: bool,
    /// Configured but not consulted by the pipeline; exact-value equality is
    /// the only propagation gate.
    pub history_deadband: Option<f64>,
    pub alarm_enabled: bool,
    pub alarm_min: Option<f64>,
    pub alarm_max: Option<f64>,
    /// Configured but not consulted, same as `history_deadband`.
    pub alarm_deadband: Option<f64>,
}

impl Variable {
    /// A variable is due when its polling interval has elapsed since the last
    /// successful poll. Never-polled variables are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_update {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.num_milliseconds() >= self.polling_interval_ms as i64
            }
        }
    }
}

/// Outbound payload template; `{name}`, `{value}` and `{timestamp}`
/// placeholders are substituted at publish time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub header: String,
    pub content: String,
    pub footer: String,
}

/// A configured MQTT broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttServer {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub subscribe_topic: String,
    pub publish_topic: String,
    pub active: bool,
    #[serde(default)]
    pub connected: bool,
    pub template: MessageTemplate,
}

/// Links one variable to one broker with the per-pair alias substituted for
/// `{name}` in the broker's template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttAlias {
    pub variable_id: u32,
    pub server_id: u32,
    pub alias: String,
}

/// Comparison applied by a trigger against the variable's numeric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    GreaterThan { threshold: f64 },
    LessThan { threshold: f64 },
    EqualTo { threshold: f64 },
    NotEqualTo { threshold: f64 },
    InRange { lower: f64, upper: f64 },
    OutOfRange { lower: f64, upper: f64 },
}

impl TriggerCondition {
    /// Evaluate the condition against a numeric value. Range bounds are
    /// inclusive.
    pub fn matches(&self, value: f64) -> bool {
        match *self {
            TriggerCondition::GreaterThan { threshold } => value > threshold,
            TriggerCondition::LessThan { threshold } => value < threshold,
            TriggerCondition::EqualTo { threshold } => value == threshold,
            TriggerCondition::NotEqualTo { threshold } => value != threshold,
            TriggerCondition::InRange { lower, upper } => value >= lower && value <= upper,
            TriggerCondition::OutOfRange { lower, upper } => value < lower || value > upper,
        }
    }

    /// Threshold placeholder value for action message templates
    pub fn threshold(&self) -> Option<f64> {
        match *self {
            TriggerCondition::GreaterThan { threshold }
            | TriggerCondition::LessThan { threshold }
            | TriggerCondition::EqualTo { threshold }
            | TriggerCondition::NotEqualTo { threshold } => Some(threshold),
            _ => None,
        }
    }

    /// Range bounds for action message templates
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match *self {
            TriggerCondition::InRange { lower, upper }
            | TriggerCondition::OutOfRange { lower, upper } => Some((lower, upper)),
            _ => None,
        }
    }
}

/// How a fired trigger is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Structured log entry only
    Log,
    /// POST the rendered message to a configured URL (covers email and
    /// notification gateways behind an HTTP boundary)
    Webhook,
    /// Republish the rendered message through a configured broker
    Publish,
}

/// Trigger action: a kind plus an opaque configuration payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAction {
    pub kind: ActionKind,
    /// Opaque configuration: `url` for webhooks, `server_id`/`topic` for
    /// publishes, `template` for the message body.
    pub config: serde_json::Value,
}

/// A policy-driven side effect bound to one or more variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: u32,
    pub name: String,
    pub condition: TriggerCondition,
    pub action: TriggerAction,
    /// Debounce window after a firing during which the trigger stays silent
    #[serde(default, with = "opt_duration_ms")]
    pub suppression: Option<Duration>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Trigger-to-variable binding (many-to-many)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerVariable {
    pub trigger_id: u32,
    pub variable_id: u32,
}

/// Append-only historian row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableHistory {
    pub variable_id: u32,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// Typed raw value returned by a field protocol read
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Canonical string form: booleans lowercase, integers verbatim, floats
    /// with Rust's shortest round-trip formatting.
    pub fn canonical_string(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::UInt(u) => u.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }

    /// Numeric form when one exists. Booleans map to 1.0/0.0 so alarm and
    /// trigger comparisons work on signal points.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::UInt(u) => Some(*u as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}
