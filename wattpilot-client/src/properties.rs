//! Property store
//!
//! Mirrors the charger's key/value properties and keeps a typed projection of
//! the well-known keys ([`DerivedFields`]) in step with the raw map.
//!
//! Full and delta updates both merge: keys absent from a payload keep their
//! last value. Every key of a payload is reported back to the caller in
//! arrival order, changed or not.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::protocol::types::{
    AccessControl, AccessState, CableLockMode, CarState, CodeTable, Decoded, ErrorState, LoadMode,
};

// ============================================================================
// Property values
// ============================================================================

/// Value of a single charger property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PropertyValue>),
    Record(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; integral floats are accepted
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            PropertyValue::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Short shape name used in log messages
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Str(_) => "string",
            PropertyValue::List(_) => "list",
            PropertyValue::Record(_) => "record",
        }
    }

    pub fn to_json(&self) -> Value {
        Value::from(self.clone())
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => PropertyValue::Str(s),
            Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            Value::Object(map) => PropertyValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Int(i) => Value::from(i),
            // Non-finite floats have no JSON form
            PropertyValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropertyValue::Str(s) => Value::String(s),
            PropertyValue::List(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            PropertyValue::Record(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl<'de> serde::Deserialize<'de> for PropertyValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(PropertyValue::from)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Str(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// ============================================================================
// Derived fields
// ============================================================================

/// Typed projection of well-known properties
///
/// Every field is `None` until its key has been seen with a decodable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedFields {
    pub voltage1: Option<f64>,
    pub voltage2: Option<f64>,
    pub voltage3: Option<f64>,
    pub voltage_n: Option<f64>,
    pub amps1: Option<f64>,
    pub amps2: Option<f64>,
    pub amps3: Option<f64>,
    /// Per-phase power in kW
    pub power1: Option<f64>,
    pub power2: Option<f64>,
    pub power3: Option<f64>,
    pub power_n: Option<f64>,
    /// Total power in kW
    pub power: Option<f64>,

    pub car_connected: Option<Decoded<CarState>>,
    pub allow_charging: Option<Decoded<bool>>,
    pub cable_lock: Option<Decoded<CableLockMode>>,
    pub error_state: Option<Decoded<ErrorState>>,
    pub access_state: Option<Decoded<AccessState>>,
    pub access_control: Option<Decoded<AccessControl>>,
    pub mode: Option<Decoded<LoadMode>>,

    pub amp: Option<i64>,
    pub energy_counter_since_start: Option<f64>,
    pub energy_counter_total: Option<f64>,
    pub cable_type: Option<PropertyValue>,
    pub frequency: Option<PropertyValue>,
    pub phases: Option<PropertyValue>,
    pub firmware: Option<String>,
    pub wifi_ssid: Option<String>,
    pub version: Option<String>,
    pub cloud_api_enabled: Option<bool>,
    pub cloud_api_key: Option<String>,
    pub update_available: Option<bool>,
}

/// Number of `nrg` entries the projection reads
const NRG_LEN: usize = 12;

/// W to kW
const NRG_POWER_SCALE: f64 = 0.001;

impl DerivedFields {
    /// Recompute the field(s) backed by `key`
    pub fn update(&mut self, key: &str, value: &PropertyValue) {
        match key {
            "nrg" => self.update_nrg(value),
            "car" => self.car_connected = decode_code(key, value),
            "alw" => self.allow_charging = decode_code(key, value),
            "ust" => self.cable_lock = decode_code(key, value),
            "err" => self.error_state = decode_code(key, value),
            "acs" => self.access_state = decode_code(key, value),
            "ast" => self.access_control = decode_code(key, value),
            "lmo" => self.mode = decode_code(key, value),
            "amp" => self.amp = expect_shape(key, value, value.as_i64()),
            "wh" => self.energy_counter_since_start = expect_shape(key, value, value.as_f64()),
            "eto" => self.energy_counter_total = expect_shape(key, value, value.as_f64()),
            "cbl" => self.cable_type = Some(value.clone()),
            "fhz" => self.frequency = Some(value.clone()),
            "pha" => self.phases = Some(value.clone()),
            "fwv" => self.firmware = expect_shape(key, value, value.as_str().map(str::to_string)),
            "wss" => self.wifi_ssid = expect_shape(key, value, value.as_str().map(str::to_string)),
            "version" => {
                self.version = expect_shape(key, value, value.as_str().map(str::to_string))
            }
            "cae" => self.cloud_api_enabled = expect_shape(key, value, value.as_bool()),
            "cak" => {
                self.cloud_api_key = expect_shape(key, value, value.as_str().map(str::to_string))
            }
            "upd" => self.update_available = Some(update_flag(value)),
            _ => {}
        }
    }

    fn update_nrg(&mut self, value: &PropertyValue) {
        let readings: Option<Vec<f64>> = value
            .as_list()
            .filter(|items| items.len() >= NRG_LEN)
            .and_then(|items| items[..NRG_LEN].iter().map(PropertyValue::as_f64).collect());

        let Some(r) = readings else {
            warn!(shape = value.kind(), "Undecodable nrg value, clearing energy readings");
            self.set_nrg([None; NRG_LEN]);
            return;
        };

        let mut fields = [None; NRG_LEN];
        for (i, reading) in r.iter().enumerate() {
            fields[i] = Some(if i >= 7 { reading * NRG_POWER_SCALE } else { *reading });
        }
        self.set_nrg(fields);
    }

    fn set_nrg(&mut self, f: [Option<f64>; NRG_LEN]) {
        self.voltage1 = f[0];
        self.voltage2 = f[1];
        self.voltage3 = f[2];
        self.voltage_n = f[3];
        self.amps1 = f[4];
        self.amps2 = f[5];
        self.amps3 = f[6];
        self.power1 = f[7];
        self.power2 = f[8];
        self.power3 = f[9];
        self.power_n = f[10];
        self.power = f[11];
    }
}

fn decode_code<T: CodeTable>(key: &str, value: &PropertyValue) -> Option<Decoded<T>> {
    match value.as_i64() {
        Some(code) => {
            let decoded = Decoded::from_code(code);
            if decoded.known().is_none() {
                debug!(key, code, "Code outside the known table");
            }
            Some(decoded)
        }
        None => {
            warn!(key, shape = value.kind(), "Non-integer code, clearing derived field");
            None
        }
    }
}

fn expect_shape<T>(key: &str, value: &PropertyValue, decoded: Option<T>) -> Option<T> {
    if decoded.is_none() && !value.is_null() {
        warn!(key, shape = value.kind(), "Unexpected property shape, clearing derived field");
    }
    decoded
}

/// `upd`: "0", 0 and false mean no update, anything else means one is available
fn update_flag(value: &PropertyValue) -> bool {
    !matches!(
        value,
        PropertyValue::Bool(false) | PropertyValue::Int(0)
    ) && value.as_str() != Some("0")
}

// ============================================================================
// Store
// ============================================================================

/// Result of applying a full status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullApply {
    /// Every key of the payload in arrival order
    pub changed: Vec<(String, PropertyValue)>,
    /// True exactly once per connection, on the first non-partial full status
    pub newly_initialized: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    values: HashMap<String, PropertyValue>,
    derived: DerivedFields,
    initialized: bool,
    last_updated: Option<DateTime<Utc>>,
}

/// Shared, internally synchronized property store
#[derive(Debug, Clone, Default)]
pub struct PropertyStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `fullStatus` payload
    pub fn apply_full(&self, status: &Map<String, Value>, partial: bool) -> FullApply {
        let mut inner = self.inner.write();
        let changed = merge(&mut inner, status);

        let newly_initialized = !partial && !inner.initialized;
        if newly_initialized {
            inner.initialized = true;
            debug!(properties = inner.values.len(), "All properties initialized");
        }

        FullApply {
            changed,
            newly_initialized,
        }
    }

    /// Merge a `deltaStatus` payload
    pub fn apply_delta(&self, status: &Map<String, Value>) -> Vec<(String, PropertyValue)> {
        merge(&mut self.inner.write(), status)
    }

    /// Merge the status echoed by a successful `response`
    pub fn apply_response(&self, status: &Map<String, Value>) -> Vec<(String, PropertyValue)> {
        merge(&mut self.inner.write(), status)
    }

    pub fn get(&self, key: &str) -> Option<PropertyValue> {
        self.inner.read().values.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().values.contains_key(key)
    }

    /// Snapshot of all raw properties
    pub fn all(&self) -> HashMap<String, PropertyValue> {
        self.inner.read().values.clone()
    }

    /// Snapshot of the derived fields
    pub fn derived(&self) -> DerivedFields {
        self.inner.read().derived.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().initialized
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_updated
    }

    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().values.is_empty()
    }

    /// Reset the initialized flag for a new connection, keeping last known values
    pub fn begin_connection(&self) {
        self.inner.write().initialized = false;
    }
}

fn merge(inner: &mut StoreInner, status: &Map<String, Value>) -> Vec<(String, PropertyValue)> {
    let mut changed = Vec::with_capacity(status.len());

    for (key, raw) in status {
        let value = PropertyValue::from(raw.clone());
        if let Some(previous) = inner.values.get(key) {
            if !previous.is_null() && !value.is_null() && previous.kind() != value.kind() {
                debug!(
                    key = key.as_str(),
                    from = previous.kind(),
                    to = value.kind(),
                    "Property changed shape"
                );
            }
        }
        inner.derived.update(key, &value);
        inner.values.insert(key.clone(), value.clone());
        changed.push((key.clone(), value));
    }

    if !status.is_empty() {
        inner.last_updated = Some(Utc::now());
    }
    changed
}
