//! Charger wire codec
//!
//! Every frame is a JSON object with a string `type` field:
//! - Charger -> client: hello, authRequired, authSuccess, authError,
//!   fullStatus, deltaStatus, response, clearInverters, updateInverter
//! - Client -> charger: auth, setValue, pairInverter, unpairInverter, and
//!   securedMsg wrapping any request when the charger asks for it

use std::fmt;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::hash::HashedPassword;
use crate::properties::PropertyValue;

/// Suffix the charger expects on request ids of secured messages
pub const SECURED_ID_SUFFIX: &str = "sm";

/// Errors in frame encoding and decoding
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has no string type field")]
    MissingType,

    #[error("Malformed {kind} frame: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },

    #[error("Message carries no request id")]
    MissingRequestId,

    #[error("Invalid HMAC key")]
    InvalidKey,
}

// ============================================================================
// Inbound
// ============================================================================

/// Device identity sent right after the socket opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    #[serde(deserialize_with = "lenient_string")]
    pub serial: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, alias = "friendlyName")]
    pub friendly_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub version: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub devicetype: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub protocol: Option<i64>,
    /// Greater than zero when writes must be wrapped in securedMsg
    #[serde(default, deserialize_with = "lenient_int")]
    pub secured: Option<i64>,
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequiredMessage {
    pub token1: String,
    pub token2: String,
    /// Hash scheme requested by newer firmware
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthErrorMessage {
    #[serde(default)]
    pub message: String,
}

/// Payload of fullStatus and deltaStatus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub status: Map<String, Value>,
    #[serde(default)]
    pub partial: bool,
}

/// Request id as echoed by the charger
///
/// Plain requests carry the integer id, secured ones the string `"<id>sm"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    /// Numeric id with any secured suffix removed
    pub fn numeric(&self) -> Option<u64> {
        match self {
            RequestId::Number(id) => Some(*id),
            RequestId::Text(text) => text
                .strip_suffix(SECURED_ID_SUFFIX)
                .unwrap_or(text)
                .parse()
                .ok(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{}", id),
            RequestId::Text(text) => f.write_str(text),
        }
    }
}

/// Result of a write or device operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: Option<Map<String, Value>>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A decoded charger frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Hello(HelloMessage),
    AuthRequired(AuthRequiredMessage),
    AuthSuccess,
    AuthError(AuthErrorMessage),
    FullStatus(StatusMessage),
    DeltaStatus(StatusMessage),
    Response(ResponseMessage),
    ClearInverters(Value),
    UpdateInverter(Value),
    /// Type this client does not know; kept for forward compatibility
    Unknown { kind: String, raw: Value },
}

impl InboundMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = match &value {
            Value::Object(map) => map
                .get("type")
                .and_then(Value::as_str)
                .ok_or(WireError::MissingType)?
                .to_string(),
            _ => return Err(WireError::NotAnObject),
        };

        let message = match kind.as_str() {
            "hello" => InboundMessage::Hello(typed(&kind, value)?),
            "authRequired" => InboundMessage::AuthRequired(typed(&kind, value)?),
            "authSuccess" => InboundMessage::AuthSuccess,
            "authError" => InboundMessage::AuthError(typed(&kind, value)?),
            "fullStatus" => InboundMessage::FullStatus(typed(&kind, value)?),
            "deltaStatus" => InboundMessage::DeltaStatus(typed(&kind, value)?),
            "response" => InboundMessage::Response(typed(&kind, value)?),
            "clearInverters" => InboundMessage::ClearInverters(value),
            "updateInverter" => InboundMessage::UpdateInverter(value),
            _ => InboundMessage::Unknown { kind, raw: value },
        };
        Ok(message)
    }

    /// Wire name of the frame type
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Hello(_) => "hello",
            InboundMessage::AuthRequired(_) => "authRequired",
            InboundMessage::AuthSuccess => "authSuccess",
            InboundMessage::AuthError(_) => "authError",
            InboundMessage::FullStatus(_) => "fullStatus",
            InboundMessage::DeltaStatus(_) => "deltaStatus",
            InboundMessage::Response(_) => "response",
            InboundMessage::ClearInverters(_) => "clearInverters",
            InboundMessage::UpdateInverter(_) => "updateInverter",
            InboundMessage::Unknown { kind, .. } => kind,
        }
    }
}

fn typed<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, WireError> {
    serde_json::from_value(value).map_err(|source| WireError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

/// Integer field that older firmware sends as a bool (or a numeric string)
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(i64::from(b))),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| D::Error::custom("integer out of range")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected integer, got {:?}", s))),
        Some(other) => Err(D::Error::custom(format!("expected integer, got {}", other))),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected string, got {}", other))),
    }
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Ok(Some(other.to_string())),
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// A frame sent to the charger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    Auth {
        token3: String,
        hash: String,
    },
    #[serde(rename_all = "camelCase")]
    SetValue {
        request_id: u64,
        key: String,
        value: PropertyValue,
    },
    #[serde(rename_all = "camelCase")]
    PairInverter { request_id: u64, inverter_id: String },
    #[serde(rename_all = "camelCase")]
    UnpairInverter { request_id: u64, inverter_id: String },
    #[serde(rename_all = "camelCase")]
    SecuredMsg {
        data: String,
        request_id: String,
        hmac: String,
    },
}

impl OutboundMessage {
    pub fn set_value(request_id: u64, key: impl Into<String>, value: PropertyValue) -> Self {
        OutboundMessage::SetValue {
            request_id,
            key: key.into(),
            value,
        }
    }

    /// Request id of requests that carry one
    pub fn request_id(&self) -> Option<u64> {
        match self {
            OutboundMessage::SetValue { request_id, .. }
            | OutboundMessage::PairInverter { request_id, .. }
            | OutboundMessage::UnpairInverter { request_id, .. } => Some(*request_id),
            OutboundMessage::Auth { .. } | OutboundMessage::SecuredMsg { .. } => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Auth { .. } => "auth",
            OutboundMessage::SetValue { .. } => "setValue",
            OutboundMessage::PairInverter { .. } => "pairInverter",
            OutboundMessage::UnpairInverter { .. } => "unpairInverter",
            OutboundMessage::SecuredMsg { .. } => "securedMsg",
        }
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wrap a request in a securedMsg frame authenticated with the hashed password
    pub fn secure(&self, key: &HashedPassword) -> Result<OutboundMessage, WireError> {
        let request_id = self.request_id().ok_or(WireError::MissingRequestId)?;
        let data = self.to_json()?;
        let hmac = hmac_sha256_hex(key.as_bytes(), data.as_bytes())?;

        Ok(OutboundMessage::SecuredMsg {
            data,
            request_id: format!("{}{}", request_id, SECURED_ID_SUFFIX),
            hmac,
        })
    }
}

// ============================================================================
// Digests
// ============================================================================

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> Result<String, WireError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| WireError::InvalidKey)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Challenge response: `sha256(token3 + token2 + sha256(token1 + hashed))`
pub fn auth_hash(token1: &str, token2: &str, token3: &str, key: &[u8]) -> String {
    let mut inner = Sha256::new();
    inner.update(token1.as_bytes());
    inner.update(key);
    let hash1 = hex::encode(inner.finalize());

    let mut outer = Sha256::new();
    outer.update(token3.as_bytes());
    outer.update(token2.as_bytes());
    outer.update(hash1.as_bytes());
    hex::encode(outer.finalize())
}
