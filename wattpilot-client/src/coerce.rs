//! Caller-facing value coercion
//!
//! Turns user-supplied text (CLI arguments, UI fields) into the property value
//! shape the charger expects.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::warn;

use crate::properties::PropertyValue;

/// Type to force a raw value into, overriding inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceType {
    Bool,
    Int,
    Float,
    Str,
}

impl FromStr for ForceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(ForceType::Bool),
            "int" | "integer" => Ok(ForceType::Int),
            "float" | "number" => Ok(ForceType::Float),
            "str" | "string" => Ok(ForceType::Str),
            _ => Err(format!("unknown value type: {}", s)),
        }
    }
}

impl fmt::Display for ForceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForceType::Bool => "bool",
            ForceType::Int => "int",
            ForceType::Float => "float",
            ForceType::Str => "str",
        };
        f.write_str(name)
    }
}

/// Infer a property value from text
///
/// Precedence: forced type, then `true`/`false` (any case), then integer,
/// then decimal, then string. A forced conversion that fails yields the text.
pub fn coerce_str(raw: &str, force: Option<ForceType>) -> PropertyValue {
    if let Some(force) = force {
        return match forced(raw, force) {
            Some(value) => value,
            None => {
                warn!(raw, %force, "Value does not convert to forced type, sending as string");
                PropertyValue::Str(raw.to_string())
            }
        };
    }

    if let Some(b) = parse_bool(raw) {
        PropertyValue::Bool(b)
    } else if is_integer(raw) {
        // Digits beyond i64 still make a usable number
        raw.parse::<i64>()
            .map(PropertyValue::Int)
            .or_else(|_| raw.parse::<f64>().map(PropertyValue::Float))
            .unwrap_or_else(|_| PropertyValue::Str(raw.to_string()))
    } else if is_decimal(raw) {
        raw.parse::<f64>()
            .map(PropertyValue::Float)
            .unwrap_or_else(|_| PropertyValue::Str(raw.to_string()))
    } else {
        PropertyValue::Str(raw.to_string())
    }
}

/// Apply a forced type to an already structured value
///
/// Records and lists pass through unchanged; strings go through
/// [`coerce_str`]; other scalars are converted when forced.
pub fn coerce(value: PropertyValue, force: Option<ForceType>) -> PropertyValue {
    match (value, force) {
        (value @ (PropertyValue::Record(_) | PropertyValue::List(_)), _) => value,
        (PropertyValue::Str(raw), force) => coerce_str(&raw, force),
        (value, None) => value,
        (value, Some(ForceType::Str)) => PropertyValue::Str(value.to_string()),
        (value, Some(force)) => {
            let text = value.to_string();
            forced(&text, force).unwrap_or(value)
        }
    }
}

/// Value from user input, which may be JSON for lists and records
///
/// Text holding a JSON array or object becomes a structured value unless
/// [`ForceType::Str`] is forced; everything else goes through [`coerce_str`].
pub fn coerce_input(raw: &str, force: Option<ForceType>) -> PropertyValue {
    if force != Some(ForceType::Str) && raw.trim_start().starts_with(['[', '{']) {
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ (Value::Array(_) | Value::Object(_))) => {
                return coerce(PropertyValue::from(value), force)
            }
            Ok(_) => {}
            Err(e) => warn!(raw, error = %e, "Value looks like JSON but does not parse"),
        }
    }
    coerce_str(raw, force)
}

fn forced(raw: &str, force: ForceType) -> Option<PropertyValue> {
    match force {
        ForceType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(PropertyValue::Bool(true)),
            "false" | "0" => Some(PropertyValue::Bool(false)),
            _ => None,
        },
        ForceType::Int => raw.parse::<i64>().ok().map(PropertyValue::Int).or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| PropertyValue::Int(f as i64))
        }),
        ForceType::Float => raw.parse::<f64>().ok().map(PropertyValue::Float),
        ForceType::Str => Some(PropertyValue::Str(raw.to_string())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn is_integer(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_decimal(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    match digits.split_once('.') {
        Some((whole, frac)) => {
            !(whole.is_empty() && frac.is_empty())
                && whole.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
