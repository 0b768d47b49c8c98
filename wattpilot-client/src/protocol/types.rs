//! Charger protocol enumerations
//!
//! Static lookup tables for the small integer codes the charger reports in
//! well-known properties, plus the password hash schemes it negotiates.
//! Codes outside a table are kept as [`Decoded::Unknown`] instead of failing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Device type reported in `hello` by the Flex hardware variant
pub const FLEX_DEVICE_TYPE: &str = "wattpilot_flex";

// ============================================================================
// Hash schemes
// ============================================================================

/// Password hash scheme negotiated during authentication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashScheme {
    /// PBKDF2-HMAC-SHA512, used by the legacy firmware
    #[default]
    Pbkdf2,
    /// bcrypt over the SHA-256 of the password, used by Flex devices
    Bcrypt,
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashScheme::Pbkdf2 => write!(f, "pbkdf2"),
            HashScheme::Bcrypt => write!(f, "bcrypt"),
        }
    }
}

/// Error for scheme names the client does not implement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hash scheme: {0}")]
pub struct UnknownHashScheme(pub String);

impl FromStr for HashScheme {
    type Err = UnknownHashScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pbkdf2" => Ok(HashScheme::Pbkdf2),
            "bcrypt" => Ok(HashScheme::Bcrypt),
            other => Err(UnknownHashScheme(other.to_string())),
        }
    }
}

// ============================================================================
// Code tables
// ============================================================================

/// A fixed table mapping integer codes to typed values
pub trait CodeTable: Sized + Copy {
    /// Look up a code, `None` when the table has no entry
    fn from_code(code: i64) -> Option<Self>;
}

/// A decoded table value, or the raw code when the table has no entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Decoded<T> {
    Known(T),
    Unknown(i64),
}

impl<T: CodeTable> Decoded<T> {
    pub fn from_code(code: i64) -> Self {
        T::from_code(code).map_or(Decoded::Unknown(code), Decoded::Known)
    }

    /// The decoded value, if the code was in the table
    pub fn known(&self) -> Option<T> {
        match self {
            Decoded::Known(value) => Some(*value),
            Decoded::Unknown(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoded::Known(value) => fmt::Display::fmt(value, f),
            Decoded::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// `alw`: whether the car is allowed to charge
impl CodeTable for bool {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }
}

macro_rules! code_table {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Wire code of this value
            pub fn code(self) -> i64 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Human readable label
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl CodeTable for $name {
            fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

code_table! {
    /// `car`: car connection state
    CarState {
        NoCar = 1 => "no car",
        Charging = 2 => "charging",
        Ready = 3 => "ready",
        Complete = 4 => "complete",
    }
}

code_table! {
    /// `ust`: cable lock behaviour
    CableLockMode {
        Normal = 0 => "Normal",
        AutoUnlock = 1 => "AutoUnlock",
        AlwaysLock = 2 => "AlwaysLock",
    }
}

code_table! {
    /// `err`: charger error / activity state
    ErrorState {
        Unknown = 0 => "Unknown Error",
        Idle = 1 => "Idle",
        Charging = 2 => "Charging",
        WaitCar = 3 => "Wait Car",
        Complete = 4 => "Complete",
        Error = 5 => "Error",
    }
}

code_table! {
    /// `acs`: access state
    AccessState {
        Open = 0 => "Open",
        Wait = 1 => "Wait",
    }
}

code_table! {
    /// `ast`: access control mode
    AccessControl {
        Open = 0 => "open",
        Locked = 1 => "locked",
        Auto = 2 => "auto",
    }
}

code_table! {
    /// `lmo`: load mode
    LoadMode {
        Default = 3 => "Default",
        Eco = 4 => "Eco",
        NextTrip = 5 => "Next Trip",
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "3" => Ok(LoadMode::Default),
            "eco" | "4" => Ok(LoadMode::Eco),
            "nexttrip" | "next_trip" | "next trip" | "5" => Ok(LoadMode::NextTrip),
            _ => Err(format!("unknown load mode: {}", s)),
        }
    }
}
