//! Password hashing for the charger handshake
//!
//! The charger never sees the plaintext password. Both sides derive a 32-ish
//! character ASCII secret from the password and the device serial, and that
//! secret keys the challenge-response digest and the HMAC of secured messages.
//!
//! Two schemes exist:
//! - PBKDF2-HMAC-SHA512 (legacy firmware, the default)
//! - bcrypt over the SHA-256 hex digest of the password (Flex devices), salted
//!   with the serial encoded by the bcrypt.js base64 variant

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::protocol::types::HashScheme;

/// PBKDF2 iteration count used by the firmware
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Bytes derived by PBKDF2 before base64 encoding
const PBKDF2_OUTPUT_LEN: usize = 256;

/// Characters of the base64 PBKDF2 output that form the secret
pub const PBKDF2_SECRET_LEN: usize = 32;

/// bcrypt cost factor used by Flex devices
pub const BCRYPT_COST: u32 = 8;

/// Length of the bcrypt salt in bytes (serial digits, zero padded)
const BCRYPT_SALT_LEN: usize = 16;

/// bcrypt.js base64 alphabet
const BCRYPTJS_ALPHABET: &[u8; 64] =
    b"./ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Errors while deriving a password hash
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Serial must contain only digits for bcrypt hashing: {0}")]
    NonNumericSerial(String),

    #[error("Serial is longer than 16 digits: {0}")]
    SerialTooLong(String),

    #[error("Illegal base64 length {length} for {available} bytes")]
    IllegalLength { length: usize, available: usize },

    #[error("Bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    #[error("Bcrypt output does not start with the expected salt")]
    UnexpectedBcryptOutput,
}

/// Hashed password used as challenge input and HMAC key
#[derive(Clone, PartialEq, Eq)]
pub struct HashedPassword(Vec<u8>);

impl HashedPassword {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for HashedPassword {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashedPassword(<{} bytes>)", self.0.len())
    }
}

/// Derive the hashed password for a scheme
pub fn hash_password(
    password: &str,
    serial: &str,
    scheme: HashScheme,
) -> Result<HashedPassword, HashError> {
    match scheme {
        HashScheme::Pbkdf2 => Ok(pbkdf2_hash(password, serial)),
        HashScheme::Bcrypt => bcrypt_hash(password, serial),
    }
}

/// PBKDF2-HMAC-SHA512 with the serial as salt, base64 encoded and truncated
pub fn pbkdf2_hash(password: &str, serial: &str) -> HashedPassword {
    let mut derived = [0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        serial.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut derived,
    );

    let mut encoded = STANDARD.encode(derived);
    encoded.truncate(PBKDF2_SECRET_LEN);
    HashedPassword::from(encoded)
}

/// bcrypt hash compatible with the Flex firmware
///
/// The password is pre-hashed with SHA-256 (hex), then run through bcrypt with
/// cost [`BCRYPT_COST`] and a salt built from the serial digits. The secret is
/// the part of the bcrypt string that follows the salt.
pub fn bcrypt_hash(password: &str, serial: &str) -> Result<HashedPassword, HashError> {
    let prehash = hex::encode(Sha256::digest(password.as_bytes()));
    let salt_bytes = serial_salt(serial)?;
    let salt = bcrypt_salt_string(serial, BCRYPT_COST)?;

    let parts = bcrypt::hash_with_salt(prehash.as_bytes(), BCRYPT_COST, salt_bytes)?;
    let formatted = parts.format_for_version(bcrypt::Version::TwoA);

    let secret = formatted
        .strip_prefix(salt.as_str())
        .ok_or(HashError::UnexpectedBcryptOutput)?;
    Ok(HashedPassword::from(secret.to_string()))
}

/// Salt string `$2a$<cost>$<bcryptjs base64 of the serial digits>`
pub fn bcrypt_salt_string(serial: &str, cost: u32) -> Result<String, HashError> {
    let salt = serial_salt(serial)?;
    Ok(format!(
        "$2a${:02}${}",
        cost,
        bcryptjs_base64(&salt, BCRYPT_SALT_LEN)?
    ))
}

/// Serial digits as byte values, left padded with zeros to 16 bytes
fn serial_salt(serial: &str) -> Result<[u8; BCRYPT_SALT_LEN], HashError> {
    if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HashError::NonNumericSerial(serial.to_string()));
    }
    if serial.len() > BCRYPT_SALT_LEN {
        return Err(HashError::SerialTooLong(serial.to_string()));
    }

    let mut salt = [0u8; BCRYPT_SALT_LEN];
    let offset = BCRYPT_SALT_LEN - serial.len();
    for (slot, digit) in salt[offset..].iter_mut().zip(serial.bytes()) {
        *slot = digit - b'0';
    }
    Ok(salt)
}

/// Base64 as implemented by bcrypt.js `encodeBase64`
///
/// Encodes the first `length` bytes with the bcrypt alphabet and no padding.
pub fn bcryptjs_base64(bytes: &[u8], length: usize) -> Result<String, HashError> {
    if length == 0 || length > bytes.len() {
        return Err(HashError::IllegalLength {
            length,
            available: bytes.len(),
        });
    }

    let code = |index: u8| BCRYPTJS_ALPHABET[usize::from(index & 0x3f)] as char;
    let mut out = String::with_capacity((length * 4).div_ceil(3));
    let mut off = 0;

    while off < length {
        let c1 = bytes[off];
        off += 1;
        out.push(code(c1 >> 2));
        let mut acc = (c1 & 0x03) << 4;
        if off >= length {
            out.push(code(acc));
            break;
        }

        let c2 = bytes[off];
        off += 1;
        acc |= c2 >> 4;
        out.push(code(acc));
        acc = (c2 & 0x0f) << 2;
        if off >= length {
            out.push(code(acc));
            break;
        }

        let c3 = bytes[off];
        off += 1;
        acc |= c3 >> 6;
        out.push(code(acc));
        out.push(code(c3));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &str = "s3cretPassw0rd";
    const SERIAL: &str = "12345678";

    #[test]
    fn test_pbkdf2_reference() {
        let hashed = pbkdf2_hash(PASSWORD, SERIAL);
        assert_eq!(hashed.len(), PBKDF2_SECRET_LEN);
        assert_eq!(hashed.as_bytes(), b"+MIg7uBK4vuXXH5K29UIRcHeYROuy3uC");
    }

    #[test]
    fn test_bcrypt_salt_string() {
        let salt = bcrypt_salt_string(SERIAL, BCRYPT_COST).unwrap();
        assert_eq!(salt, "$2a$08$.........../.eKC/OWFA.");
    }

    #[test]
    fn test_bcrypt_reference() {
        let hashed = bcrypt_hash(PASSWORD, SERIAL).unwrap();
        assert_eq!(hashed.as_bytes(), b"HK006/74h5BD9VaS75BZSpIhIAD8LCC");
    }

    #[test]
    fn test_hash_password_dispatches_on_scheme() {
        let pbkdf2 = hash_password(PASSWORD, SERIAL, HashScheme::Pbkdf2).unwrap();
        let bcrypt = hash_password(PASSWORD, SERIAL, HashScheme::Bcrypt).unwrap();
        assert_ne!(pbkdf2, bcrypt);
        assert_eq!(pbkdf2, pbkdf2_hash(PASSWORD, SERIAL));
    }

    #[test]
    fn test_bcrypt_rejects_non_numeric_serial() {
        assert!(matches!(
            bcrypt_hash(PASSWORD, "12AB5678"),
            Err(HashError::NonNumericSerial(_))
        ));
        assert!(matches!(
            bcrypt_hash(PASSWORD, "12345678901234567"),
            Err(HashError::SerialTooLong(_))
        ));
    }

    #[test]
    fn test_bcryptjs_base64_partial_blocks() {
        assert_eq!(bcryptjs_base64(&[0xff], 1).unwrap(), "9u");
        assert_eq!(bcryptjs_base64(&[0x00, 0x00], 2).unwrap(), "...");
        assert_eq!(bcryptjs_base64(&[0x00, 0x00, 0x00], 3).unwrap(), "....");
        assert!(bcryptjs_base64(&[1, 2], 3).is_err());
        assert!(bcryptjs_base64(&[1, 2], 0).is_err());
    }

    #[test]
    fn test_hashed_password_debug_is_redacted() {
        let hashed = HashedPassword::from("secret".to_string());
        assert_eq!(format!("{:?}", hashed), "HashedPassword(<6 bytes>)");
    }
}
