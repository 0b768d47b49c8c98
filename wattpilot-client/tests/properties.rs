//! Property tests for the hasher, codec, coercion and store
//!
//! Tests invariants for:
//! - bcrypt.js base64: agrees with the bcrypt alphabet engine
//! - PBKDF2: deterministic, fixed length, base64 alphabet
//! - Auth digest and secured messages: keyed, input sensitive
//! - Store: delta application is idempotent and never coalesces

use base64::alphabet;
use base64::engine::{general_purpose, GeneralPurpose};
use base64::Engine;
use proptest::prelude::*;
use serde_json::{Map, Value};

use wattpilot_client::hash::{bcryptjs_base64, pbkdf2_hash, PBKDF2_SECRET_LEN};
use wattpilot_client::protocol::messages::{auth_hash, hmac_sha256_hex, OutboundMessage};
use wattpilot_client::{coerce_str, HashedPassword, PropertyStore, PropertyValue};

const BCRYPT_ENGINE: GeneralPurpose =
    GeneralPurpose::new(&alphabet::BCRYPT, general_purpose::NO_PAD);

// ============================================================================
// Strategies
// ============================================================================

fn serial() -> impl Strategy<Value = String> {
    "[0-9]{8}"
}

fn token() -> impl Strategy<Value = String> {
    "[a-f0-9]{8,32}"
}

fn status_payload() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{2,4}", any::<i64>(), 1..12).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect()
    })
}

// ============================================================================
// Hasher
// ============================================================================

proptest! {
    /// bcrypt.js base64 is standard bit order over the bcrypt alphabet
    #[test]
    fn bcryptjs_base64_matches_bcrypt_alphabet(bytes in prop::collection::vec(any::<u8>(), 1..48)) {
        let ours = bcryptjs_base64(&bytes, bytes.len()).unwrap();
        prop_assert_eq!(ours, BCRYPT_ENGINE.encode(&bytes));
    }

    /// Encoding a prefix only looks at the prefix
    #[test]
    fn bcryptjs_base64_prefix(bytes in prop::collection::vec(any::<u8>(), 2..32), cut in 1usize..32) {
        let len = cut.min(bytes.len());
        let prefix = bcryptjs_base64(&bytes, len).unwrap();
        prop_assert_eq!(prefix, bcryptjs_base64(&bytes[..len], len).unwrap());
    }
}

proptest! {
    // 100k PBKDF2 rounds per case
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn pbkdf2_deterministic_and_sized(password in "[ -~]{1,24}", serial in serial()) {
        let a = pbkdf2_hash(&password, &serial);
        let b = pbkdf2_hash(&password, &serial);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), PBKDF2_SECRET_LEN);
        prop_assert!(a
            .as_bytes()
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || *c == b'+' || *c == b'/'));
    }
}

// ============================================================================
// Digests
// ============================================================================

proptest! {
    #[test]
    fn auth_hash_is_input_sensitive(
        token1 in token(),
        token2 in token(),
        token3 in token(),
        key in "[A-Za-z0-9+/]{32}",
    ) {
        let hash = auth_hash(&token1, &token2, &token3, key.as_bytes());
        prop_assert_eq!(hash.len(), 64);
        prop_assert_eq!(&hash, &auth_hash(&token1, &token2, &token3, key.as_bytes()));

        let other_token1 = format!("{}0", token1);
        prop_assert_ne!(&hash, &auth_hash(&other_token1, &token2, &token3, key.as_bytes()));
        let other_token2 = format!("{}0", token2);
        prop_assert_ne!(&hash, &auth_hash(&token1, &other_token2, &token3, key.as_bytes()));
        let other_token3 = format!("{}0", token3);
        prop_assert_ne!(&hash, &auth_hash(&token1, &token2, &other_token3, key.as_bytes()));
        let other_key = format!("{}x", key);
        prop_assert_ne!(&hash, &auth_hash(&token1, &token2, &token3, other_key.as_bytes()));
    }

    #[test]
    fn secured_message_verifies(request_id in 1u64..1_000_000, amps in 6i64..32, key in "[A-Za-z0-9+/]{32}") {
        let hashed = HashedPassword::from(key.clone());
        let message = OutboundMessage::set_value(request_id, "amp", PropertyValue::Int(amps));

        match message.secure(&hashed).unwrap() {
            OutboundMessage::SecuredMsg { data, request_id: wrapped_id, hmac } => {
                prop_assert_eq!(wrapped_id, format!("{}sm", request_id));
                prop_assert_eq!(&data, &message.to_json().unwrap());
                prop_assert_eq!(hmac, hmac_sha256_hex(key.as_bytes(), data.as_bytes()).unwrap());
            }
            other => prop_assert!(false, "expected securedMsg, got {:?}", other),
        }
    }
}

// ============================================================================
// Coercion and store
// ============================================================================

proptest! {
    #[test]
    fn integers_coerce_to_int(n in any::<i64>()) {
        prop_assert_eq!(coerce_str(&n.to_string(), None), PropertyValue::Int(n));
    }

    #[test]
    fn booleans_coerce_in_any_case(b in any::<bool>(), upper in any::<bool>()) {
        let text = if upper { b.to_string().to_uppercase() } else { b.to_string() };
        prop_assert_eq!(coerce_str(&text, None), PropertyValue::Bool(b));
    }

    /// Applying the same delta twice leaves the same state and reports every key both times
    #[test]
    fn delta_is_idempotent(base in status_payload(), delta in status_payload()) {
        let store = PropertyStore::new();
        store.apply_full(&base, false);

        let first = store.apply_delta(&delta);
        let after_first = store.all();
        let second = store.apply_delta(&delta);

        prop_assert_eq!(store.all(), after_first);
        prop_assert_eq!(first.len(), delta.len());
        prop_assert_eq!(&first, &second);
        prop_assert!(store.is_initialized());
    }

    /// Keys absent from a delta keep their value
    #[test]
    fn delta_merges(base in status_payload(), delta in status_payload()) {
        let store = PropertyStore::new();
        store.apply_full(&base, false);
        store.apply_delta(&delta);

        for (key, value) in &base {
            let expected = delta.get(key).unwrap_or(value);
            prop_assert_eq!(store.get(key), Some(PropertyValue::from(expected.clone())));
        }
    }
}
