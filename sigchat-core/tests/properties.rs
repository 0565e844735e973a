//! Property tests for key derivation, signing and verification

use proptest::prelude::*;
use sigchat_core::crypto::{
    create_message_hash, derive_key_pair, sign_envelope_at, verify_with_key, SignedEnvelope,
    VerificationError,
};

const TIMESTAMP: &str = "2025-01-01T12:00:00.000Z";

fn username() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{2,15}"
}

fn passphrase() -> impl Strategy<Value = String> {
    "[ -~]{1,32}"
}

fn message() -> impl Strategy<Value = String> {
    "[ -~]{1,64}"
}

fn signed(sender: &str, receiver: &str, text: &str, passphrase: &str) -> SignedEnvelope {
    let kp = derive_key_pair(sender, passphrase).unwrap();
    sign_envelope_at(sender, receiver, text, TIMESTAMP, &kp.private_key).unwrap()
}

/// Replace the hex digit at `index` with a different one
fn flip_hex_digit(hex: &str, index: usize) -> String {
    let mut chars: Vec<char> = hex.chars().collect();
    let i = index % chars.len();
    chars[i] = if chars[i] == '0' { '1' } else { '0' };
    chars.into_iter().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn derivation_is_deterministic(user in username(), pass in passphrase()) {
        let first = derive_key_pair(&user, &pass).unwrap();
        let second = derive_key_pair(&user, &pass).unwrap();
        prop_assert_eq!(first.hex().unwrap(), second.hex().unwrap());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn different_passphrases_give_different_keys(
        user in username(),
        a in passphrase(),
        b in passphrase(),
    ) {
        prop_assume!(a != b);
        let ka = derive_key_pair(&user, &a).unwrap();
        let kb = derive_key_pair(&user, &b).unwrap();
        prop_assert_ne!(ka.public_key, kb.public_key);
    }

    #[test]
    fn signed_envelopes_verify(
        sender in username(),
        receiver in username(),
        text in message(),
        pass in passphrase(),
    ) {
        let envelope = signed(&sender, &receiver, &text, &pass);
        let kp = derive_key_pair(&sender, &pass).unwrap();
        prop_assert!(envelope.hash_is_consistent());
        prop_assert_eq!(verify_with_key(&envelope, &kp.public_key), Ok(()));

        // Survives the wire
        let decoded: SignedEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        prop_assert_eq!(verify_with_key(&decoded, &kp.public_key.public_only()), Ok(()));
    }

    #[test]
    fn edited_plaintext_is_detected(
        text in message(),
        index in any::<usize>(),
        bit in 0u8..7,
    ) {
        let envelope = signed("alice", "bob", &text, "pw");
        let kp = derive_key_pair("alice", "pw").unwrap();

        let mut bytes = text.clone().into_bytes();
        let i = index % bytes.len();
        bytes[i] ^= 1 << bit;
        let edited = String::from_utf8(bytes).unwrap();
        prop_assume!(edited != text);

        let mut tampered = envelope.clone();
        tampered.plaintext_message = edited.clone();
        let is_hash_mismatch = matches!(
            verify_with_key(&tampered, &kp.public_key),
            Err(VerificationError::HashMismatch { .. })
        );
        prop_assert!(is_hash_mismatch);

        // A forger who also recomputes the hash still lacks the signature
        tampered.message_hash = create_message_hash("alice", "bob", &edited, TIMESTAMP);
        prop_assert_eq!(
            verify_with_key(&tampered, &kp.public_key),
            Err(VerificationError::SignatureInvalid)
        );
    }

    #[test]
    fn edited_timestamp_is_detected(text in message(), seconds in 1u32..59) {
        let envelope = signed("alice", "bob", &text, "pw");
        let kp = derive_key_pair("alice", "pw").unwrap();

        let mut tampered = envelope;
        tampered.timestamp = format!("2025-01-01T12:00:{:02}.000Z", seconds);
        prop_assert!(verify_with_key(&tampered, &kp.public_key).is_err());

        tampered.message_hash = tampered.compute_hash();
        prop_assert_eq!(
            verify_with_key(&tampered, &kp.public_key),
            Err(VerificationError::SignatureInvalid)
        );
    }

    #[test]
    fn edited_signature_is_detected(text in message(), index in any::<usize>(), use_r in any::<bool>()) {
        let envelope = signed("alice", "bob", &text, "pw");
        let kp = derive_key_pair("alice", "pw").unwrap();

        let mut tampered = envelope;
        if use_r {
            tampered.signature.r = flip_hex_digit(&tampered.signature.r, index);
        } else {
            tampered.signature.s = flip_hex_digit(&tampered.signature.s, index);
        }
        prop_assert!(verify_with_key(&tampered, &kp.public_key).is_err());
    }

    #[test]
    fn other_users_key_is_rejected(text in message(), pass in passphrase()) {
        let envelope = signed("alice", "bob", &text, &pass);
        let mallory = derive_key_pair("mallory", &pass).unwrap();
        prop_assert_eq!(
            verify_with_key(&envelope, &mallory.public_key),
            Err(VerificationError::SignatureInvalid)
        );
    }
}
