//! Session id generation (part of C4, `spec.md` §4.4).

use rand::Rng;

use mudproxy_core::SessionId;

const ID_LEN: usize = 24;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Maximum number of times [`crate::registry::SessionRegistry::create`]
/// retries generating an id before giving up (collisions are astronomically
/// unlikely at 24 characters from a 36-symbol alphabet; this bound exists
/// only to make the retry loop provably terminating).
pub const MAX_ID_COLLISION_RETRIES: usize = 8;

/// Draws a fresh 24-character lowercase-alphanumeric session id.
#[must_use]
pub fn generate_session_id() -> SessionId {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ids_of_expected_length_and_alphabet() {
        for _ in 0..100 {
            let id = generate_session_id();
            assert_eq!(id.len(), ID_LEN);
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn generates_distinct_ids() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
