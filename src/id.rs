//! Opaque identities for sessions and engines.

use rand::RngExt;

/// A random 128-bit identity rendered as 32 lowercase hex characters.
pub fn generate() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
