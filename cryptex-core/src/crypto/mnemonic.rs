//! One-time pairing mnemonics.
//!
//! A mnemonic is 160 random bits rendered as 32 base32 characters in
//! dash-separated groups of four, e.g. `K7QW-3MXA-...`. It is shown once to
//! the operator and never sent over the network.

use crate::crypto::random_bytes;
use data_encoding::BASE32_NOPAD;
use zeroize::Zeroizing;

/// Entropy carried by a mnemonic, in bytes.
pub const MNEMONIC_ENTROPY_LEN: usize = 20;

const GROUP_LEN: usize = 4;

/// Generate a fresh mnemonic from the OS RNG.
pub fn generate() -> Zeroizing<String> {
    let entropy = Zeroizing::new(random_bytes::<MNEMONIC_ENTROPY_LEN>());
    let encoded = Zeroizing::new(BASE32_NOPAD.encode(&entropy[..]));
    group(&encoded)
}

/// Canonical form of operator input: uppercase, whitespace dropped, groups
/// rejoined with dashes.
pub fn normalize(input: &str) -> Zeroizing<String> {
    let compact: Zeroizing<String> = Zeroizing::new(
        input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect(),
    );
    group(&compact)
}

fn group(compact: &str) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(compact.len() + compact.len() / GROUP_LEN));
    for (i, c) in compact.chars().enumerate() {
        if i > 0 && i % GROUP_LEN == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}
