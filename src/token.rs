//! The anonymous-update hash chain.
//!
//! A submitter keeps a random `seed` it never discloses. Its n-th record
//! carries `update_token(replacement_token(seed, n))`. To amend record n the
//! submitter reveals only `replacement_token(seed, n)`; the server re-derives
//! the update token and finds the record. Tokens for different n are
//! unlinkable without the seed, and the update token cannot be inverted to
//! the replacement token.
//!
//! The fold construction (XOR of the two SHA-1 digest halves, formatted `%X`
//! with no leading zeros) is preserved exactly for interoperability with
//! deployed clients; do not "improve" it.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};

fn sha1_hex(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let mut out = String::with_capacity(40);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn fold_digest(hex40: &str) -> String {
    // 40 hex chars = 20 bytes; XOR the 80-bit halves.
    let hi = u128::from_str_radix(&hex40[..20], 16).unwrap_or(0);
    let lo = u128::from_str_radix(&hex40[20..], 16).unwrap_or(0);
    format!("{:X}", hi ^ lo)
}

/// One-way per-index token a client discloses to authorize an amendment.
pub fn replacement_token(seed: &str, n: usize) -> String {
    sha1_hex(&format!("{seed}{n}"))
}

/// Short one-way index key stored with a record; derived from the
/// replacement token with a second hash plus fold.
pub fn update_token(replacement: &str) -> String {
    fold_digest(&sha1_hex(replacement))
}

/// Random alphanumeric string; used for the process self-token.
pub fn random_ascii(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
