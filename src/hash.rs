//! Hashing and redaction helpers (spec §4.2).
//!
//! These are pure functions with no I/O; callers decide whether/when to hash
//! request and response bodies.

use sha2::{Digest, Sha256};

use crate::util::truncate_utf8_safe;

/// Bound on how much of a body we hash. Truncation is intentional: it bounds
/// memory and is documented in the record semantics, not a correctness bug.
const MAX_HASH_BYTES: usize = 1024 * 1024;

/// Hash at most the first 1 MiB of `body` with SHA-256, lowercase hex.
/// Empty input hashes to an empty string (there is nothing to attest to).
pub fn hash_body(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let limit = body.len().min(MAX_HASH_BYTES);
    let mut hasher = Sha256::new();
    hasher.update(&body[..limit]);
    hex_encode(&hasher.finalize())
}

/// Redact an API key by hashing it: `sha256:<hex>`. Empty input maps to
/// empty output.
pub fn redact_api_key_hash(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("sha256:{}", hex_encode(&hasher.finalize()))
}

/// Redact an API key by showing its first and last 4 characters, e.g.
/// `sk-a***mnop`. Keys shorter than 12 characters are fully masked as
/// `"****"`; empty input maps to empty output.
pub fn redact_api_key_affixes(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "****".to_string();
    }
    let first: String = chars[..4].iter().collect();
    let last: String = chars[chars.len() - 4..].iter().collect();
    format!("{first}***{last}")
}

/// Truncate `s` to at most `max` characters. If `s` already fits, it is
/// returned unchanged. If `max <= 3` the result is a hard cut with no
/// ellipsis (there's no room for one); otherwise the result is
/// `s[..max-3] + "..."`. Postcondition: `result.chars().count() <= max`.
pub fn truncate_field(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }
    if max <= 3 {
        return take_chars(s, max);
    }
    format!("{}...", take_chars(s, max - 3))
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to String never fails");
    }
    out
}

// Kept for parity with the module this was generalized from: byte-oriented
// callers (e.g. reading a body as bytes before it's known to be UTF-8) can
// still truncate safely.
#[allow(dead_code)]
pub(crate) fn truncate_utf8_bytes(s: &str, max_bytes: usize) -> &str {
    truncate_utf8_safe(s, max_bytes)
}
