//! Content fingerprints for agency fragments.
//!
//! `serde_json` objects are key-ordered maps, so serializing a `Value`
//! is already canonical and the digest only changes when content does.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Returns the `sha256:<hex>` fingerprint of a JSON fragment.
///
/// A missing fragment hashes like JSON `null`.
#[must_use]
pub fn fingerprint(value: Option<&Value>) -> String {
    let bytes = value.map_or_else(|| b"null".to_vec(), |v| v.to_string().into_bytes());
    let hash = Sha256::digest(&bytes);
    format!("sha256:{}", hex::encode(hash))
}
