//! Stable fault identities.
//!
//! Two faults share a signature when they have the same category and kind and
//! their messages differ only in volatile tokens (ids, addresses, timestamps,
//! large numbers).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::{ErrorCategory, ErrorClassification};
use crate::fault::Fault;

/// Length of the hex message hash kept in a signature.
pub const MESSAGE_HASH_LEN: usize = 16;

static TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?")
        .expect("Invalid regex pattern")
});
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("Invalid regex pattern")
});
static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}(\.\d{1,3}){3}(:\d{1,5})?\b").expect("Invalid regex pattern")
});
static HEX_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-f]+\b").expect("Invalid regex pattern"));
static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}").expect("Invalid regex pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid regex pattern"));

/// Normalizes a fault message for hashing.
///
/// Lowercases, replaces timestamps, UUIDs, IPv4 addresses (with optional
/// port), hex addresses and runs of four or more digits with placeholder
/// tokens, then collapses whitespace.
pub fn normalize_message(message: &str) -> String {
    let text = message.to_lowercase();
    let text = TIMESTAMP.replace_all(&text, "<ts>");
    let text = UUID.replace_all(&text, "<uuid>");
    let text = IPV4.replace_all(&text, "<ip>");
    let text = HEX_ADDR.replace_all(&text, "<addr>");
    let text = NUMBER.replace_all(&text, "<n>");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn hash_message(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(MESSAGE_HASH_LEN);
    hash
}

/// Normalized, hashable identity of a fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub category: ErrorCategory,
    pub error_kind: String,
    pub message_hash: String,
    pub file_context: Option<String>,
}

impl ErrorSignature {
    /// Builds the signature of a fault under its classification.
    pub fn from_fault(fault: &Fault, classification: &ErrorClassification) -> Self {
        Self {
            category: classification.category,
            error_kind: fault.kind().as_str().to_string(),
            message_hash: hash_message(&normalize_message(fault.message())),
            file_context: fault.payload().file_context.clone(),
        }
    }

    /// `"{category}:{kind}:{hash}"`
    pub fn to_key(&self) -> String {
        format!("{}:{}:{}", self.category, self.error_kind, self.message_hash)
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}
