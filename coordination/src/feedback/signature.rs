//! Failure signatures
//!
//! A signature identifies "the same problem" across runs: the check name
//! plus the failure message with volatile substrings (timestamps, ids,
//! counts) replaced by placeholders, hashed with blake3.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?")
        .expect("timestamp regex is valid")
});

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid regex is valid")
});

static CLOCK_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?\b").expect("clock time regex is valid")
});

static HEX_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:0x)?[0-9a-f]{7,}\b").expect("hex id regex is valid"));

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:ms|s|secs?|seconds?|m|mins?|minutes?|h|hours?)\b")
        .expect("duration regex is valid")
});

static DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digits regex is valid"));

static QUOTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'`]"#).expect("quotes regex is valid"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Strip volatile substrings so repeated occurrences of one problem compare equal.
pub fn normalize_message(message: &str) -> String {
    let text = ISO_TIMESTAMP.replace_all(message, "<ts>");
    let text = UUID.replace_all(&text, "<uuid>");
    let text = CLOCK_TIME.replace_all(&text, "<time>");
    // Plain words made of a-f letters ("defaced") are not ids
    let text = HEX_ID.replace_all(&text, |caps: &Captures| {
        let m = &caps[0];
        if m.bytes().any(|b| b.is_ascii_digit()) {
            "<hex>".to_string()
        } else {
            m.to_string()
        }
    });
    let text = DURATION.replace_all(&text, "<dur>");
    let text = DIGITS.replace_all(&text, "#");
    let text = QUOTES.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_lowercase()
}

/// Stable identifier of a failure class
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    const LEN: usize = 32;

    /// Derive the signature of a failure reported by `check_name`.
    pub fn derive(check_name: &str, message: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(check_name.as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(normalize_message(message).as_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..Self::LEN].to_string())
    }

    /// Accept a previously derived signature (e.g. a file name)
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
