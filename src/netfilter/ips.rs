//! Payload inspection against weighted byte signatures.

use regex::bytes::Regex;
use serde::Serialize;

/// Scores above this mark the connection hostile.
pub const IPS_BLOCK_SCORE: u32 = 50;

const MAX_IPS_SCORE: u32 = 100;

const SIGNATURES: [(&str, &str, u32); 6] = [
    ("nop_sled", r"(?-u)\x90{16,}", 40),
    ("shell_path", r"(?i-u)/bin/(ba|z|da)?sh\b", 30),
    ("passwd_access", r"(?-u)/etc/(passwd|shadow)\b", 30),
    ("directory_traversal", r"(\.\./){2,}|(\.\.\\){2,}", 25),
    ("sql_union_select", r"(?i)union\s+(all\s+)?select", 35),
    ("script_injection", r"(?i)<script[^>]*>", 30),
];

struct Signature {
    name: &'static str,
    regex: Regex,
    weight: u32,
}

/// Result of scanning one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpsVerdict {
    /// Combined score, 0..=100.
    pub score: u32,
    /// Names of matched signatures.
    pub matched: Vec<&'static str>,
}

impl IpsVerdict {
    /// Whether the payload should be blocked.
    pub fn is_hostile(&self) -> bool {
        self.score > IPS_BLOCK_SCORE
    }
}

/// Signature scanner.
pub struct IpsEngine {
    signatures: Vec<Signature>,
}

impl std::fmt::Debug for IpsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpsEngine")
            .field("signatures", &self.signatures.len())
            .finish()
    }
}

impl Default for IpsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IpsEngine {
    /// Scanner with the built-in signatures.
    pub fn new() -> Self {
        let signatures = SIGNATURES
            .iter()
            .filter_map(|&(name, pattern, weight)| {
                Regex::new(pattern).ok().map(|regex| Signature {
                    name,
                    regex,
                    weight,
                })
            })
            .collect();
        Self { signatures }
    }

    /// Score `payload`.
    pub fn analyze(&self, payload: &[u8]) -> IpsVerdict {
        let mut score = 0u32;
        let mut matched = Vec::new();
        for signature in &self.signatures {
            if signature.regex.is_match(payload) {
                score = score.saturating_add(signature.weight);
                matched.push(signature.name);
            }
        }
        IpsVerdict {
            score: score.min(MAX_IPS_SCORE),
            matched,
        }
    }

    /// Loaded signature count.
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether no signature compiled.
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
