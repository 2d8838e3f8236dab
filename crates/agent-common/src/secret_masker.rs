// Thread-safe store of secret literals and patterns, applied at every output
// sink. One masker instance exists per process; every component that produces
// text holds a clone of the same handle.

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Minimum length a literal must have to be registered, unless lowered.
pub const DEFAULT_MIN_SECRET_LENGTH: usize = 6;

/// Regex replacement stops after this many passes even if new matches keep
/// appearing, to bound pathological patterns.
const MAX_REGEX_PASSES: usize = 5;

/// A registered literal secret.
#[derive(Debug, Clone)]
struct ValueSecret {
    value: String,
    origin: String,
}

/// A registered regex secret.
#[derive(Debug)]
struct RegexSecret {
    regex: Regex,
    origin: String,
}

#[derive(Debug, Default)]
struct SecretMaskerInner {
    values: Vec<ValueSecret>,
    regexes: Vec<RegexSecret>,
    min_secret_length: usize,
}

/// A thread-safe secret masker that replaces registered secret values and
/// pattern matches in arbitrary strings with `***`.
///
/// Masking itself never fails; an unmaskable input does not exist.
#[derive(Debug, Clone)]
pub struct SecretMasker {
    inner: Arc<RwLock<SecretMaskerInner>>,
}

impl Default for SecretMasker {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretMasker {
    /// Create a new empty `SecretMasker` with the default minimum length.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SecretMaskerInner {
                values: Vec::new(),
                regexes: Vec::new(),
                min_secret_length: DEFAULT_MIN_SECRET_LENGTH,
            })),
        }
    }

    /// Register a literal secret value along with its normalized variants.
    ///
    /// Normalization strips surrounding quote characters and CR/LF/space;
    /// every distinct variant long enough to be meaningful is registered so
    /// that a secret pasted with stray quoting is still caught. Values
    /// shorter than the current minimum length are dropped.
    pub fn add_value(&self, value: &str, origin: &str) {
        let mut inner = self.inner.write();
        let min_len = inner.min_secret_length;

        for variant in Self::normalized_variants(value) {
            if variant.len() < min_len {
                continue;
            }
            if inner.values.iter().any(|s| s.value == variant) {
                continue;
            }
            inner.values.push(ValueSecret {
                value: variant,
                origin: origin.to_string(),
            });
        }

        // Longest-first so a secret that contains another secret masks whole.
        inner.values.sort_by(|a, b| b.value.len().cmp(&a.value.len()));
    }

    /// Compile and register a case-insensitive regex secret.
    ///
    /// A compile failure is returned to the caller (who reports it as a
    /// warning) and the pattern is discarded.
    pub fn add_regex(&self, pattern: &str, origin: &str) -> Result<(), regex::Error> {
        if pattern.trim().is_empty() {
            return Ok(());
        }

        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;

        let mut inner = self.inner.write();
        if inner.regexes.iter().all(|r| r.regex.as_str() != regex.as_str()) {
            inner.regexes.push(RegexSecret {
                regex,
                origin: origin.to_string(),
            });
        }
        Ok(())
    }

    /// Raise the minimum literal length, atomically dropping any previously
    /// registered literal now shorter than `length`. Returns the origins of
    /// the dropped literals so the caller can warn about them.
    pub fn set_minimum_secret_length(&self, length: usize) -> Vec<String> {
        let mut inner = self.inner.write();
        inner.min_secret_length = length;

        let mut dropped = Vec::new();
        inner.values.retain(|s| {
            if s.value.len() < length {
                dropped.push(s.origin.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// The current minimum literal length.
    pub fn minimum_secret_length(&self) -> usize {
        self.inner.read().min_secret_length
    }

    /// Replace every registered literal and every regex match in `input`
    /// with `***`.
    pub fn mask(&self, input: &str) -> String {
        let inner = self.inner.read();

        if inner.values.is_empty() && inner.regexes.is_empty() {
            return input.to_string();
        }

        let mut result = input.to_string();

        // Literal pass: the list is sorted longest-first.
        for secret in &inner.values {
            if result.contains(secret.value.as_str()) {
                result = result.replace(secret.value.as_str(), MASK);
            }
        }

        // Regex passes run to a fixed point, bounded by MAX_REGEX_PASSES.
        for _ in 0..MAX_REGEX_PASSES {
            let mut changed = false;
            for secret in &inner.regexes {
                let replaced = secret.regex.replace_all(&result, MASK).into_owned();
                if replaced != result {
                    result = replaced;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        result
    }

    /// Returns the number of registered literal secrets.
    pub fn value_count(&self) -> usize {
        self.inner.read().values.len()
    }

    /// Returns the number of registered regex secrets.
    pub fn regex_count(&self) -> usize {
        self.inner.read().regexes.len()
    }

    /// Origins of all registered secrets, for diagnostics.
    pub fn origins(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .values
            .iter()
            .map(|s| s.origin.clone())
            .chain(inner.regexes.iter().map(|r| r.origin.clone()))
            .collect()
    }

    /// Produce the set of normalized variants for a literal value.
    fn normalized_variants(value: &str) -> Vec<String> {
        let mut variants = Vec::new();
        let mut push = |v: &str| {
            if !v.is_empty() && !variants.iter().any(|existing| existing == v) {
                variants.push(v.to_string());
            }
        };

        push(value);

        let trimmed_ws = value.trim_matches(|c| c == '\r' || c == '\n' || c == ' ');
        push(trimmed_ws);

        let trimmed_quotes = trimmed_ws.trim_matches(|c| c == '\'' || c == '"');
        push(trimmed_quotes);

        variants
    }
}
