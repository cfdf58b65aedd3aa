//! Registration photo file name → identity key.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::path::Path;

/// How a key was obtained, in the order strategies are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// The whole file stem is a key.
    Exact,
    /// A key appears somewhere inside the stem; the first one wins.
    Embedded,
    /// No key pattern found; the stem is used verbatim.
    Stem,
}

impl KeyStrategy {
    pub const ORDER: [KeyStrategy; 3] = [KeyStrategy::Exact, KeyStrategy::Embedded, KeyStrategy::Stem];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityKey {
    pub value: String,
    pub source: KeyStrategy,
}

/// Applies [`KeyStrategy::ORDER`] to file names. Pattern matches are case
/// insensitive and returned upper-cased; the stem fallback is returned as is.
#[derive(Debug, Clone)]
pub struct IdentityKeyExtractor {
    exact: Regex,
    embedded: Regex,
}

impl IdentityKeyExtractor {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            exact: RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(true)
                .build()?,
            embedded: RegexBuilder::new(pattern).case_insensitive(true).build()?,
        })
    }

    pub fn extract(&self, filename: &str) -> IdentityKey {
        let stem = file_stem(filename);
        KeyStrategy::ORDER
            .iter()
            .find_map(|&strategy| {
                self.apply(strategy, stem).map(|value| IdentityKey {
                    value,
                    source: strategy,
                })
            })
            .unwrap_or_else(|| IdentityKey {
                value: stem.to_string(),
                source: KeyStrategy::Stem,
            })
    }

    /// Run one strategy on its own.
    pub fn apply(&self, strategy: KeyStrategy, stem: &str) -> Option<String> {
        match strategy {
            KeyStrategy::Exact => self.exact.is_match(stem).then(|| stem.to_uppercase()),
            KeyStrategy::Embedded => self.embedded.find(stem).map(|m| m.as_str().to_uppercase()),
            KeyStrategy::Stem => Some(stem.to_string()),
        }
    }
}

impl Default for IdentityKeyExtractor {
    fn default() -> Self {
        // The built-in pattern is a valid regex.
        Self::new(crate::config::DEFAULT_IDENTITY_PATTERN).expect("default identity pattern compiles")
    }
}

/// Base name without directories or the final extension.
fn file_stem(filename: &str) -> &str {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);
    match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_examples() {
        let keys = IdentityKeyExtractor::default();

        let exact = keys.extract("A11.2025.16442.jpg");
        assert_eq!(exact.value, "A11.2025.16442");
        assert_eq!(exact.source, KeyStrategy::Exact);

        let embedded = keys.extract("student_A11.2025.16444_photo.jpg");
        assert_eq!(embedded.value, "A11.2025.16444");
        assert_eq!(embedded.source, KeyStrategy::Embedded);

        let stem = keys.extract("random_name.jpg");
        assert_eq!(stem.value, "random_name");
        assert_eq!(stem.source, KeyStrategy::Stem);
    }

    #[test]
    fn test_case_insensitive_and_uppercased() {
        let keys = IdentityKeyExtractor::default();
        assert_eq!(keys.extract("a11.2025.16442.JPG").value, "A11.2025.16442");
    }

    #[test]
    fn test_directories_ignored() {
        let keys = IdentityKeyExtractor::default();
        let key = keys.extract("batch-2025/kelas-a/A11.2025.16442.png");
        assert_eq!(key.value, "A11.2025.16442");
        assert_eq!(key.source, KeyStrategy::Exact);
    }

    #[test]
    fn test_first_embedded_key_wins() {
        let keys = IdentityKeyExtractor::default();
        let key = keys.extract("A11.2025.00001_and_A11.2025.00002.jpg");
        assert_eq!(key.value, "A11.2025.00001");
    }

    #[test]
    fn test_stem_verbatim_keeps_case_and_dots() {
        let keys = IdentityKeyExtractor::default();
        assert_eq!(keys.extract("Budi.Santoso.final.jpeg").value, "Budi.Santoso.final");
        assert_eq!(keys.extract("no_extension").value, "no_extension");
    }

    #[test]
    fn test_strategies_independent() {
        let keys = IdentityKeyExtractor::default();
        assert_eq!(keys.apply(KeyStrategy::Exact, "x_A11.2025.16442"), None);
        assert_eq!(
            keys.apply(KeyStrategy::Embedded, "x_A11.2025.16442").as_deref(),
            Some("A11.2025.16442")
        );
        assert_eq!(keys.apply(KeyStrategy::Stem, "x").as_deref(), Some("x"));
    }

    #[test]
    fn test_custom_pattern() {
        let keys = IdentityKeyExtractor::new(r"\d{8}").unwrap();
        let key = keys.extract("scan-20251234-front.jpg");
        assert_eq!(key.value, "20251234");
        assert_eq!(key.source, KeyStrategy::Embedded);
    }
}
