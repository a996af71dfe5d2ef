//! Content fingerprints used as cache keys.
//!
//! Fields are length-prefixed before hashing so that no two different
//! field lists share a byte stream (`"ab" + "c"` vs `"a" + "bc"`).

use sha2::{Digest, Sha256};

use crate::model::ParseSettings;

fn fingerprint(fields: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    format!("{:x}", hasher.finalize())
}

/// Key of a compiled parser: grammar text, start rule, algorithm, debug flag.
pub fn grammar_key(grammar: &str, settings: &ParseSettings) -> String {
    fingerprint(&[
        b"grammar",
        grammar.as_bytes(),
        settings.start_rule.as_bytes(),
        settings.parser.as_str().as_bytes(),
        if settings.debug { b"1" } else { b"0" },
    ])
}

/// Key of a cached parse result: grammar text, sample text, start rule, algorithm.
pub fn result_key(grammar: &str, text: &str, settings: &ParseSettings) -> String {
    fingerprint(&[
        b"result",
        grammar.as_bytes(),
        text.as_bytes(),
        settings.start_rule.as_bytes(),
        settings.parser.as_str().as_bytes(),
    ])
}

/// Short form for log fields.
pub fn short(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use larkline_grammar::Algorithm;

    #[test]
    fn identical_inputs_give_identical_keys() {
        let settings = ParseSettings::default();
        assert_eq!(
            result_key("start: A", "a", &settings),
            result_key("start: A", "a", &settings)
        );
        assert_eq!(grammar_key("g", &settings), grammar_key("g", &settings));
        assert_eq!(grammar_key("g", &settings).len(), 64);
    }

    #[test]
    fn every_field_changes_the_key() {
        let base = ParseSettings::default();
        let key = result_key("g", "t", &base);

        assert_ne!(key, result_key("g2", "t", &base));
        assert_ne!(key, result_key("g", "t2", &base));

        let other_rule = ParseSettings {
            start_rule: "other".into(),
            ..base.clone()
        };
        assert_ne!(key, result_key("g", "t", &other_rule));

        let lalr = ParseSettings {
            parser: Algorithm::Lalr,
            ..base.clone()
        };
        assert_ne!(key, result_key("g", "t", &lalr));
        assert_ne!(grammar_key("g", &base), grammar_key("g", &lalr));

        let debug = ParseSettings {
            debug: true,
            ..base.clone()
        };
        assert_ne!(grammar_key("g", &base), grammar_key("g", &debug));
    }

    #[test]
    fn field_boundaries_matter() {
        let settings = ParseSettings::default();
        assert_ne!(
            result_key("ab", "c", &settings),
            result_key("a", "bc", &settings)
        );
    }
}
