//! SQL identifier checks.
//!
//! Table, column and sequence names are spliced into generated SQL text, so
//! they are restricted to plain unquoted identifiers. Table and sequence names
//! may carry a schema prefix (`schema.table`).

use crate::error::{ConfigError, ConfigResult};

const MAX_IDENTIFIER_LEN: usize = 128;

/// Check that `name` is a single unquoted SQL identifier.
pub fn validate_identifier(name: &str) -> ConfigResult<()> {
    if is_plain_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::invalid_identifier(name))
    }
}

/// Check that `name` is an identifier optionally qualified by a schema.
pub fn validate_qualified_name(name: &str) -> ConfigResult<()> {
    let mut parts = name.split('.');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(object), None, None) => is_plain_identifier(object),
        (Some(schema), Some(object), None) => {
            is_plain_identifier(schema) && is_plain_identifier(object)
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::invalid_identifier(name))
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_plain_and_qualified_names() {
        assert!(validate_identifier("next_process_at").is_ok());
        assert!(validate_identifier("_x$1").is_ok());
        assert!(validate_qualified_name("queue_tasks").is_ok());
        assert!(validate_qualified_name("jobs.queue_tasks").is_ok());
    }

    #[test]
    fn rejects_injection_shaped_names() {
        for bad in ["", "1abc", "a b", "a;drop", "t--", "a.b.c", ".t", "t.", "\"quoted\""] {
            assert!(validate_qualified_name(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_identifier("schema.table").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: anything matching the identifier grammar is accepted.
        #[test]
        fn grammar_conforming_names_are_accepted(name in "[A-Za-z_][A-Za-z0-9_$]{0,40}") {
            prop_assert!(validate_identifier(&name).is_ok());
        }

        /// Property: a name containing any character outside the grammar is rejected.
        #[test]
        fn names_with_foreign_characters_are_rejected(
            prefix in "[a-z]{1,8}",
            bad in "[ ;'\"()*=,-]",
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(validate_identifier(&name).is_err());
        }
    }
}
