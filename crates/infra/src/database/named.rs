//! Named placeholder rewriting.
//!
//! Statements are written with `:name` placeholders. PostgreSQL wants `$1`,
//! `$2`, ... instead, so the text is rewritten once and the parameter order is
//! remembered for binding. A name used several times maps to one index.
//! Placeholders inside string literals, quoted identifiers and line comments
//! are left alone, as are `::` casts.

use super::r#trait::{DatabaseError, SqlParams, SqlValue};

/// A statement rewritten to positional placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalSql {
    sql: String,
    names: Vec<String>,
}

impl PositionalSql {
    pub fn parse(sql: &str) -> Self {
        let bytes = sql.as_bytes();
        let mut out = String::with_capacity(sql.len() + 8);
        let mut names: Vec<String> = Vec::new();
        let mut i = 0;
        let mut copied = 0;

        while i < bytes.len() {
            match bytes[i] {
                quote @ (b'\'' | b'"') => {
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] == quote {
                            // doubled quote is an escape
                            if bytes.get(i + 1) == Some(&quote) {
                                i += 2;
                                continue;
                            }
                            break;
                        }
                        i += 1;
                    }
                    i += 1;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b':' if bytes.get(i + 1) == Some(&b':') => {
                    i += 2;
                }
                b':' if bytes.get(i + 1).is_some_and(|b| is_name_start(*b)) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && is_name_char(bytes[end]) {
                        end += 1;
                    }
                    let name = &sql[start..end];
                    let index = match names.iter().position(|n| n == name) {
                        Some(pos) => pos + 1,
                        None => {
                            names.push(name.to_string());
                            names.len()
                        }
                    };
                    out.push_str(&sql[copied..i]);
                    out.push('$');
                    out.push_str(&index.to_string());
                    copied = end;
                    i = end;
                }
                _ => i += 1,
            }
        }
        out.push_str(&sql[copied.min(sql.len())..]);

        Self { sql: out, names }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in positional order: `names()[0]` binds to `$1`.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Values to bind, in positional order.
    pub fn values<'p>(&self, params: &'p SqlParams) -> Result<Vec<&'p SqlValue>, DatabaseError> {
        self.names.iter().map(|n| params.require(n)).collect()
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rewrites_in_order_of_first_use() {
        let p = PositionalSql::parse(
            "UPDATE t SET a = :delay WHERE id = :id AND q = :queueName AND b = :delay",
        );
        assert_eq!(p.sql(), "UPDATE t SET a = $1 WHERE id = $2 AND q = $3 AND b = $1");
        assert_eq!(p.names(), ["delay", "id", "queueName"]);
    }

    #[test]
    fn leaves_literals_casts_and_comments_alone() {
        let p = PositionalSql::parse(
            "SELECT ':a', \"x:y\", v::text, 'it''s :b' -- :c\nFROM t WHERE x = :d",
        );
        assert_eq!(
            p.sql(),
            "SELECT ':a', \"x:y\", v::text, 'it''s :b' -- :c\nFROM t WHERE x = $1"
        );
        assert_eq!(p.names(), ["d"]);
    }

    #[test]
    fn interval_literal_after_parameter() {
        let p = PositionalSql::parse("now() + :executionDelay * INTERVAL '1 MILLISECOND'");
        assert_eq!(p.sql(), "now() + $1 * INTERVAL '1 MILLISECOND'");
    }

    #[test]
    fn values_follow_positions_and_report_missing() {
        let p = PositionalSql::parse("a = :x AND b = :y");
        let params = SqlParams::new().with("y", 2i64).with("x", 1i64);
        let values = p.values(&params).unwrap();
        assert_eq!(values, [&SqlValue::BigInt(1), &SqlValue::BigInt(2)]);

        let partial = SqlParams::new().with("x", 1i64);
        assert!(matches!(p.values(&partial), Err(DatabaseError::MissingParameter(n)) if n == "y"));
    }

    #[test]
    fn unterminated_literal_is_copied_verbatim() {
        let p = PositionalSql::parse("SELECT 'abc :x");
        assert_eq!(p.sql(), "SELECT 'abc :x");
        assert!(p.names().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: every distinct name gets one index and no `:name` survives.
        #[test]
        fn every_placeholder_is_replaced(names in proptest::collection::vec("[a-z][a-zA-Z0-9_]{0,6}", 1..8)) {
            let sql = names
                .iter()
                .map(|n| format!("c = :{n}"))
                .collect::<Vec<_>>()
                .join(" AND ");
            let p = PositionalSql::parse(&sql);

            let mut expected: Vec<String> = Vec::new();
            for n in &names {
                if !expected.contains(n) {
                    expected.push(n.clone());
                }
            }
            prop_assert_eq!(p.names(), expected.as_slice());
            prop_assert!(!p.sql().contains(':'));
            prop_assert_eq!(p.sql().matches('$').count(), names.len());
        }
    }
}
