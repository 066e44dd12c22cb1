use postgres_protocol::escape::{
    escape_identifier,
    escape_literal,
};

/// Postgres truncates identifiers past this many bytes; we truncate
/// explicitly so the names we create match the names we later query for.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Maps a mirror name to something usable in a replication-object
/// identifier: any character outside `[A-Za-z0-9_]` becomes `_`.
pub fn sanitize_ident(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    out.truncate(MAX_IDENTIFIER_LEN);
    out
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    escape_identifier(name)
}

pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(name))
}

/// Single-quoted literal for the few places a value cannot be a bind
/// parameter (simple-query protocol).
pub fn quote_literal(value: &str) -> String {
    escape_literal(value)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize_ident("orders-prod.v2"), "orders_prod_v2");
        assert_eq!(sanitize_ident("simple_name"), "simple_name");
        assert_eq!(sanitize_ident("héllo"), "h_llo");
    }

    #[test]
    fn sanitize_truncates_to_identifier_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_ident(&long).len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_qualified("public", "accounts"), r#""public"."accounts""#);
    }

    proptest! {
        #[test]
        fn sanitized_names_are_valid_identifiers(name in "\\PC{0,80}") {
            let out = sanitize_ident(&name);
            prop_assert!(out.len() <= MAX_IDENTIFIER_LEN);
            prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }

        #[test]
        fn sanitize_is_idempotent(name in "\\PC{0,80}") {
            let once = sanitize_ident(&name);
            prop_assert_eq!(sanitize_ident(&once), once);
        }
    }
}
