//! Identifier validation, quoting and name resolution.
//!
//! Identifiers (schema, table and column names) cannot be bound as statement
//! parameters, so every name that reaches generated SQL goes through
//! [`validate_identifier`] and a dialect-specific quoting function here.
//!
//! This module also owns the resolved-name types: [`StreamId`] for the
//! raw/final table pair of a stream and [`ColumnId`] for a declared column.
//! Resolution can truncate or alter names, so [`ColumnNameResolver`]
//! deterministically disambiguates collisions in declaration order.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TypeDedupeError};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - MySQL: 64 characters
/// - SQLite: no hard limit
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Number of hex digits of the SHA-256 digest appended to truncated names.
const HASH_SUFFIX_LEN: usize = 8;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TypeDedupeError::Identifier(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(TypeDedupeError::Identifier(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(TypeDedupeError::Identifier(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an identifier with ANSI double quotes (PostgreSQL, SQLite).
///
/// Escapes double quotes by doubling them.
pub fn quote_ansi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a MySQL identifier using backticks.
///
/// Escapes backticks by doubling them.
pub fn quote_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a SQL string literal, doubling single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Truncate a name to `max_len` bytes, appending a short digest of the full
/// name so distinct long names stay distinct.
pub fn truncate_with_hash(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }

    let digest = Sha256::digest(name.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(HASH_SUFFIX_LEN)
        .collect();

    let keep = max_len.saturating_sub(HASH_SUFFIX_LEN + 1);
    let mut prefix_end = keep.min(name.len());
    while !name.is_char_boundary(prefix_end) {
        prefix_end -= 1;
    }
    format!("{}_{}", &name[..prefix_end], hash)
}

/// Source-given identity of a stream, as it appears in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub namespace: Option<String>,
    pub name: String,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Resolved raw and final table names for one stream.
///
/// Derived once from the original namespace/name by the dialect's naming
/// rules and immutable for the rest of the sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub final_namespace: String,
    pub final_name: String,
    pub raw_namespace: String,
    pub raw_name: String,
    pub original_namespace: Option<String>,
    pub original_name: String,
}

impl StreamId {
    pub fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            namespace: self.original_namespace.clone(),
            name: self.original_name.clone(),
        }
    }

    /// Final table name with a suffix, used for soft-reset and overwrite tables.
    ///
    /// The result fits in `max_len` bytes. Destinations silently truncate
    /// longer identifiers, which would make a suffixed name resolve to the
    /// final table itself, so the base name is shortened with a digest first.
    pub fn final_name_with_suffix(&self, suffix: &str, max_len: usize) -> String {
        if suffix.is_empty() {
            return self.final_name.clone();
        }
        let base = truncate_with_hash(&self.final_name, max_len.saturating_sub(suffix.len()));
        format!("{}{}", base, suffix)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor())
    }
}

/// A declared column: the source-given name plus the dialect-resolved name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnId {
    /// Resolved (unquoted) column name used in generated SQL.
    pub name: String,
    /// Name as it appears in the raw payload.
    pub original_name: String,
    /// Comparison key for collision detection (case-folded when the
    /// destination treats identifiers case-insensitively).
    pub canonical_name: String,
}

/// Resolves the columns of one stream to unique destination names.
///
/// Names already claimed (including the fixed metadata columns) are detected
/// on the canonical form; later collisions get `_1`, `_2`, ... appended in
/// declaration order.
#[derive(Debug)]
pub struct ColumnNameResolver {
    max_len: usize,
    case_insensitive: bool,
    taken: HashSet<String>,
}

impl ColumnNameResolver {
    pub fn new(max_len: usize, case_insensitive: bool, reserved: &[&str]) -> Self {
        let mut resolver = Self {
            max_len,
            case_insensitive,
            taken: HashSet::new(),
        };
        for name in reserved {
            let canonical = resolver.canonical(name);
            resolver.taken.insert(canonical);
        }
        resolver
    }

    fn canonical(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Resolve `original` into a column id unique within this resolver.
    pub fn resolve(&mut self, original: &str) -> ColumnId {
        let base = truncate_with_hash(original, self.max_len);
        let mut candidate = base.clone();
        let mut counter = 0usize;

        while self.taken.contains(&self.canonical(&candidate)) {
            counter += 1;
            let suffix = format!("_{}", counter);
            let room = self.max_len.saturating_sub(suffix.len());
            let mut end = room.min(base.len());
            while !base.is_char_boundary(end) {
                end -= 1;
            }
            candidate = format!("{}{}", &base[..end], suffix);
        }

        let canonical_name = self.canonical(&candidate);
        self.taken.insert(canonical_name.clone());
        ColumnId {
            name: candidate,
            original_name: original.to_string(),
            canonical_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // =========================================================================
    // Validation tests
    // =========================================================================

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_identifier(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    // =========================================================================
    // Quoting tests
    // =========================================================================

    #[test]
    fn test_quote_ansi_escapes_double_quote() {
        assert_eq!(quote_ansi("users"), "\"users\"");
        assert_eq!(quote_ansi("table\"name"), "\"table\"\"name\"");
    }

    #[test]
    fn test_quote_mysql_escapes_backtick() {
        assert_eq!(quote_mysql("users"), "`users`");
        assert_eq!(quote_mysql("a`b"), "`a``b`");
    }

    #[test]
    fn test_quote_literal_injection_safely_quoted() {
        assert_eq!(
            quote_literal("Robert'); DROP TABLE Students;--"),
            "'Robert''); DROP TABLE Students;--'"
        );
    }

    // =========================================================================
    // Truncation and collision tests
    // =========================================================================

    #[test]
    fn test_truncate_short_name_untouched() {
        assert_eq!(truncate_with_hash("id", 63), "id");
    }

    #[test]
    fn test_truncate_long_names_stay_distinct() {
        let a = format!("{}_a", "x".repeat(80));
        let b = format!("{}_b", "x".repeat(80));
        let ta = truncate_with_hash(&a, 63);
        let tb = truncate_with_hash(&b, 63);
        assert!(ta.len() <= 63);
        assert!(tb.len() <= 63);
        assert_ne!(ta, tb);
    }

    #[test]
    fn test_resolver_disambiguates_case_collisions_in_order() {
        let mut resolver = ColumnNameResolver::new(63, true, &[]);
        let first = resolver.resolve("Name");
        let second = resolver.resolve("name");
        let third = resolver.resolve("NAME");
        assert_eq!(first.name, "Name");
        assert_eq!(second.name, "name_1");
        assert_eq!(third.name, "NAME_2");
        assert_eq!(second.original_name, "name");
    }

    #[test]
    fn test_resolver_case_sensitive_keeps_both() {
        let mut resolver = ColumnNameResolver::new(63, false, &[]);
        assert_eq!(resolver.resolve("Name").name, "Name");
        assert_eq!(resolver.resolve("name").name, "name");
    }

    #[test]
    fn test_resolver_avoids_reserved_metadata_columns() {
        let mut resolver = ColumnNameResolver::new(63, false, &["_airbyte_meta"]);
        assert_eq!(resolver.resolve("_airbyte_meta").name, "_airbyte_meta_1");
    }

    #[test]
    fn test_stream_id_descriptor_display() {
        let id = StreamId {
            final_namespace: "public".into(),
            final_name: "users".into(),
            raw_namespace: "airbyte_internal".into(),
            raw_name: "public_raw__stream_users".into(),
            original_namespace: Some("public".into()),
            original_name: "users".into(),
        };
        assert_eq!(id.to_string(), "public.users");
        assert_eq!(id.final_name_with_suffix("_ab_soft_reset", 63), "users_ab_soft_reset");
        assert_eq!(id.final_name_with_suffix("", 63), "users");
    }

    #[test]
    fn test_suffixed_name_never_truncates_to_final_name() {
        let long = "x".repeat(70);
        let id = StreamId {
            final_namespace: "public".into(),
            final_name: truncate_with_hash(&long, 63),
            raw_namespace: "airbyte_internal".into(),
            raw_name: truncate_with_hash(&format!("public_raw__stream_{}", long), 63),
            original_namespace: Some("public".into()),
            original_name: long.clone(),
        };
        assert_eq!(id.final_name.len(), 63);

        for suffix in ["_ab_soft_reset", "_airbyte_tmp"] {
            let suffixed = id.final_name_with_suffix(suffix, 63);
            assert!(suffixed.len() <= 63, "{} is {} bytes", suffixed, suffixed.len());
            assert!(suffixed.ends_with(suffix));
            assert_ne!(suffixed, id.final_name);
            assert_ne!(&suffixed[..suffixed.len().min(63)], id.final_name.as_str());
        }
    }

    proptest! {
        #[test]
        fn prop_resolved_names_are_unique(
            names in proptest::collection::vec("[a-zA-Z_]{1,80}", 1..24),
            case_insensitive in any::<bool>(),
        ) {
            let mut resolver = ColumnNameResolver::new(63, case_insensitive, &["_airbyte_raw_id"]);
            let mut seen = HashSet::new();
            for name in &names {
                let id = resolver.resolve(name);
                prop_assert!(id.name.len() <= 63);
                prop_assert!(seen.insert(id.canonical_name.clone()));
            }
        }
    }
}
