//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::core::catalog::{CatalogParser, ParsedCatalog};
use crate::drivers::DialectImpl;
use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Dialect of the configured destination.
    pub fn dialect(&self) -> Result<DialectImpl> {
        DialectImpl::from_db_type(&self.destination.r#type)
    }

    /// Resolve the configured streams for the destination's dialect.
    pub fn catalog(&self) -> Result<ParsedCatalog> {
        CatalogParser::new(
            self.dialect()?,
            &self.typing.raw_namespace,
            &self.typing.default_namespace,
        )
        .parse(&self.streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQLITE_CONFIG: &str = r#"
destination:
  type: sqlite
  path: ":memory:"
typing:
  threads: 2
streams:
  - namespace: public
    name: users
    sync_mode: append_dedup
    primary_key: [id]
    cursor: updated_at
    json_schema:
      type: object
      properties:
        id: { type: integer }
        updated_at: { type: integer }
        name: { type: string }
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(SQLITE_CONFIG).unwrap();
        assert_eq!(config.destination.r#type, "sqlite");
        assert_eq!(config.destination.ssl_mode, "require");
        assert_eq!(config.typing.get_threads(), 2);
        assert_eq!(config.typing.raw_namespace, "airbyte_internal");
        assert!(!config.typing.disable_type_dedupe);
        assert_eq!(config.streams.len(), 1);
    }

    #[test]
    fn test_catalog_resolves_streams() {
        let config = Config::from_yaml(SQLITE_CONFIG).unwrap();
        let catalog = config.catalog().unwrap();
        let users = catalog.get(Some("public"), "users").unwrap();
        assert!(users.is_dedup());
        assert_eq!(users.columns.len(), 3);
        assert_eq!(users.cursor.as_ref().map(|c| c.name.as_str()), Some("updated_at"));
    }

    #[test]
    fn test_hash_is_stable_and_sensitive() {
        let a = Config::from_yaml(SQLITE_CONFIG).unwrap();
        let b = Config::from_yaml(SQLITE_CONFIG).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        let mut c = b.clone();
        c.typing.threads = Some(3);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/typedupe.yaml").unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SQLITE_CONFIG).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.streams[0].name, "users");
    }
}
