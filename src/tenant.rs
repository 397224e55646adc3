use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Longest prefix accepted. Index, trigger and function names are built as
/// `<prefix><table>_<suffix>` and must stay under PostgreSQL's 63-byte
/// identifier limit, or the engine truncates them and tenants share objects.
pub const MAX_PREFIX_LEN: usize = 30;

/// Table-name prefix of one tenant in the shared-database topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantPrefix(String);

impl TenantPrefix {
    /// Derive the prefix for a tenant's display name: ASCII-lowercase, every
    /// character outside `[a-z0-9_]` replaced by `_`, and a trailing `_`.
    /// Names starting with a digit are refused, since the physical table
    /// names would not be valid unquoted identifiers.
    ///
    /// This is the only place a prefix is computed. Schema creation,
    /// statement rewriting and the registry all go through it.
    pub fn from_tenant_name(name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::InvalidTenant {
                name: name.to_string(),
                reason: "tenant name is empty".into(),
            });
        }
        let mut prefix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        prefix.push('_');

        if prefix.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::InvalidTenant {
                name: name.to_string(),
                reason: format!("prefix {:?} starts with a digit", prefix),
            });
        }
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(Error::InvalidTenant {
                name: name.to_string(),
                reason: format!(
                    "prefix {:?} is longer than {} bytes",
                    prefix, MAX_PREFIX_LEN
                ),
            });
        }
        Ok(Self(prefix))
    }

    /// Wrap a prefix that was already sanitized (e.g. read back from the
    /// registry). Rejects anything `from_tenant_name` could not produce.
    pub fn from_sanitized(prefix: &str) -> Result<Self> {
        let valid = prefix.ends_with('_')
            && !prefix.starts_with(|c: char| c.is_ascii_digit())
            && prefix.len() <= MAX_PREFIX_LEN
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(Error::InvalidTenant {
                name: prefix.to_string(),
                reason: "not a sanitized table prefix".into(),
            });
        }
        Ok(Self(prefix.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Physical name of a logical table or schema object.
    pub fn apply(&self, name: &str) -> String {
        format!("{}{}", self.0, name)
    }
}

impl fmt::Display for TenantPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TenantEntry {
    name: String,
    prefix: TenantPrefix,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedTenants {
    #[serde(default)]
    tenants: Vec<TenantEntry>,
}

/// Explicit tenant-name → prefix registry.
///
/// Sanitization is not injective (`"O'Brien Family"` and `"O_Brien Family"`
/// both map to `o_brien_family_`), so every new tenant is checked against
/// the prefixes already handed out.
#[derive(Debug, Default, Clone)]
pub struct TenantRegistry {
    by_prefix: BTreeMap<TenantPrefix, String>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgtenant")
            .join("tenants.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        let saved: SavedTenants =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;

        let mut registry = Self::new();
        for entry in saved.tenants {
            let expected = TenantPrefix::from_tenant_name(&entry.name)?;
            if expected != entry.prefix {
                return Err(Error::Config(format!(
                    "registry entry {:?} has prefix {:?}, expected {:?}",
                    entry.name, entry.prefix, expected
                )));
            }
            registry.register(&entry.name)?;
        }
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let saved = SavedTenants {
            tenants: self
                .by_prefix
                .iter()
                .map(|(prefix, name)| TenantEntry {
                    name: name.clone(),
                    prefix: prefix.clone(),
                })
                .collect(),
        };
        let content = toml::to_string_pretty(&saved).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Register a tenant and return its prefix. Registering the same name
    /// twice is a no-op; a different name with the same prefix is refused.
    pub fn register(&mut self, name: &str) -> Result<TenantPrefix> {
        let prefix = TenantPrefix::from_tenant_name(name)?;
        match self.by_prefix.get(&prefix) {
            Some(existing) if existing != name => Err(Error::NamespaceCollision {
                prefix: prefix.to_string(),
                existing: existing.clone(),
                requested: name.to_string(),
            }),
            Some(_) => Ok(prefix),
            None => {
                tracing::info!(tenant = name, prefix = %prefix, "registered tenant");
                self.by_prefix.insert(prefix.clone(), name.to_string());
                Ok(prefix)
            }
        }
    }

    pub fn tenant_for(&self, prefix: &TenantPrefix) -> Option<&str> {
        self.by_prefix.get(prefix).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(
            TenantPrefix::from_tenant_name("Smith Family").unwrap().as_str(),
            "smith_family_"
        );
        assert_eq!(
            TenantPrefix::from_tenant_name("O'Brien Family").unwrap().as_str(),
            "o_brien_family_"
        );
        assert_eq!(
            TenantPrefix::from_tenant_name("Müller-2").unwrap().as_str(),
            "m_ller_2_"
        );
    }

    #[test]
    fn test_distinct_names_can_share_a_prefix() {
        let a = TenantPrefix::from_tenant_name("O'Brien Family").unwrap();
        let b = TenantPrefix::from_tenant_name("O_Brien Family").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_and_long_names_rejected() {
        assert!(matches!(
            TenantPrefix::from_tenant_name("  "),
            Err(Error::InvalidTenant { .. })
        ));
        let long = "x".repeat(MAX_PREFIX_LEN);
        assert!(matches!(
            TenantPrefix::from_tenant_name(&long),
            Err(Error::InvalidTenant { .. })
        ));
        let fits = "x".repeat(MAX_PREFIX_LEN - 1);
        assert!(TenantPrefix::from_tenant_name(&fits).is_ok());
    }

    #[test]
    fn test_leading_digit_rejected() {
        assert!(matches!(
            TenantPrefix::from_tenant_name("1st Family"),
            Err(Error::InvalidTenant { .. })
        ));
        assert!(TenantPrefix::from_sanitized("1st_family_").is_err());
        // an underscore in front keeps the name a valid identifier
        assert_eq!(
            TenantPrefix::from_tenant_name("_1st Family").unwrap().as_str(),
            "_1st_family_"
        );
        assert_eq!(
            TenantPrefix::from_tenant_name("Family 1").unwrap().as_str(),
            "family_1_"
        );
    }

    #[test]
    fn test_from_sanitized() {
        assert!(TenantPrefix::from_sanitized("smith_family_").is_ok());
        assert!(TenantPrefix::from_sanitized("Smith_").is_err());
        assert!(TenantPrefix::from_sanitized("smith").is_err());
        assert!(TenantPrefix::from_sanitized("smi th_").is_err());
    }

    #[test]
    fn test_apply() {
        let p = TenantPrefix::from_tenant_name("Smith Family").unwrap();
        assert_eq!(p.apply("person"), "smith_family_person");
    }

    #[test]
    fn test_registry_flags_collision() {
        let mut registry = TenantRegistry::new();
        let first = registry.register("O'Brien Family").unwrap();
        assert_eq!(first.as_str(), "o_brien_family_");

        let err = registry.register("O_Brien Family").unwrap_err();
        match err {
            Error::NamespaceCollision {
                prefix,
                existing,
                requested,
            } => {
                assert_eq!(prefix, "o_brien_family_");
                assert_eq!(existing, "O'Brien Family");
                assert_eq!(requested, "O_Brien Family");
            }
            other => panic!("expected collision, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tenant_for(&first), Some("O'Brien Family"));
    }

    #[test]
    fn test_registry_same_name_is_idempotent() {
        let mut registry = TenantRegistry::new();
        let a = registry.register("Smith Family").unwrap();
        let b = registry.register("Smith Family").unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tenants.toml");

        let mut registry = TenantRegistry::new();
        registry.register("Smith Family").unwrap();
        registry.register("O'Brien Family").unwrap();
        registry.save(&path).unwrap();

        let mut loaded = TenantRegistry::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(matches!(
            loaded.register("O_Brien Family"),
            Err(Error::NamespaceCollision { .. })
        ));
    }

    #[test]
    fn test_registry_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::load(&dir.path().join("absent.toml")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_rejects_tampered_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants.toml");
        std::fs::write(
            &path,
            "[[tenants]]\nname = \"Smith Family\"\nprefix = \"jones_\"\n",
        )
        .unwrap();
        assert!(matches!(
            TenantRegistry::load(&path),
            Err(Error::Config(_))
        ));
    }
}
