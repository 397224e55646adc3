use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::TableNames;
use crate::error::{Error, Result};
use crate::tenant::TenantRegistry;

/// How tenants map onto physical databases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// One database per tenant; table names are used as-is.
    #[default]
    Separate,
    /// Many tenants in one database, separated by table-name prefixes.
    Monolithic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min: usize,
    pub max: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { min: 1, max: 8 }
    }
}

/// Additions to the default logical table set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default)]
    pub prefixed: Vec<String>,
    #[serde(default)]
    pub shared: Vec<String>,
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Connection descriptor used when none is given on the command line.
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub topology: Topology,
    /// Pool bounds; without them each session gets a dedicated connection.
    #[serde(default)]
    pub pool: Option<PoolSettings>,
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    #[serde(default)]
    pub tables: TableSettings,
}

impl Settings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pgtenant")
            .join("config.toml")
    }

    /// Load settings; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(pool) = self.pool {
            if pool.max == 0 || pool.min > pool.max {
                return Err(Error::Config(format!(
                    "pool bounds min={} max={} are invalid",
                    pool.min, pool.max
                )));
            }
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(TenantRegistry::default_path)
    }

    /// The default table set extended with configured names.
    pub fn table_names(&self) -> TableNames {
        let names = self
            .tables
            .prefixed
            .iter()
            .fold(TableNames::default(), |n, t| n.with_prefixed(t));
        self.tables
            .shared
            .iter()
            .fold(names, |n, t| n.with_shared(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.topology, Topology::Separate);
    }

    #[test]
    fn test_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
descriptor = "postgresql://gramps@db.internal/family_trees"
topology = "monolithic"
registry_path = "/var/lib/pgtenant/tenants.toml"

[pool]
min = 2
max = 16

[tables]
prefixed = ["vector_index"]
shared = ["tag"]
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.topology, Topology::Monolithic);
        assert_eq!(settings.pool, Some(PoolSettings { min: 2, max: 16 }));
        assert_eq!(
            settings.registry_path(),
            PathBuf::from("/var/lib/pgtenant/tenants.toml")
        );
        let names = settings.table_names();
        assert!(names.is_prefixed("vector_index"));
        assert!(names.is_shared("tag"));
        assert!(names.is_prefixed("person"));
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pool]\nmin = 4\nmax = 2\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let settings = Settings {
            descriptor: Some("gramps".into()),
            topology: Topology::Monolithic,
            pool: Some(PoolSettings::default()),
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }
}
