/// Physical schema management.
///
/// ```text
/// catalog.rs   static table descriptions ({table → {column → $.path}})
///     ↓
/// ddl.rs       compiled CREATE/ALTER/trigger/index statements
///     ↓
/// sync.rs      version-aware create/upgrade through a SqlConnection
/// ```
pub mod catalog;
pub mod ddl;
mod sync;

pub use catalog::{
    structured_columns, ColumnType, JsonPath, StructuredColumn, TableSpec, CANONICAL_COLUMN,
    CATALOG, CHANGE_COLUMN, LEGACY_COLUMN, SETTINGS_TABLE,
};
pub use ddl::DdlContext;
pub use sync::{SchemaOutcome, SchemaSynchronizer};

/// Version written by this crate. Upgrading from any older version
/// re-applies the full DDL and recomputes every structured column.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Settings-table key holding the schema version.
pub const SCHEMA_VERSION_KEY: &str = "_schema_version";

/// Settings-table key holding the tenant that owns a table prefix.
pub const TENANT_NAME_KEY: &str = "_tenant_name";

/// Tried on every create or upgrade; each is optional.
pub const OPTIONAL_EXTENSIONS: &[&str] = &["pg_trgm", "btree_gin", "fuzzystrmatch", "unaccent"];
