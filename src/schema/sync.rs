use serde_json::Value;
use std::collections::BTreeSet;

use super::catalog::{CATALOG, SETTINGS_TABLE};
use super::ddl::{self, DdlContext};
use super::{CURRENT_SCHEMA_VERSION, OPTIONAL_EXTENSIONS, SCHEMA_VERSION_KEY, TENANT_NAME_KEY};
use crate::db::SqlConnection;
use crate::error::{Error, Result};

/// Serializes DDL on the tables every tenant shares.
const SHARED_LOCK: &str = "pgtenant.schema.shared";

const SCOPE_SAVEPOINT: &str = "pgtenant_schema";

/// Where a synchronizer operation keeps its work until it succeeds.
#[derive(Debug, Clone, Copy)]
enum Scope {
    Transaction,
    Savepoint,
}

/// What [`SchemaSynchronizer::ensure_schema`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    Created,
    Upgraded { from: i64 },
    UpToDate,
}

/// Creates and upgrades the physical schema through a (possibly
/// namespaced) connection.
pub struct SchemaSynchronizer<'a> {
    conn: &'a mut dyn SqlConnection,
    use_jsonb: bool,
    tenant: Option<String>,
}

impl<'a> SchemaSynchronizer<'a> {
    pub fn new(conn: &'a mut dyn SqlConnection) -> Self {
        let use_jsonb = conn.target().use_jsonb();
        Self {
            conn,
            use_jsonb,
            tenant: None,
        }
    }

    /// Record `name` as the owner of this connection's table prefix, and
    /// refuse to proceed if a different tenant already owns it.
    pub fn with_tenant(mut self, name: &str) -> Self {
        self.tenant = Some(name.to_string());
        self
    }

    pub fn use_jsonb(&self) -> bool {
        self.use_jsonb
    }

    fn context(&self, extensions: BTreeSet<String>) -> DdlContext {
        DdlContext {
            prefix: self.conn.table_prefix().cloned(),
            use_jsonb: self.use_jsonb,
            extensions,
        }
    }

    /// Bring the schema to the current version. Safe to call on every
    /// session open; a second call is a no-op.
    ///
    /// Runs in a transaction of its own, or in a savepoint when the caller
    /// already has one open. In the latter case the caller's commit or
    /// rollback decides, and the advisory locks are held until then.
    pub async fn ensure_schema(&mut self) -> Result<SchemaOutcome> {
        let scope = self.open_scope().await?;
        let result = self.ensure_schema_locked().await;
        let outcome = self.close_scope(scope, result, "ensure_schema").await?;
        match outcome {
            SchemaOutcome::UpToDate => tracing::debug!("schema up to date"),
            other => tracing::info!(outcome = ?other, version = CURRENT_SCHEMA_VERSION, "schema synchronized"),
        }
        Ok(outcome)
    }

    async fn open_scope(&mut self) -> Result<Scope> {
        if self.conn.in_transaction() {
            self.conn
                .execute(&format!("SAVEPOINT {}", SCOPE_SAVEPOINT), &[])
                .await?;
            Ok(Scope::Savepoint)
        } else {
            self.conn.begin().await?;
            Ok(Scope::Transaction)
        }
    }

    /// End `scope` according to `result` and hand the result back.
    async fn close_scope<T>(&mut self, scope: Scope, result: Result<T>, operation: &str) -> Result<T> {
        match (result, scope) {
            (Ok(value), Scope::Transaction) => {
                self.conn.commit().await?;
                Ok(value)
            }
            (Ok(value), Scope::Savepoint) => {
                self.conn
                    .execute(&format!("RELEASE SAVEPOINT {}", SCOPE_SAVEPOINT), &[])
                    .await?;
                Ok(value)
            }
            (Err(e), scope) => {
                let undone = match scope {
                    Scope::Transaction => self.conn.rollback().await,
                    Scope::Savepoint => self.undo_savepoint().await,
                };
                if let Err(undo) = undone {
                    tracing::error!(error = %undo, operation, "rollback after failure");
                }
                Err(e)
            }
        }
    }

    async fn undo_savepoint(&mut self) -> Result<()> {
        self.conn
            .execute(&format!("ROLLBACK TO SAVEPOINT {}", SCOPE_SAVEPOINT), &[])
            .await?;
        self.conn
            .execute(&format!("RELEASE SAVEPOINT {}", SCOPE_SAVEPOINT), &[])
            .await?;
        Ok(())
    }

    async fn ensure_schema_locked(&mut self) -> Result<SchemaOutcome> {
        let key = format!(
            "pgtenant.schema.{}",
            self.conn.table_prefix().map(|p| p.as_str()).unwrap_or("")
        );
        self.lock(&key).await?;

        let outcome = if !self.conn.table_exists(SETTINGS_TABLE).await? {
            tracing::info!(use_jsonb = self.use_jsonb, "creating schema");
            self.lock(SHARED_LOCK).await?;
            self.create_tables().await?;
            self.write_version(CURRENT_SCHEMA_VERSION).await?;
            SchemaOutcome::Created
        } else {
            let stored = self.get_schema_version().await?;
            if stored > CURRENT_SCHEMA_VERSION {
                return Err(Error::SchemaState(format!(
                    "stored schema version {} is newer than supported version {}",
                    stored, CURRENT_SCHEMA_VERSION
                )));
            }
            if stored < CURRENT_SCHEMA_VERSION {
                tracing::info!(from = stored, to = CURRENT_SCHEMA_VERSION, "upgrading schema");
                self.lock(SHARED_LOCK).await?;
                self.upgrade().await?;
                self.write_version(CURRENT_SCHEMA_VERSION).await?;
                SchemaOutcome::Upgraded { from: stored }
            } else {
                SchemaOutcome::UpToDate
            }
        };

        self.claim_tenant().await?;
        Ok(outcome)
    }

    /// Transaction-scoped advisory lock. Always taken per prefix first and
    /// [`SHARED_LOCK`] second, so tenants never wait on each other in a cycle.
    async fn lock(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("SELECT pg_advisory_xact_lock(hashtext(%s))", &[&key])
            .await?;
        Ok(())
    }

    /// Create every catalog table with its triggers and indexes, in one
    /// transaction (or savepoint, see [`ensure_schema`](Self::ensure_schema)).
    pub async fn create_all(&mut self) -> Result<()> {
        let scope = self.open_scope().await?;
        let created = match self.lock(SHARED_LOCK).await {
            Ok(()) => self.create_tables().await,
            Err(e) => Err(e),
        };
        self.close_scope(scope, created, "create_all").await
    }

    async fn create_tables(&mut self) -> Result<()> {
        let extensions = self.try_extensions().await?;
        let ctx = self.context(extensions);
        for spec in CATALOG {
            for sql in ddl::table_statements(spec, &ctx)? {
                self.conn.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    /// Re-apply the full DDL, then recompute structured columns of every
    /// existing row.
    async fn upgrade(&mut self) -> Result<()> {
        self.create_tables().await?;
        let ctx = self.context(BTreeSet::new());
        for spec in CATALOG {
            if let Some(sql) = ddl::backfill(spec, &ctx) {
                let cursor = self.conn.execute(&sql, &[]).await?;
                tracing::debug!(table = spec.name, rows = cursor.rowcount(), "backfilled");
            }
        }
        Ok(())
    }

    /// Enable whichever optional extensions the server allows. Failures are
    /// logged and skipped.
    pub async fn optional_extensions(&mut self) -> Result<BTreeSet<String>> {
        let scope = self.open_scope().await?;
        let enabled = self.try_extensions().await;
        self.close_scope(scope, enabled, "optional_extensions").await
    }

    /// Must run inside a transaction: each attempt is isolated by a
    /// savepoint so a refusal does not abort the surrounding work.
    async fn try_extensions(&mut self) -> Result<BTreeSet<String>> {
        let mut enabled = BTreeSet::new();
        for ext in OPTIONAL_EXTENSIONS {
            self.conn.execute("SAVEPOINT pgtenant_ext", &[]).await?;
            let create = format!("CREATE EXTENSION IF NOT EXISTS {}", ext);
            match self.conn.execute(&create, &[]).await {
                Ok(_) => {
                    self.conn
                        .execute("RELEASE SAVEPOINT pgtenant_ext", &[])
                        .await?;
                    enabled.insert(ext.to_string());
                }
                Err(e) => {
                    tracing::warn!(extension = ext, error = %e, "optional extension unavailable");
                    self.conn
                        .execute("ROLLBACK TO SAVEPOINT pgtenant_ext", &[])
                        .await?;
                }
            }
        }
        Ok(enabled)
    }

    /// Read a setting, or `None` when it was never written.
    pub async fn get_setting(&mut self, key: &str) -> Result<Option<Value>> {
        let sql = if self.use_jsonb {
            "SELECT json_data, blob_data FROM metadata WHERE setting = %s"
        } else {
            "SELECT NULL::jsonb, blob_data FROM metadata WHERE setting = %s"
        };
        let cursor = self.conn.execute(sql, &[&key]).await?;
        let Some(row) = cursor.fetchone() else {
            return Ok(None);
        };

        let json: Option<Value> = row
            .try_get(0)
            .map_err(|e| crate::error::ExecutionError::new(e, sql))?;
        if json.is_some() {
            return Ok(json);
        }
        let blob: Option<Vec<u8>> = row
            .try_get(1)
            .map_err(|e| crate::error::ExecutionError::new(e, sql))?;
        match blob {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                Error::SchemaState(format!("setting {:?} cannot be decoded: {}", key, e))
            }),
        }
    }

    /// Upsert a setting in both representations.
    pub async fn set_setting(&mut self, key: &str, value: &Value) -> Result<()> {
        let blob = serde_json::to_vec(value).map_err(|e| Error::SchemaState(e.to_string()))?;
        if self.use_jsonb {
            self.conn
                .execute(
                    "INSERT INTO metadata (setting, json_data, blob_data, change_time) \
                     VALUES (%s, %s, %s, now()) \
                     ON CONFLICT (setting) DO UPDATE SET json_data = EXCLUDED.json_data, \
                     blob_data = EXCLUDED.blob_data, change_time = now()",
                    &[&key, value, &blob],
                )
                .await?;
        } else {
            self.conn
                .execute(
                    "INSERT INTO metadata (setting, blob_data, change_time) \
                     VALUES (%s, %s, now()) \
                     ON CONFLICT (setting) DO UPDATE SET blob_data = EXCLUDED.blob_data, \
                     change_time = now()",
                    &[&key, &blob],
                )
                .await?;
        }
        Ok(())
    }

    /// Stored schema version; 0 when the table has never been versioned.
    pub async fn get_schema_version(&mut self) -> Result<i64> {
        let version = match self.get_setting(SCHEMA_VERSION_KEY).await? {
            None => 0,
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| bad_version(&n))?,
            Some(Value::String(s)) => s.trim().parse().map_err(|_| bad_version(&s))?,
            Some(other) => return Err(bad_version(&other)),
        };
        if version < 0 {
            return Err(bad_version(&version));
        }
        Ok(version)
    }

    /// Advance the stored version. Writing an older version than the stored
    /// one is refused.
    pub async fn set_schema_version(&mut self, version: i64) -> Result<()> {
        let stored = self.get_schema_version().await?;
        if version < stored {
            return Err(Error::SchemaState(format!(
                "refusing to move schema version back from {} to {}",
                stored, version
            )));
        }
        self.write_version(version).await
    }

    async fn write_version(&mut self, version: i64) -> Result<()> {
        self.set_setting(SCHEMA_VERSION_KEY, &Value::from(version))
            .await
    }

    /// In a shared database, bind the prefix to the tenant name on first use
    /// and detect a different tenant sanitizing to the same prefix later.
    async fn claim_tenant(&mut self) -> Result<()> {
        let (Some(prefix), Some(tenant)) = (self.conn.table_prefix().cloned(), self.tenant.clone())
        else {
            return Ok(());
        };
        match self.get_setting(TENANT_NAME_KEY).await? {
            Some(Value::String(existing)) if existing == tenant => Ok(()),
            Some(Value::String(existing)) => Err(Error::NamespaceCollision {
                prefix: prefix.to_string(),
                existing,
                requested: tenant,
            }),
            Some(other) => Err(Error::SchemaState(format!(
                "tenant name setting holds {}",
                other
            ))),
            None => {
                tracing::info!(tenant = %tenant, prefix = %prefix, "claimed table prefix");
                self.set_setting(TENANT_NAME_KEY, &Value::String(tenant))
                    .await
            }
        }
    }
}

fn bad_version(value: &dyn std::fmt::Display) -> Error {
    Error::SchemaState(format!("unreadable schema version {}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::namespace::{RecordingConnection, TableNames, TablePrefixer};
    use crate::tenant::TenantPrefix;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_all_runs_in_one_transaction() {
        let mut conn = RecordingConnection::new();
        SchemaSynchronizer::new(&mut conn).create_all().await.unwrap();

        let stmts = &conn.statements;
        assert_eq!(stmts.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(stmts[1], "SELECT pg_advisory_xact_lock(hashtext(%s))");
        assert_eq!(stmts.last().map(String::as_str), Some("COMMIT"));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS person (")));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS metadata (")));
        // the recorder accepts every extension
        assert!(stmts.iter().any(|s| s.contains("gin_trgm_ops")));
        assert_eq!(
            stmts.iter().filter(|s| *s == "SAVEPOINT pgtenant_ext").count(),
            OPTIONAL_EXTENSIONS.len()
        );
    }

    #[tokio::test]
    async fn test_ensure_schema_on_fresh_target() {
        let mut conn = TablePrefixer::new(
            RecordingConnection::new(),
            TenantPrefix::from_tenant_name("Smith Family").unwrap(),
            Arc::new(TableNames::default()),
        )
        .unwrap();
        let outcome = SchemaSynchronizer::new(&mut conn)
            .with_tenant("Smith Family")
            .ensure_schema()
            .await
            .unwrap();
        assert_eq!(outcome, SchemaOutcome::Created);

        let stmts = conn.into_inner().statements;
        let locks = stmts
            .iter()
            .filter(|s| s.starts_with("SELECT pg_advisory_xact_lock"))
            .count();
        assert_eq!(locks, 2);
        assert!(stmts[1].starts_with("SELECT pg_advisory_xact_lock"));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS smith_family_person (")));
        assert!(stmts.iter().any(|s| s.starts_with(
            "CREATE TRIGGER smith_family_person_sync BEFORE INSERT OR UPDATE OF json_data ON smith_family_person"
        )));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS surname (")));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("INSERT INTO smith_family_metadata (setting")));
        assert_eq!(stmts.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_ensure_schema_inside_open_transaction_uses_savepoint() {
        let mut conn = RecordingConnection::new();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO person (handle) VALUES (%s)", &[&"H9"])
            .await
            .unwrap();

        let outcome = SchemaSynchronizer::new(&mut conn).ensure_schema().await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Created);
        assert!(conn.in_transaction());

        let stmts = &conn.statements;
        assert_eq!(stmts[0], "BEGIN");
        assert_eq!(stmts[2], "SAVEPOINT pgtenant_schema");
        assert_eq!(
            stmts.last().map(String::as_str),
            Some("RELEASE SAVEPOINT pgtenant_schema")
        );
        assert!(!stmts.iter().any(|s| s == "COMMIT" || s == "ROLLBACK"));
    }

    #[tokio::test]
    async fn test_failure_inside_open_transaction_only_undoes_savepoint() {
        let mut conn = RecordingConnection::new();
        conn.fail_on = Some("CREATE TABLE IF NOT EXISTS person");
        conn.begin().await.unwrap();

        let err = SchemaSynchronizer::new(&mut conn).create_all().await;
        assert!(err.is_err());
        assert!(conn.in_transaction());

        let stmts = &conn.statements;
        assert_eq!(stmts[1], "SAVEPOINT pgtenant_schema");
        let n = stmts.len();
        assert_eq!(stmts[n - 2], "ROLLBACK TO SAVEPOINT pgtenant_schema");
        assert_eq!(stmts[n - 1], "RELEASE SAVEPOINT pgtenant_schema");
        assert!(!stmts.iter().any(|s| s == "ROLLBACK"));
    }

    #[tokio::test]
    async fn test_failure_in_own_transaction_rolls_back() {
        let mut conn = RecordingConnection::new();
        conn.fail_on = Some("CREATE TABLE IF NOT EXISTS person");
        assert!(SchemaSynchronizer::new(&mut conn).create_all().await.is_err());
        assert_eq!(conn.statements.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(conn.statements.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_version_unset_reads_zero() {
        let mut conn = RecordingConnection::new();
        let mut sync = SchemaSynchronizer::new(&mut conn);
        assert_eq!(sync.get_schema_version().await.unwrap(), 0);
        assert_eq!(sync.get_setting("anything").await.unwrap(), None);
    }

    #[test]
    fn test_bad_version_message() {
        let err = bad_version(&"x1");
        assert!(matches!(err, Error::SchemaState(ref m) if m.contains("x1")));
    }
}
