use deadpool_postgres::Pool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Settings, Topology};
use crate::db::{create_pool, ConnectionTarget, PgConnection, SqlConnection, TableNames, TablePrefixer};
use crate::error::{Error, Result};
use crate::schema::{SchemaOutcome, SchemaSynchronizer};
use crate::tenant::{TenantPrefix, TenantRegistry};

/// An open tenant session with its schema synchronized.
pub struct Session {
    pub conn: Box<dyn SqlConnection>,
    pub prefix: Option<TenantPrefix>,
    pub outcome: SchemaOutcome,
}

/// Opens tenant sessions against one database server according to the
/// configured topology. All sessions share one pool when pooling is
/// configured.
pub struct Sessions {
    target: ConnectionTarget,
    topology: Topology,
    pool: Option<Pool>,
    names: Arc<TableNames>,
    registry: TenantRegistry,
    registry_path: PathBuf,
}

impl Sessions {
    pub async fn new(settings: &Settings, target: ConnectionTarget) -> Result<Self> {
        let pool = match settings.pool {
            Some(bounds) => Some(create_pool(&target, bounds.min, bounds.max).await?),
            None => None,
        };
        let registry_path = settings.registry_path();
        let registry = TenantRegistry::load(&registry_path)?;
        Ok(Self {
            target,
            topology: settings.topology,
            pool,
            names: Arc::new(settings.table_names()),
            registry,
            registry_path,
        })
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Prefix for `tenant` in the shared topology, registering it on first
    /// use. `None` in the separate topology.
    pub fn prefix_for(&mut self, tenant: Option<&str>) -> Result<Option<TenantPrefix>> {
        match (self.topology, tenant) {
            (Topology::Separate, _) => Ok(None),
            (Topology::Monolithic, None) => Err(Error::InvalidTenant {
                name: String::new(),
                reason: "a tenant name is required in the monolithic topology".into(),
            }),
            (Topology::Monolithic, Some(name)) => {
                let before = self.registry.len();
                let prefix = self.registry.register(name)?;
                if self.registry.len() != before {
                    self.registry.save(&self.registry_path)?;
                }
                Ok(Some(prefix))
            }
        }
    }

    /// Connect without touching the schema.
    pub async fn connect(&mut self, tenant: Option<&str>) -> Result<Box<dyn SqlConnection>> {
        let prefix = self.prefix_for(tenant)?;
        let conn = match &self.pool {
            Some(pool) => PgConnection::from_pool(self.target.clone(), pool.clone()),
            None => PgConnection::connect(self.target.clone()).await?,
        };
        let conn: Box<dyn SqlConnection> = match prefix {
            Some(prefix) => Box::new(TablePrefixer::new(conn, prefix, self.names.clone())?),
            None => Box::new(conn),
        };
        Ok(conn)
    }

    /// Connect and bring the tenant's schema to the current version.
    pub async fn open(&mut self, tenant: Option<&str>) -> Result<Session> {
        let mut conn = self.connect(tenant).await?;
        let prefix = conn.table_prefix().cloned();
        let mut sync = SchemaSynchronizer::new(conn.as_mut());
        if let Some(name) = tenant {
            sync = sync.with_tenant(name);
        }
        let outcome = sync.ensure_schema().await?;
        tracing::info!(tenant = tenant.unwrap_or("-"), ?outcome, "session open");
        Ok(Session {
            conn,
            prefix,
            outcome,
        })
    }
}
