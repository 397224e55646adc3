use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Connection, NoTls, Row};

use super::cursor::Cursor;
use super::target::{ConnectionTarget, SslMode};
use crate::dialect::{self, Translator};
use crate::error::{Error, ExecutionError, Result};
use crate::tenant::TenantPrefix;

/// Positional statement parameters, as the driver takes them.
pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

/// The primitives the entity layer, the schema synchronizer and the
/// collaborators above them use to talk to the database.
///
/// One implementation owns one physical connection (or one pool checkout at
/// a time) and is not meant to be shared between concurrent callers; every
/// method takes `&mut self`, so statements run in submission order.
#[async_trait]
pub trait SqlConnection: Send {
    /// Translate `sql` from the legacy dialect and run it. Each call returns
    /// a new, independent cursor; the most recent one also backs
    /// [`fetchone`](Self::fetchone) and [`fetchall`](Self::fetchall).
    async fn execute(&mut self, sql: &str, params: Params<'_>) -> Result<Cursor>;

    fn fetchone(&mut self) -> Option<Row>;

    fn fetchall(&mut self) -> Vec<Row>;

    /// Open a transaction now. A no-op when one is already open.
    async fn begin(&mut self) -> Result<()>;

    /// Whether a transaction is open and will be ended by the next
    /// [`commit`](Self::commit) or [`rollback`](Self::rollback).
    fn in_transaction(&self) -> bool;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Whether a table exists on the search path, folding `name` the way
    /// the engine folds unquoted identifiers.
    async fn table_exists(&mut self, name: &str) -> Result<bool>;

    /// The raw driver client, for statements that must bypass translation
    /// (advisory locks, LISTEN/NOTIFY, savepoints).
    async fn client(&mut self) -> Result<&Client>;

    fn target(&self) -> &ConnectionTarget;

    /// Prefix applied to logical table names, when this connection is
    /// namespaced.
    fn table_prefix(&self) -> Option<&TenantPrefix> {
        None
    }
}

enum Backend {
    Direct(Client),
    Pooled { pool: Pool, held: Option<Object> },
}

/// Connection adapter over a single client or a deadpool pool.
pub struct PgConnection {
    target: ConnectionTarget,
    backend: Backend,
    translator: Arc<Translator>,
    autocommit: bool,
    in_transaction: bool,
    last: Option<Cursor>,
}

impl PgConnection {
    /// Open a dedicated connection.
    pub async fn connect(target: ConnectionTarget) -> Result<Self> {
        let client = create_client(&target).await?;
        if let Some(schema) = target.schema() {
            set_search_path(&client, schema).await?;
        }
        tracing::info!(target = %target, "connected");
        Ok(Self::with_backend(target, Backend::Direct(client)))
    }

    /// Use a pool; a client is checked out on the first statement of each
    /// transaction and returned on commit or rollback.
    pub fn from_pool(target: ConnectionTarget, pool: Pool) -> Self {
        Self::with_backend(target, Backend::Pooled { pool, held: None })
    }

    fn with_backend(target: ConnectionTarget, backend: Backend) -> Self {
        Self {
            autocommit: target.autocommit(),
            target,
            backend,
            translator: Arc::new(Translator::sqlite_to_postgres()),
            in_transaction: false,
            last: None,
        }
    }

    /// Replace the statement translator (e.g. with an identity translator
    /// for callers that already speak PostgreSQL).
    pub fn with_translator(mut self, translator: Translator) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.autocommit = autocommit;
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.backend, Backend::Pooled { .. })
    }

    async fn acquire(&mut self) -> Result<&Client> {
        match &mut self.backend {
            Backend::Direct(client) => Ok(&*client),
            Backend::Pooled { pool, held } => {
                if held.is_none() {
                    let object = pool.get().await?;
                    if let Some(schema) = self.target.schema() {
                        set_search_path(&object, schema).await?;
                    }
                    *held = Some(object);
                }
                match held {
                    Some(object) => {
                        let client: &Client = object;
                        Ok(client)
                    }
                    None => Err(Error::Pool("no client checked out".into())),
                }
            }
        }
    }

    /// Return a pooled client once no transaction needs it.
    fn release(&mut self) {
        if let Backend::Pooled { held, .. } = &mut self.backend {
            if held.take().is_some() {
                tracing::trace!("returned client to pool");
            }
        }
    }

    async fn end_transaction(&mut self, command: &'static str) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        let result = {
            let client = self.acquire().await?;
            client
                .batch_execute(command)
                .await
                .map_err(|e| ExecutionError::new(e, command))
        };
        self.in_transaction = false;
        self.release();
        tracing::debug!(command, "transaction finished");
        result.map_err(Error::from)
    }
}

impl Drop for PgConnection {
    /// A pooled client still inside a transaction is detached from the pool
    /// and closed, so the server rolls the transaction back instead of the
    /// next checkout inheriting it.
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Backend::Pooled { held, .. } = &mut self.backend {
            if let Some(object) = held.take() {
                tracing::warn!(target = %self.target, "dropped with an open transaction; discarding pooled client");
                drop(Object::take(object));
            }
        }
    }
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn execute(&mut self, sql: &str, params: Params<'_>) -> Result<Cursor> {
        let sql = dialect::to_driver_sql(&self.translator, sql);
        tracing::debug!(sql = %sql, params = params.len(), "execute");

        let open_transaction = !self.autocommit && !self.in_transaction;
        let result = {
            let client = self.acquire().await?;
            if open_transaction {
                client
                    .batch_execute("BEGIN")
                    .await
                    .map_err(|e| ExecutionError::new(e, "BEGIN"))?;
            }
            run_statement(client, &sql, params).await
        };
        if open_transaction {
            self.in_transaction = true;
        }
        if self.autocommit && !self.in_transaction {
            self.release();
        }

        let cursor = result?;
        self.last = Some(cursor.clone());
        Ok(cursor)
    }

    fn fetchone(&mut self) -> Option<Row> {
        self.last.as_ref().and_then(Cursor::fetchone)
    }

    fn fetchall(&mut self) -> Vec<Row> {
        self.last.as_ref().map(Cursor::fetchall).unwrap_or_default()
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.acquire()
            .await?
            .batch_execute("BEGIN")
            .await
            .map_err(|e| ExecutionError::new(e, "BEGIN"))?;
        self.in_transaction = true;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn commit(&mut self) -> Result<()> {
        self.end_transaction("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.end_transaction("ROLLBACK").await
    }

    async fn table_exists(&mut self, name: &str) -> Result<bool> {
        const SQL: &str = "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
                           WHERE schemaname = ANY (current_schemas(false)) AND tablename = $1)";
        let folded = fold_identifier(name);
        let exists = {
            let client = self.acquire().await?;
            let row = client
                .query_one(SQL, &[&folded])
                .await
                .map_err(|e| ExecutionError::new(e, SQL))?;
            row.try_get::<_, bool>(0)
                .map_err(|e| ExecutionError::new(e, SQL))?
        };
        if !self.in_transaction {
            self.release();
        }
        Ok(exists)
    }

    async fn client(&mut self) -> Result<&Client> {
        self.acquire().await
    }

    fn target(&self) -> &ConnectionTarget {
        &self.target
    }
}

async fn run_statement(client: &Client, sql: &str, params: Params<'_>) -> Result<Cursor> {
    let statement = client
        .prepare(sql)
        .await
        .map_err(|e| ExecutionError::new(e, sql))?;

    if statement.columns().is_empty() {
        let affected = client
            .execute(&statement, params)
            .await
            .map_err(|e| ExecutionError::new(e, sql))?;
        Ok(Cursor::affected(affected))
    } else {
        let rows = client
            .query(&statement, params)
            .await
            .map_err(|e| ExecutionError::new(e, sql))?;
        Ok(Cursor::from_rows(&statement, rows))
    }
}

/// Unquoted identifiers fold to lower case; quoted ones keep their case.
pub fn fold_identifier(name: &str) -> String {
    match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => name.to_lowercase(),
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

async fn set_search_path(client: &Client, schema: &str) -> Result<()> {
    let sql = format!("SET search_path TO {}", quote_identifier(schema));
    client
        .batch_execute(&sql)
        .await
        .map_err(|e| ExecutionError::new(e, &sql))?;
    Ok(())
}

/// Create a pool of at most `max` connections, opening `min` of them
/// eagerly so connection problems surface here rather than mid-session.
pub async fn create_pool(target: &ConnectionTarget, min: usize, max: usize) -> Result<Pool> {
    if max == 0 || min > max {
        return Err(Error::Pool(format!(
            "invalid pool bounds min={} max={}",
            min, max
        )));
    }

    let mut config = target.pg_config();
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = match target.ssl_mode()? {
        SslMode::Disable => {
            config.ssl_mode(tokio_postgres::config::SslMode::Disable);
            Manager::from_config(config, NoTls, manager_config)
        }
        mode => {
            config.ssl_mode(driver_ssl_mode(mode));
            let tls = build_tls_connector(target, is_strict(mode))?;
            Manager::from_config(config, tls, manager_config)
        }
    };

    let pool = Pool::builder(manager)
        .max_size(max)
        .build()
        .map_err(|e| Error::Pool(e.to_string()))?;

    let mut warm = Vec::with_capacity(min);
    for _ in 0..min {
        warm.push(pool.get().await?);
    }
    drop(warm);

    tracing::info!(target = %target, min, max, "created connection pool");
    Ok(pool)
}

fn is_strict(mode: SslMode) -> bool {
    matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull)
}

fn driver_ssl_mode(mode: SslMode) -> tokio_postgres::config::SslMode {
    match mode {
        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
        SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            tokio_postgres::config::SslMode::Require
        }
    }
}

/// Open a client and spawn the driver task that pumps its socket.
async fn create_client(target: &ConnectionTarget) -> Result<Client> {
    let mut config = target.pg_config();
    let timeout = target.connect_timeout() + std::time::Duration::from_secs(5);
    let connect_error = |source| Error::Connect {
        target: target.to_string(),
        source,
    };
    let timed_out = || Error::Pool(format!("connection to {} timed out", target));

    let client = match target.ssl_mode()? {
        SslMode::Disable => {
            config.ssl_mode(tokio_postgres::config::SslMode::Disable);
            let (client, connection) = tokio::time::timeout(timeout, config.connect(NoTls))
                .await
                .map_err(|_| timed_out())?
                .map_err(connect_error)?;
            spawn_driver(connection);
            client
        }
        mode => {
            config.ssl_mode(driver_ssl_mode(mode));
            let tls = build_tls_connector(target, is_strict(mode))?;
            let (client, connection) = tokio::time::timeout(timeout, config.connect(tls))
                .await
                .map_err(|_| timed_out())?
                .map_err(connect_error)?;
            spawn_driver(connection);
            client
        }
    };
    Ok(client)
}

fn spawn_driver<S, T>(connection: Connection<S, T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "connection error");
        }
    });
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// `strict_verify` is set for verify-ca/verify-full; otherwise certificate
/// checks are relaxed the way libpq's `require` mode relaxes them.
fn build_tls_connector(target: &ConnectionTarget, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(path) = target.ssl_root_cert() {
        let pem = std::fs::read(path)?;
        let cert = native_tls::Certificate::from_pem(&pem)?;
        builder.add_root_certificate(cert);
    }
    if strict_verify && target.ssl_mode()? == SslMode::VerifyCa {
        builder.danger_accept_invalid_hostnames(true);
    }

    let connector = builder.build()?;
    Ok(MakeTlsConnector::new(connector))
}
