use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pgtenant::config::Settings;
use pgtenant::db::{CellValue, ConnectionTarget, Cursor};
use pgtenant::dialect;
use pgtenant::schema::{SchemaSynchronizer, SETTINGS_TABLE};
use pgtenant::session::Sessions;
use pgtenant::tenant::{TenantPrefix, TenantRegistry};

/// Multi-tenant PostgreSQL storage adapter tooling
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Connection descriptor (URL, host:port:dbname:schema, or dbname)
    #[arg(long, short = 'd', global = true)]
    descriptor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the PostgreSQL form of a SQLite-dialect statement
    Translate { sql: String },
    /// Print the table prefix a tenant name sanitizes to
    Prefix { tenant: String },
    /// Add a tenant to the registry, failing on a prefix collision
    Register { tenant: String },
    /// Create or upgrade the schema
    EnsureSchema {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Print the stored schema version
    SchemaVersion {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Run one statement and print its result
    Query {
        sql: String,
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    match &cli.command {
        Command::Translate { sql } => {
            println!("{}", dialect::translate(sql));
        }
        Command::Prefix { tenant } => {
            let prefix = TenantPrefix::from_tenant_name(tenant)?;
            let registry = TenantRegistry::load(&settings.registry_path())?;
            match registry.tenant_for(&prefix) {
                Some(owner) if owner != tenant => {
                    println!("{}  (already registered to {:?})", prefix, owner)
                }
                _ => println!("{}", prefix),
            }
        }
        Command::Register { tenant } => {
            let path = settings.registry_path();
            let mut registry = TenantRegistry::load(&path)?;
            let prefix = registry.register(tenant)?;
            registry.save(&path)?;
            println!("{} -> {}", tenant, prefix);
        }
        Command::EnsureSchema { tenant } => {
            let mut sessions = Sessions::new(&settings, resolve_target(&cli, &settings)?).await?;
            let session = sessions.open(tenant.as_deref()).await?;
            println!("{:?}", session.outcome);
        }
        Command::SchemaVersion { tenant } => {
            let mut sessions = Sessions::new(&settings, resolve_target(&cli, &settings)?).await?;
            let mut conn = sessions.connect(tenant.as_deref()).await?;
            let version = if conn.table_exists(SETTINGS_TABLE).await? {
                SchemaSynchronizer::new(conn.as_mut())
                    .get_schema_version()
                    .await?
            } else {
                0
            };
            conn.rollback().await?;
            println!("{}", version);
        }
        Command::Query { sql, tenant } => {
            let mut sessions = Sessions::new(&settings, resolve_target(&cli, &settings)?).await?;
            let mut session = sessions.open(tenant.as_deref()).await?;
            let cursor = session.conn.execute(sql, &[]).await?;
            print_cursor(&cursor);
            session.conn.commit().await?;
        }
    }

    Ok(())
}

/// Descriptor from the command line or config, with the password resolved
/// from PGPASSWORD or an interactive prompt.
fn resolve_target(cli: &Cli, settings: &Settings) -> Result<ConnectionTarget> {
    let Some(descriptor) = cli.descriptor.as_ref().or(settings.descriptor.as_ref()) else {
        bail!("no connection descriptor: pass --descriptor or set `descriptor` in the config");
    };
    let mut target = ConnectionTarget::parse(descriptor)?;
    if target.password.is_none() {
        let prompt = format!("Password for {}: ", target.display_string());
        let password = rpassword::read_password_from_tty(Some(&prompt))?;
        if !password.is_empty() {
            target.password = Some(password);
        }
    }
    Ok(target)
}

fn print_cursor(cursor: &Cursor) {
    if cursor.description().is_empty() {
        println!("{} row(s) affected", cursor.rowcount());
        return;
    }
    let header: Vec<&str> = cursor.description().iter().map(|c| c.name.as_str()).collect();
    println!("{}", header.join("\t"));
    for row in cursor.fetchall() {
        let cells: Vec<String> = CellValue::from_row(&row).iter().map(CellValue::display).collect();
        println!("{}", cells.join("\t"));
    }
    println!("({} rows)", cursor.rowcount());
}
