use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "disable" => Some(SslMode::Disable),
            "prefer" | "allow" => Some(SslMode::Prefer),
            "require" => Some(SslMode::Require),
            "verify-ca" => Some(SslMode::VerifyCa),
            "verify-full" => Some(SslMode::VerifyFull),
            _ => None,
        }
    }
}

/// Which of the accepted descriptor grammars a target was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorForm {
    /// `scheme://[user[:pass]@]host[:port]/dbname[?opt=val&...]`
    Url,
    /// `host:port:dbname:schema`
    Traditional,
    /// `dbname`
    Bare,
}

/// A parsed connection descriptor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub form: DescriptorForm,
}

/// Descriptor fields before the environment overlay.
#[derive(Debug, Default)]
struct Partial {
    host: Option<String>,
    port: Option<u16>,
    dbname: Option<String>,
    user: Option<String>,
    password: Option<String>,
    options: BTreeMap<String, String>,
}

impl ConnectionTarget {
    /// Parse a descriptor, filling missing fields from `PGHOST`, `PGPORT`,
    /// `PGDATABASE`, `PGUSER` and `PGPASSWORD`.
    pub fn parse(descriptor: &str) -> Result<Self> {
        Self::parse_with_env(descriptor, |key| std::env::var(key).ok())
    }

    /// Parse a descriptor with an explicit environment lookup.
    pub fn parse_with_env<F>(descriptor: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let descriptor = descriptor.trim();
        let (form, partial) = if descriptor.contains("://") {
            (DescriptorForm::Url, parse_url(descriptor)?)
        } else if descriptor.contains(':') {
            (DescriptorForm::Traditional, parse_traditional(descriptor)?)
        } else if is_bare_token(descriptor) {
            (
                DescriptorForm::Bare,
                Partial {
                    dbname: Some(descriptor.to_string()),
                    ..Partial::default()
                },
            )
        } else {
            return Err(Error::ConnectionDescriptor(format!(
                "{:?} is not a URL, host:port:dbname:schema, or a database name",
                descriptor
            )));
        };
        let target = overlay_env(form, partial, env)?;
        target.ssl_mode()?;
        Ok(target)
    }

    /// Supply credentials out of band (bare descriptors carry none).
    pub fn with_credentials(mut self, user: &str, password: Option<String>) -> Self {
        self.user = user.to_string();
        self.password = password;
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// `use_jsonb` query option; defaults to true.
    pub fn use_jsonb(&self) -> bool {
        self.option("use_jsonb").map(parse_bool).unwrap_or(true)
    }

    /// `autocommit` option; defaults to false (explicit transactions).
    pub fn autocommit(&self) -> bool {
        self.option("autocommit").map(parse_bool).unwrap_or(false)
    }

    pub fn ssl_mode(&self) -> Result<SslMode> {
        match self.option("sslmode") {
            None => Ok(SslMode::default()),
            Some(v) => SslMode::parse(v)
                .ok_or_else(|| Error::ConnectionDescriptor(format!("unknown sslmode {:?}", v))),
        }
    }

    /// Path to a PEM CA certificate for verifying the server.
    pub fn ssl_root_cert(&self) -> Option<&str> {
        self.option("sslrootcert")
    }

    /// Schema to put on the search path after connecting.
    pub fn schema(&self) -> Option<&str> {
        self.option("schema").filter(|s| !s.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        self.option("connect_timeout")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10))
    }

    pub fn display_string(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }

    /// Driver configuration for this target.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .connect_timeout(self.connect_timeout())
            .application_name("pgtenant");
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("options", &self.options)
            .field("form", &self.form)
            .finish()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_string())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn is_bare_token(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '/' | '@' | '=' | '?'))
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_url(descriptor: &str) -> Result<Partial> {
    let url = url::Url::parse(descriptor)
        .map_err(|e| Error::ConnectionDescriptor(format!("malformed URL: {}", e)))?;

    let dbname = url.path().trim_start_matches('/');
    if dbname.contains('/') {
        return Err(Error::ConnectionDescriptor(format!(
            "URL path {:?} is not a single database name",
            url.path()
        )));
    }

    Ok(Partial {
        host: url.host_str().and_then(non_empty),
        port: url.port(),
        dbname: non_empty(&decode(dbname)),
        user: non_empty(&decode(url.username())),
        password: url.password().map(decode),
        options: url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
    })
}

fn parse_traditional(descriptor: &str) -> Result<Partial> {
    let fields: Vec<&str> = descriptor.split(':').collect();
    let &[host, port, dbname, schema] = &fields[..] else {
        return Err(Error::ConnectionDescriptor(format!(
            "expected host:port:dbname:schema, found {} field(s)",
            fields.len()
        )));
    };

    let port = if port.is_empty() {
        None
    } else {
        Some(port.parse::<u16>().map_err(|_| {
            Error::ConnectionDescriptor(format!("invalid port {:?}", port))
        })?)
    };

    let mut options = BTreeMap::new();
    if !schema.is_empty() {
        options.insert("schema".to_string(), schema.to_string());
    }

    Ok(Partial {
        host: non_empty(host),
        port,
        dbname: non_empty(dbname),
        options,
        ..Partial::default()
    })
}

fn overlay_env<F>(form: DescriptorForm, partial: Partial, env: F) -> Result<ConnectionTarget>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| env(key).filter(|v| !v.is_empty());

    let port = match partial.port {
        Some(p) => p,
        None => match lookup("PGPORT") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::ConnectionDescriptor(format!("invalid PGPORT {:?}", v)))?,
            None => DEFAULT_PORT,
        },
    };

    let dbname = partial
        .dbname
        .or_else(|| lookup("PGDATABASE"))
        .ok_or_else(|| Error::ConnectionDescriptor("no database name given".into()))?;
    let user = partial
        .user
        .or_else(|| lookup("PGUSER"))
        .ok_or_else(|| Error::ConnectionDescriptor("no user name given".into()))?;

    Ok(ConnectionTarget {
        host: partial
            .host
            .or_else(|| lookup("PGHOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port,
        dbname,
        user,
        password: partial.password.or_else(|| lookup("PGPASSWORD")),
        options: partial.options,
        form,
    })
}
