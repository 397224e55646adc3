use std::fmt;
use thiserror::Error;

/// Errors raised by the storage adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// The descriptor matches none of the accepted grammars, or required
    /// fields are still missing after the environment overlay.
    #[error("invalid connection descriptor: {0}")]
    ConnectionDescriptor(String),

    #[error("failed to connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// The engine rejected a statement. The driver error is kept verbatim.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// The stored schema cannot be brought to a consistent version.
    #[error("schema state error: {0}")]
    SchemaState(String),

    #[error("tenant {requested:?} collides with tenant {existing:?} on table prefix {prefix:?}")]
    NamespaceCollision {
        prefix: String,
        existing: String,
        requested: String,
    },

    #[error("invalid tenant name {name:?}: {reason}")]
    InvalidTenant { name: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Pool(err.to_string())
    }
}

impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

/// Categorized error types for statement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601 / 42000)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Data and constraint errors (division by zero, unique violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// A statement the engine refused, together with the SQL that was sent.
///
/// The driver error is the `source`; nothing about it is rewritten. The
/// accessors only add classification and position mapping on top.
#[derive(Debug, Error)]
#[error("{category}: {message}")]
pub struct ExecutionError {
    pub category: ErrorCategory,
    pub message: String,
    /// The statement as sent to the engine (after translation).
    pub sql: String,
    #[source]
    pub source: tokio_postgres::Error,
}

impl ExecutionError {
    pub fn new(source: tokio_postgres::Error, sql: &str) -> Self {
        let (category, message) = match source.as_db_error() {
            Some(db_err) => (
                categorize_sqlstate(db_err.code().code()),
                db_err.message().to_string(),
            ),
            None if source.is_closed() => (ErrorCategory::Connection, source.to_string()),
            None => (ErrorCategory::Unknown, source.to_string()),
        };
        Self {
            category,
            message,
            sql: sql.to_string(),
            source,
        }
    }

    /// SQLSTATE code, when the engine sent one.
    pub fn code(&self) -> Option<&str> {
        self.source.as_db_error().map(|e| e.code().code())
    }

    /// 1-based (line, column) of the error position inside `sql`.
    pub fn line_col(&self) -> Option<(usize, usize)> {
        let db_err = self.source.as_db_error()?;
        match db_err.position()? {
            tokio_postgres::error::ErrorPosition::Original(pos) => {
                Some(byte_offset_to_line_col(&self.sql, *pos as usize))
            }
            tokio_postgres::error::ErrorPosition::Internal { .. } => None,
        }
    }

    /// Format as a rich multi-line string.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let Some((line, col)) = self.line_col() {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if let Some(code) = self.code() {
            lines.push(format!("  SQLSTATE: {}", code));
        }
        if let Some(db_err) = self.source.as_db_error() {
            if let Some(detail) = db_err.detail() {
                lines.push(format!("  Detail: {}", detail));
            }
            if let Some(hint) = db_err.hint() {
                lines.push(format!("  Hint: {}", hint));
            }
            if let Some(table) = db_err.table() {
                lines.push(format!("  Table: {}", table));
            }
            if let Some(constraint) = db_err.constraint() {
                lines.push(format!("  Constraint: {}", constraint));
            }
        }
        lines.join("\n")
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
pub(crate) fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    if byte_pos == 0 || query.is_empty() {
        return (1, 1);
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub(crate) fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                // 42P01 = undefined_table, 42703 = undefined_column, etc.
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}
