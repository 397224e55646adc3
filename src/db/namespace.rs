use async_trait::async_trait;
use regex::{Captures, Regex};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_postgres::{Client, Row};

use super::connection::{fold_identifier, quote_identifier, Params, SqlConnection};
use super::cursor::Cursor;
use super::target::ConnectionTarget;
use crate::dialect::scanner;
use crate::error::{Error, Result};
use crate::tenant::TenantPrefix;

/// Logical tables owned by each tenant.
pub const DEFAULT_PREFIXED: &[&str] = &[
    "person",
    "family",
    "event",
    "place",
    "source",
    "citation",
    "repository",
    "media",
    "note",
    "tag",
    "metadata",
    "reference",
    "gender_stats",
];

/// Logical tables every tenant in a shared database reads and writes.
pub const DEFAULT_SHARED: &[&str] = &["name_group", "surname"];

/// The closed set of logical table names a [`TablePrefixer`] knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    prefixed: BTreeSet<String>,
    shared: BTreeSet<String>,
}

impl Default for TableNames {
    fn default() -> Self {
        Self::new(
            DEFAULT_PREFIXED.iter().copied(),
            DEFAULT_SHARED.iter().copied(),
        )
    }
}

impl TableNames {
    /// Names are stored lower-cased. A name listed in both sets is shared.
    pub fn new<'a, P, S>(prefixed: P, shared: S) -> Self
    where
        P: IntoIterator<Item = &'a str>,
        S: IntoIterator<Item = &'a str>,
    {
        let shared: BTreeSet<String> = shared.into_iter().map(str::to_lowercase).collect();
        let prefixed = prefixed
            .into_iter()
            .map(str::to_lowercase)
            .filter(|n| !shared.contains(n))
            .collect();
        Self { prefixed, shared }
    }

    pub fn with_prefixed(mut self, name: &str) -> Self {
        let name = name.to_lowercase();
        if !self.shared.contains(&name) {
            self.prefixed.insert(name);
        }
        self
    }

    pub fn with_shared(mut self, name: &str) -> Self {
        let name = name.to_lowercase();
        self.prefixed.remove(&name);
        self.shared.insert(name);
        self
    }

    pub fn is_prefixed(&self, name: &str) -> bool {
        self.prefixed.contains(&name.to_lowercase())
    }

    pub fn is_shared(&self, name: &str) -> bool {
        self.shared.contains(&name.to_lowercase())
    }

    pub fn prefixed(&self) -> impl Iterator<Item = &str> {
        self.prefixed.iter().map(String::as_str)
    }

    pub fn shared(&self) -> impl Iterator<Item = &str> {
        self.shared.iter().map(String::as_str)
    }

    /// Physical name of `name` for the tenant owning `prefix`.
    pub fn physical(&self, name: &str, prefix: &TenantPrefix) -> String {
        if self.is_prefixed(name) {
            prefix.apply(&name.to_lowercase())
        } else {
            name.to_string()
        }
    }

    /// `\b(name|...)\b`, longest names first so alternation never stops at
    /// a shorter name.
    fn pattern(&self) -> Result<Option<Regex>> {
        if self.prefixed.is_empty() {
            return Ok(None);
        }
        let mut names: Vec<&str> = self.prefixed().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let alternation = names
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))
            .map(Some)
            .map_err(|e| Error::Config(format!("cannot match prefixed table names: {}", e)))
    }
}

/// Connection decorator giving one tenant its own tables inside a shared
/// database.
///
/// Whole-word references to prefixed logical names in code spans become
/// `<prefix><name>`; literals, quoted identifiers, dollar-quoted bodies and
/// comments are left alone, as are already-prefixed names and the shared
/// tables.
pub struct TablePrefixer<C> {
    inner: C,
    prefix: TenantPrefix,
    names: Arc<TableNames>,
    pattern: Option<Regex>,
}

impl<C: SqlConnection> TablePrefixer<C> {
    pub fn new(inner: C, prefix: TenantPrefix, names: Arc<TableNames>) -> Result<Self> {
        let pattern = names.pattern()?;
        Ok(Self {
            inner,
            prefix,
            names,
            pattern,
        })
    }

    pub fn prefix(&self) -> &TenantPrefix {
        &self.prefix
    }

    pub fn names(&self) -> &TableNames {
        &self.names
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// The statement as it will be handed to the wrapped connection.
    pub fn rewrite(&self, sql: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return sql.to_string();
        };
        let prefix = self.prefix.as_str();
        scanner::map_code(sql, |code| {
            pattern
                .replace_all(code, |caps: &Captures| {
                    format!("{}{}", prefix, caps[0].to_lowercase())
                })
                .into_owned()
        })
    }
}

#[async_trait]
impl<C: SqlConnection> SqlConnection for TablePrefixer<C> {
    async fn execute(&mut self, sql: &str, params: Params<'_>) -> Result<Cursor> {
        let sql = self.rewrite(sql);
        self.inner.execute(&sql, params).await
    }

    fn fetchone(&mut self) -> Option<Row> {
        self.inner.fetchone()
    }

    fn fetchall(&mut self) -> Vec<Row> {
        self.inner.fetchall()
    }

    async fn begin(&mut self) -> Result<()> {
        self.inner.begin().await
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.inner.rollback().await
    }

    /// `name` is folded like an identifier before the prefix is applied, so
    /// `"person"` and `person` name the same table.
    async fn table_exists(&mut self, name: &str) -> Result<bool> {
        let folded = fold_identifier(name);
        let physical = if self.names.prefixed.contains(&folded) {
            self.prefix.apply(&folded)
        } else {
            folded
        };
        self.inner.table_exists(&quote_identifier(&physical)).await
    }

    async fn client(&mut self) -> Result<&Client> {
        self.inner.client().await
    }

    fn target(&self) -> &ConnectionTarget {
        self.inner.target()
    }

    fn table_prefix(&self) -> Option<&TenantPrefix> {
        Some(&self.prefix)
    }
}

/// Records statements instead of running them.
#[cfg(test)]
pub(crate) struct RecordingConnection {
    pub target: ConnectionTarget,
    pub statements: Vec<String>,
    pub existing: BTreeSet<String>,
    pub in_transaction: bool,
    /// Statements containing this text fail after being recorded.
    pub fail_on: Option<&'static str>,
}

#[cfg(test)]
impl RecordingConnection {
    pub fn new() -> Self {
        Self {
            target: ConnectionTarget::parse_with_env("postgresql://u@localhost/gramps", |_| None)
                .expect("valid descriptor"),
            statements: Vec::new(),
            existing: BTreeSet::new(),
            in_transaction: false,
            fail_on: None,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SqlConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str, _params: Params<'_>) -> Result<Cursor> {
        self.statements.push(sql.to_string());
        match self.fail_on {
            Some(text) if sql.contains(text) => {
                Err(Error::SchemaState(format!("refused: {}", sql)))
            }
            _ => Ok(Cursor::affected(0)),
        }
    }

    fn fetchone(&mut self) -> Option<Row> {
        None
    }

    fn fetchall(&mut self) -> Vec<Row> {
        Vec::new()
    }

    async fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.statements.push("BEGIN".into());
            self.in_transaction = true;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn commit(&mut self) -> Result<()> {
        self.statements.push("COMMIT".into());
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.statements.push("ROLLBACK".into());
        self.in_transaction = false;
        Ok(())
    }

    async fn table_exists(&mut self, name: &str) -> Result<bool> {
        Ok(self.existing.contains(&fold_identifier(name)))
    }

    async fn client(&mut self) -> Result<&Client> {
        Err(Error::Pool("recording connection has no client".into()))
    }

    fn target(&self) -> &ConnectionTarget {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smith() -> TablePrefixer<RecordingConnection> {
        TablePrefixer::new(
            RecordingConnection::new(),
            TenantPrefix::from_tenant_name("Smith Family").unwrap(),
            Arc::new(TableNames::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_prefixes_owned_tables() {
        let ns = smith();
        assert_eq!(
            ns.rewrite("SELECT * FROM person WHERE handle=%s"),
            "SELECT * FROM smith_family_person WHERE handle=%s"
        );
        assert_eq!(
            ns.rewrite("SELECT p.json_data FROM Person p JOIN family f ON f.father_handle = p.handle"),
            "SELECT p.json_data FROM smith_family_person p JOIN smith_family_family f ON f.father_handle = p.handle"
        );
    }

    #[test]
    fn test_shared_tables_untouched() {
        let ns = smith();
        assert_eq!(ns.rewrite("SELECT * FROM surname"), "SELECT * FROM surname");
        assert_eq!(
            ns.rewrite("INSERT INTO name_group (name, group_name) VALUES (%s, %s)"),
            "INSERT INTO name_group (name, group_name) VALUES (%s, %s)"
        );
    }

    #[test]
    fn test_whole_words_only() {
        let ns = smith();
        assert_eq!(
            ns.rewrite("SELECT personal, event_ref_list, smith_family_person FROM persons"),
            "SELECT personal, event_ref_list, smith_family_person FROM persons"
        );
        assert_eq!(
            ns.rewrite("CREATE INDEX person_gramps_id_idx ON person (gramps_id)"),
            "CREATE INDEX person_gramps_id_idx ON smith_family_person (gramps_id)"
        );
    }

    #[test]
    fn test_literals_and_comments_untouched() {
        let ns = smith();
        assert_eq!(
            ns.rewrite("SELECT 'person' AS kind FROM person -- person\n"),
            "SELECT 'person' AS kind FROM smith_family_person -- person\n"
        );
        assert_eq!(
            ns.rewrite("SELECT \"person\" FROM note /* note */"),
            "SELECT \"person\" FROM smith_family_note /* note */"
        );
        assert_eq!(
            ns.rewrite("CREATE FUNCTION f() RETURNS trigger AS $$ SELECT 1 FROM person $$ LANGUAGE sql"),
            "CREATE FUNCTION f() RETURNS trigger AS $$ SELECT 1 FROM person $$ LANGUAGE sql"
        );
    }

    #[test]
    fn test_longest_name_wins() {
        let names = TableNames::new(["gender", "gender_stats"], []);
        let ns = TablePrefixer::new(
            RecordingConnection::new(),
            TenantPrefix::from_tenant_name("a").unwrap(),
            Arc::new(names),
        )
        .unwrap();
        assert_eq!(
            ns.rewrite("SELECT gender FROM gender_stats"),
            "SELECT a_gender FROM a_gender_stats"
        );
    }

    #[test]
    fn test_injected_names() {
        let names = TableNames::default()
            .with_prefixed("vector_index")
            .with_shared("tag");
        assert!(names.is_prefixed("vector_index"));
        assert!(names.is_shared("tag"));
        assert!(!names.is_prefixed("tag"));

        let ns = TablePrefixer::new(
            RecordingConnection::new(),
            TenantPrefix::from_tenant_name("Smith Family").unwrap(),
            Arc::new(names),
        )
        .unwrap();
        assert_eq!(
            ns.rewrite("SELECT * FROM tag, vector_index"),
            "SELECT * FROM tag, smith_family_vector_index"
        );
    }

    #[test]
    fn test_empty_name_set_is_identity() {
        let ns = TablePrefixer::new(
            RecordingConnection::new(),
            TenantPrefix::from_tenant_name("x").unwrap(),
            Arc::new(TableNames::new([], [])),
        )
        .unwrap();
        assert_eq!(ns.rewrite("SELECT * FROM person"), "SELECT * FROM person");
    }

    #[test]
    fn test_pattern_is_built_or_absent() {
        let pattern = TableNames::default().pattern().unwrap().unwrap();
        assert!(pattern.is_match("FROM Gender_Stats"));
        assert!(!pattern.is_match("FROM surname"));
        assert!(TableNames::new([], ["surname"]).pattern().unwrap().is_none());
    }

    #[test]
    fn test_physical() {
        let names = TableNames::default();
        let p = TenantPrefix::from_tenant_name("Smith Family").unwrap();
        assert_eq!(names.physical("person", &p), "smith_family_person");
        assert_eq!(names.physical("surname", &p), "surname");
        assert_eq!(names.physical("unknown", &p), "unknown");
    }

    #[tokio::test]
    async fn test_delegation() {
        let mut ns = smith();
        ns.inner_mut()
            .existing
            .insert("smith_family_metadata".to_string());

        ns.execute("DELETE FROM event WHERE handle = %s", &[&"E1"])
            .await
            .unwrap();
        ns.commit().await.unwrap();
        assert!(ns.table_exists("metadata").await.unwrap());
        assert!(!ns.table_exists("person").await.unwrap());
        // quoted and mixed-case spellings resolve to the same physical table
        assert!(ns.table_exists("\"metadata\"").await.unwrap());
        assert!(ns.table_exists("MetaData").await.unwrap());
        assert!(!ns.table_exists("\"MetaData\"").await.unwrap());
        assert_eq!(ns.table_prefix().map(|p| p.as_str()), Some("smith_family_"));

        let inner = ns.into_inner();
        assert_eq!(
            inner.statements,
            vec![
                "DELETE FROM smith_family_event WHERE handle = %s".to_string(),
                "COMMIT".to_string(),
            ]
        );
    }
}
