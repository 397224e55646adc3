//! Compiles catalog entries into DDL.
//!
//! Table names are emitted in their logical form; when the statements run
//! through a namespaced connection they are prefixed on the way out. Names
//! of indexes, triggers and functions are single identifiers the namespacer
//! does not touch, so they carry the prefix here.
use std::collections::BTreeSet;

use super::catalog::{
    ColumnType, JsonPath, Layout, StructuredColumn, TableSpec, CANONICAL_COLUMN, CHANGE_COLUMN,
    LEGACY_COLUMN,
};
use crate::error::Result;
use crate::tenant::TenantPrefix;

/// What a DDL run is compiled against.
#[derive(Debug, Clone, Default)]
pub struct DdlContext {
    pub prefix: Option<TenantPrefix>,
    pub use_jsonb: bool,
    /// Extensions known to be enabled.
    pub extensions: BTreeSet<String>,
}

impl DdlContext {
    pub fn new(prefix: Option<TenantPrefix>, use_jsonb: bool) -> Self {
        Self {
            prefix,
            use_jsonb,
            extensions: BTreeSet::new(),
        }
    }

    /// `<prefix><table>_<suffix>`, unprefixed for shared tables.
    pub fn object_name(&self, spec: &TableSpec, suffix: &str) -> String {
        let base = format!("{}_{}", spec.name, suffix);
        match &self.prefix {
            Some(p) if !spec.shared => p.apply(&base),
            _ => base,
        }
    }

    fn derives(&self, spec: &TableSpec) -> bool {
        self.use_jsonb && !spec.structured().is_empty()
    }
}

/// Every statement needed to bring one table to its declared shape.
/// Re-running the list against an existing table is harmless.
pub fn table_statements(spec: &TableSpec, ctx: &DdlContext) -> Result<Vec<String>> {
    let mut out = vec![create_table(spec, ctx)];
    out.extend(add_missing_columns(spec, ctx));
    if let Some(function) = sync_function(spec, ctx)? {
        out.push(function);
        out.extend(sync_trigger(spec, ctx));
    }
    out.extend(indexes(spec, ctx));
    Ok(out)
}

fn create_table(spec: &TableSpec, ctx: &DdlContext) -> String {
    let mut columns: Vec<String> = Vec::new();
    let primary_key = match spec.layout {
        Layout::Dual { key, structured } => {
            columns.push(format!("{} TEXT NOT NULL", key));
            if ctx.use_jsonb {
                columns.push(format!("{} JSONB", CANONICAL_COLUMN));
            }
            columns.push(format!("{} BYTEA", LEGACY_COLUMN));
            columns.push(format!("{} TIMESTAMPTZ NOT NULL DEFAULT now()", CHANGE_COLUMN));
            if ctx.use_jsonb {
                columns.extend(structured.iter().map(|c| format!("{} {}", c.name, c.ty.sql())));
            }
            key.to_string()
        }
        Layout::Plain {
            columns: plain,
            primary_key,
        } => {
            columns.extend(plain.iter().map(|(name, ty)| format!("{} {}", name, ty)));
            primary_key.join(", ")
        }
    };
    columns.push(format!("PRIMARY KEY ({})", primary_key));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        spec.name,
        columns.join(",\n    ")
    )
}

/// Columns a table created by an older layout may lack.
fn add_missing_columns(spec: &TableSpec, ctx: &DdlContext) -> Vec<String> {
    if !ctx.use_jsonb || !spec.is_dual() {
        return Vec::new();
    }
    std::iter::once((CANONICAL_COLUMN, "JSONB"))
        .chain(spec.structured().iter().map(|c| (c.name, c.ty.sql())))
        .map(|(name, ty)| {
            format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                spec.name, name, ty
            )
        })
        .collect()
}

/// Expression computing `column` from the JSON value `source`. Typed
/// columns are NULL unless the JSON value has the matching type and fits
/// the column; the range check is nested so it only sees integer text.
pub fn derive_expr(column: &StructuredColumn, source: &str) -> Result<String> {
    let path = JsonPath::parse(column.path)?.pg_literal();
    let value = format!("{} #> {}", source, path);
    let text = format!("({} #>> {})", source, path);
    Ok(match column.ty {
        ColumnType::Text => text,
        ColumnType::BigInt => format!(
            "CASE WHEN jsonb_typeof({}) = 'number' AND {} ~ '^-?[0-9]+$' THEN \
             CASE WHEN {}::numeric BETWEEN {} AND {} THEN {}::bigint END END",
            value,
            text,
            text,
            i64::MIN,
            i64::MAX,
            text
        ),
        ColumnType::Boolean => format!(
            "CASE WHEN jsonb_typeof({}) = 'boolean' THEN {}::boolean END",
            value, text
        ),
    })
}

/// The row-level trigger function recomputing every structured column.
pub fn sync_function(spec: &TableSpec, ctx: &DdlContext) -> Result<Option<String>> {
    if !ctx.derives(spec) {
        return Ok(None);
    }
    let source = format!("NEW.{}", CANONICAL_COLUMN);
    let mut body = String::new();
    for column in spec.structured() {
        body.push_str(&format!(
            "    NEW.{} := {};\n",
            column.name,
            derive_expr(column, &source)?
        ));
    }
    Ok(Some(format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $sync$\nBEGIN\n{}    RETURN NEW;\nEND;\n$sync$ LANGUAGE plpgsql",
        ctx.object_name(spec, "sync"),
        body
    )))
}

fn sync_trigger(spec: &TableSpec, ctx: &DdlContext) -> Vec<String> {
    let name = ctx.object_name(spec, "sync");
    vec![
        format!("DROP TRIGGER IF EXISTS {} ON {}", name, spec.name),
        format!(
            "CREATE TRIGGER {name} BEFORE INSERT OR UPDATE OF {col} ON {table} \
             FOR EACH ROW EXECUTE FUNCTION {name}()",
            name = name,
            col = CANONICAL_COLUMN,
            table = spec.name
        ),
    ]
}

fn create_index(name: &str, table: &str, method: &str, elements: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} USING {} ({})",
        name, table, method, elements
    )
}

fn indexes(spec: &TableSpec, ctx: &DdlContext) -> Vec<String> {
    let mut out = Vec::new();
    if ctx.derives(spec) {
        for column in spec.structured() {
            out.push(create_index(
                &ctx.object_name(spec, &format!("{}_idx", column.name)),
                spec.name,
                "btree",
                column.name,
            ));
        }
        out.push(create_index(
            &ctx.object_name(spec, "json_gin"),
            spec.name,
            "gin",
            &format!("{} jsonb_path_ops", CANONICAL_COLUMN),
        ));
    }
    for index in spec.indexes {
        if index.needs_jsonb && !ctx.derives(spec) {
            continue;
        }
        if let Some(ext) = index.requires {
            if !ctx.extensions.contains(ext) {
                tracing::debug!(table = spec.name, index = index.suffix, ext, "skipping index");
                continue;
            }
        }
        out.push(create_index(
            &ctx.object_name(spec, index.suffix),
            spec.name,
            index.method.sql(),
            index.elements,
        ));
    }
    out
}

/// Rewrites the canonical column onto itself so the trigger recomputes
/// every structured column of existing rows.
pub fn backfill(spec: &TableSpec, ctx: &DdlContext) -> Option<String> {
    ctx.derives(spec).then(|| {
        format!(
            "UPDATE {table} SET {col} = {col} WHERE {col} IS NOT NULL",
            table = spec.name,
            col = CANONICAL_COLUMN
        )
    })
}

/// Every object name `table_statements` could emit for `spec`, whatever
/// extensions are enabled.
pub fn object_names(spec: &TableSpec, ctx: &DdlContext) -> Vec<String> {
    let mut names = vec![ctx.object_name(spec, "sync"), ctx.object_name(spec, "json_gin")];
    names.extend(
        spec.structured()
            .iter()
            .map(|c| ctx.object_name(spec, &format!("{}_idx", c.name))),
    );
    names.extend(spec.indexes.iter().map(|i| ctx.object_name(spec, i.suffix)));
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::catalog::{table, CATALOG};
    use crate::tenant::MAX_PREFIX_LEN;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn jsonb() -> DdlContext {
        DdlContext::new(None, true)
    }

    fn assert_parses(sql: &str) {
        if let Err(e) = Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            panic!("{}\nfailed to parse: {}", sql, e);
        }
    }

    #[test]
    fn test_person_table() {
        let spec = table("person").unwrap();
        let stmts = table_statements(spec, &jsonb()).unwrap();
        let create = &stmts[0];
        assert!(create.starts_with("CREATE TABLE IF NOT EXISTS person ("));
        assert!(create.contains("json_data JSONB"));
        assert!(create.contains("blob_data BYTEA"));
        assert!(create.contains("change_time TIMESTAMPTZ NOT NULL DEFAULT now()"));
        assert!(create.contains("gramps_id TEXT"));
        assert!(create.contains("PRIMARY KEY (handle)"));
        assert_parses(create);

        assert!(stmts
            .iter()
            .any(|s| s == "ALTER TABLE person ADD COLUMN IF NOT EXISTS gender BIGINT"));
        assert!(stmts.iter().any(|s| s
            == "CREATE INDEX IF NOT EXISTS person_json_gin ON person USING gin (json_data jsonb_path_ops)"));
        assert!(stmts.iter().any(|s| s
            == "CREATE INDEX IF NOT EXISTS person_gramps_id_idx ON person USING btree (gramps_id)"));
        assert!(stmts.iter().any(|s| s.starts_with(
            "CREATE TRIGGER person_sync BEFORE INSERT OR UPDATE OF json_data ON person"
        )));
    }

    #[test]
    fn test_create_and_alter_statements_parse() {
        for spec in CATALOG {
            for sql in table_statements(spec, &jsonb()).unwrap() {
                if sql.starts_with("CREATE TABLE") || sql.starts_with("ALTER TABLE") {
                    assert_parses(&sql);
                }
            }
            if let Some(sql) = backfill(spec, &jsonb()) {
                assert_parses(&sql);
            }
        }
    }

    #[test]
    fn test_derive_expr() {
        let person = table("person").unwrap();
        let by_name = |n: &str| {
            *person
                .structured()
                .iter()
                .find(|c| c.name == n)
                .unwrap()
        };
        assert_eq!(
            derive_expr(&by_name("primary_surname"), "NEW.json_data").unwrap(),
            "(NEW.json_data #>> '{primary_name,surname_list,0,surname}')"
        );
        let gender = derive_expr(&by_name("gender"), "NEW.json_data").unwrap();
        assert!(gender.starts_with("CASE WHEN jsonb_typeof(NEW.json_data #> '{gender}') = 'number'"));
        assert!(gender.contains(
            "::numeric BETWEEN -9223372036854775808 AND 9223372036854775807 THEN"
        ));
        assert!(gender.ends_with("::bigint END END"));
        let private = derive_expr(&by_name("is_private"), "NEW.json_data").unwrap();
        assert!(private.contains("= 'boolean'"));
        assert!(private.ends_with("::boolean END"));
    }

    #[test]
    fn test_sync_function_assigns_every_column() {
        let spec = table("event").unwrap();
        let function = sync_function(spec, &jsonb()).unwrap().unwrap();
        assert!(function.starts_with("CREATE OR REPLACE FUNCTION event_sync() RETURNS trigger"));
        for column in spec.structured() {
            assert!(function.contains(&format!("NEW.{} := ", column.name)));
        }
        assert!(function.contains("RETURN NEW;"));
        assert!(function.ends_with("$sync$ LANGUAGE plpgsql"));
    }

    #[test]
    fn test_prefixed_object_names() {
        let ctx = DdlContext::new(TenantPrefix::from_tenant_name("Smith Family").ok(), true);
        let person = table("person").unwrap();
        let stmts = table_statements(person, &ctx).unwrap();
        // table names stay logical; the namespacer prefixes them
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS person ("));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE OR REPLACE FUNCTION smith_family_person_sync()")));
        assert!(stmts
            .iter()
            .any(|s| s.contains("INDEX IF NOT EXISTS smith_family_person_gramps_id_idx ON person")));

        let surname = table("surname").unwrap();
        assert_eq!(ctx.object_name(surname, "idx"), "surname_idx");
    }

    #[test]
    fn test_object_names_fit_identifier_limit() {
        let longest = TenantPrefix::from_tenant_name(&"z".repeat(MAX_PREFIX_LEN - 1)).unwrap();
        let ctx = DdlContext::new(Some(longest), true);
        for spec in CATALOG {
            for name in object_names(spec, &ctx) {
                assert!(name.len() <= 63, "{} is {} bytes", name, name.len());
            }
        }
    }

    #[test]
    fn test_extension_gated_indexes() {
        let person = table("person").unwrap();
        let without = table_statements(person, &jsonb()).unwrap();
        assert!(!without.iter().any(|s| s.contains("gin_trgm_ops")));

        let mut ctx = jsonb();
        ctx.extensions.insert("pg_trgm".into());
        let with = table_statements(person, &ctx).unwrap();
        assert!(with.iter().any(|s| s
            == "CREATE INDEX IF NOT EXISTS person_surname_trgm ON person USING gin (primary_surname gin_trgm_ops)"));
    }

    #[test]
    fn test_legacy_layout() {
        let ctx = DdlContext::new(None, false);
        let person = table("person").unwrap();
        let stmts = table_statements(person, &ctx).unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(!stmts[0].contains("json_data"));
        assert!(!stmts[0].contains("gramps_id"));
        assert!(stmts[0].contains("blob_data BYTEA"));
        assert!(backfill(person, &ctx).is_none());

        let reference = table("reference").unwrap();
        let stmts = table_statements(reference, &ctx).unwrap();
        assert!(stmts.iter().any(|s| s.contains("reference_ref_handle_idx")));
    }

    #[test]
    fn test_plain_table() {
        let spec = table("reference").unwrap();
        let stmts = table_statements(spec, &jsonb()).unwrap();
        assert!(stmts[0].contains("PRIMARY KEY (obj_handle, ref_handle)"));
        assert!(!stmts.iter().any(|s| s.contains("TRIGGER")));
        assert_parses(&stmts[0]);
    }

    #[test]
    fn test_settings_table_has_no_trigger() {
        let spec = table("metadata").unwrap();
        let stmts = table_statements(spec, &jsonb()).unwrap();
        assert!(stmts[0].contains("setting TEXT NOT NULL"));
        assert!(stmts[0].contains("json_data JSONB"));
        assert!(!stmts.iter().any(|s| s.contains("TRIGGER") || s.contains("FUNCTION")));
        assert!(backfill(spec, &jsonb()).is_none());
    }
}
