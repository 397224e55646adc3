//! Declarative table catalog.
//!
//! Every physical table is described here once: its layout, the structured
//! columns derived from the canonical JSON column (`name → $.path`), and
//! its indexes. `ddl.rs` compiles these descriptions into statements; the
//! search layer reads the structured-column map directly.
use std::fmt;

use crate::error::{Error, Result};

/// Authoritative JSONB representation of an entity.
pub const CANONICAL_COLUMN: &str = "json_data";
/// Legacy serialized representation, kept for older readers.
pub const LEGACY_COLUMN: &str = "blob_data";
pub const CHANGE_COLUMN: &str = "change_time";
/// Reserved key/value settings table.
pub const SETTINGS_TABLE: &str = "metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Boolean,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

/// A column recomputed from the canonical column on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredColumn {
    pub name: &'static str,
    /// `$.a.b[0].c`
    pub path: &'static str,
    pub ty: ColumnType,
}

const fn text(name: &'static str, path: &'static str) -> StructuredColumn {
    StructuredColumn {
        name,
        path,
        ty: ColumnType::Text,
    }
}

const fn int(name: &'static str, path: &'static str) -> StructuredColumn {
    StructuredColumn {
        name,
        path,
        ty: ColumnType::BigInt,
    }
}

const fn flag(name: &'static str, path: &'static str) -> StructuredColumn {
    StructuredColumn {
        name,
        path,
        ty: ColumnType::Boolean,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMethod {
    Btree,
    Gin,
}

impl IndexMethod {
    pub fn sql(self) -> &'static str {
        match self {
            IndexMethod::Btree => "btree",
            IndexMethod::Gin => "gin",
        }
    }
}

/// An entity-specific index beyond the per-column and coverage indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name is `<table>_<suffix>`, tenant-prefixed when the table is.
    pub suffix: &'static str,
    pub method: IndexMethod,
    /// Contents of the parenthesised index element list.
    pub elements: &'static str,
    /// Extension that must be enabled for the index to be created.
    pub requires: Option<&'static str>,
    /// Only meaningful when structured columns exist.
    pub needs_jsonb: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Key, canonical, legacy and last-modified columns plus structured
    /// columns derived by trigger.
    Dual {
        key: &'static str,
        structured: &'static [StructuredColumn],
    },
    /// Ordinary relational table.
    Plain {
        columns: &'static [(&'static str, &'static str)],
        primary_key: &'static [&'static str],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    /// Shared by every tenant of a database; never prefixed.
    pub shared: bool,
    pub layout: Layout,
    pub indexes: &'static [IndexSpec],
}

impl TableSpec {
    pub fn structured(&self) -> &'static [StructuredColumn] {
        match self.layout {
            Layout::Dual { structured, .. } => structured,
            Layout::Plain { .. } => &[],
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self.layout, Layout::Dual { .. })
    }
}

const fn object(
    name: &'static str,
    structured: &'static [StructuredColumn],
    indexes: &'static [IndexSpec],
) -> TableSpec {
    TableSpec {
        name,
        shared: false,
        layout: Layout::Dual {
            key: "handle",
            structured,
        },
        indexes,
    }
}

const fn btree(suffix: &'static str, elements: &'static str) -> IndexSpec {
    IndexSpec {
        suffix,
        method: IndexMethod::Btree,
        elements,
        requires: None,
        needs_jsonb: true,
    }
}

const fn trigram(suffix: &'static str, elements: &'static str) -> IndexSpec {
    IndexSpec {
        suffix,
        method: IndexMethod::Gin,
        elements,
        requires: Some("pg_trgm"),
        needs_jsonb: true,
    }
}

pub static CATALOG: &[TableSpec] = &[
    object(
        "person",
        &[
            text("gramps_id", "$.gramps_id"),
            text("given_name", "$.primary_name.first_name"),
            text("primary_surname", "$.primary_name.surname_list[0].surname"),
            int("gender", "$.gender"),
            int("birth_ref_index", "$.birth_ref_index"),
            int("death_ref_index", "$.death_ref_index"),
            flag("is_private", "$.private"),
        ],
        &[
            btree("name_search_idx", "lower(primary_surname), lower(given_name)"),
            trigram("surname_trgm", "primary_surname gin_trgm_ops"),
        ],
    ),
    object(
        "family",
        &[
            text("gramps_id", "$.gramps_id"),
            text("father_handle", "$.father_handle"),
            text("mother_handle", "$.mother_handle"),
            int("rel_type", "$.type.value"),
            flag("is_private", "$.private"),
        ],
        &[btree("parents_idx", "father_handle, mother_handle")],
    ),
    object(
        "event",
        &[
            text("gramps_id", "$.gramps_id"),
            int("event_type", "$.type.value"),
            text("description", "$.description"),
            text("place_handle", "$.place"),
            int("date_sortval", "$.date.sortval"),
            flag("is_private", "$.private"),
        ],
        &[btree("type_date_idx", "event_type, date_sortval")],
    ),
    object(
        "place",
        &[
            text("gramps_id", "$.gramps_id"),
            text("title", "$.title"),
            text("place_name", "$.name.value"),
            int("place_type", "$.place_type.value"),
            text("enclosed_by", "$.placeref_list[0].ref"),
            flag("is_private", "$.private"),
        ],
        &[
            btree("hierarchy_idx", "enclosed_by, place_name"),
            trigram("name_trgm", "place_name gin_trgm_ops"),
        ],
    ),
    object(
        "source",
        &[
            text("gramps_id", "$.gramps_id"),
            text("title", "$.title"),
            text("author", "$.author"),
            text("pubinfo", "$.pubinfo"),
            text("abbrev", "$.abbrev"),
            flag("is_private", "$.private"),
        ],
        &[],
    ),
    object(
        "citation",
        &[
            text("gramps_id", "$.gramps_id"),
            text("page", "$.page"),
            int("confidence", "$.confidence"),
            text("source_handle", "$.source_handle"),
            flag("is_private", "$.private"),
        ],
        &[],
    ),
    object(
        "repository",
        &[
            text("gramps_id", "$.gramps_id"),
            text("repo_name", "$.name"),
            flag("is_private", "$.private"),
        ],
        &[],
    ),
    object(
        "media",
        &[
            text("gramps_id", "$.gramps_id"),
            text("path", "$.path"),
            text("mime", "$.mime"),
            text("media_desc", "$.desc"),
            flag("is_private", "$.private"),
        ],
        &[],
    ),
    object(
        "note",
        &[
            text("gramps_id", "$.gramps_id"),
            text("note_text", "$.text.string"),
            int("note_type", "$.type.value"),
            flag("is_private", "$.private"),
        ],
        &[trigram("text_trgm", "note_text gin_trgm_ops")],
    ),
    object(
        "tag",
        &[
            text("tag_name", "$.name"),
            text("color", "$.color"),
            int("priority", "$.priority"),
        ],
        &[],
    ),
    TableSpec {
        name: SETTINGS_TABLE,
        shared: false,
        layout: Layout::Dual {
            key: "setting",
            structured: &[],
        },
        indexes: &[],
    },
    TableSpec {
        name: "reference",
        shared: false,
        layout: Layout::Plain {
            columns: &[
                ("obj_handle", "TEXT NOT NULL"),
                ("obj_class", "TEXT NOT NULL"),
                ("ref_handle", "TEXT NOT NULL"),
                ("ref_class", "TEXT NOT NULL"),
            ],
            primary_key: &["obj_handle", "ref_handle"],
        },
        indexes: &[IndexSpec {
            suffix: "ref_handle_idx",
            method: IndexMethod::Btree,
            elements: "ref_handle",
            requires: None,
            needs_jsonb: false,
        }],
    },
    TableSpec {
        name: "gender_stats",
        shared: false,
        layout: Layout::Plain {
            columns: &[
                ("given_name", "TEXT NOT NULL"),
                ("female", "INTEGER NOT NULL DEFAULT 0"),
                ("male", "INTEGER NOT NULL DEFAULT 0"),
                ("unknown", "INTEGER NOT NULL DEFAULT 0"),
            ],
            primary_key: &["given_name"],
        },
        indexes: &[],
    },
    TableSpec {
        name: "name_group",
        shared: true,
        layout: Layout::Plain {
            columns: &[("name", "TEXT NOT NULL"), ("group_name", "TEXT NOT NULL")],
            primary_key: &["name"],
        },
        indexes: &[],
    },
    TableSpec {
        name: "surname",
        shared: true,
        layout: Layout::Plain {
            columns: &[("surname", "TEXT NOT NULL")],
            primary_key: &["surname"],
        },
        indexes: &[],
    },
];

pub fn table(name: &str) -> Option<&'static TableSpec> {
    CATALOG.iter().find(|t| t.name == name)
}

/// `(table, column)` for every structured column in the catalog.
pub fn structured_columns() -> impl Iterator<Item = (&'static str, &'static StructuredColumn)> {
    CATALOG
        .iter()
        .flat_map(|t| t.structured().iter().map(move |c| (t.name, c)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A compiled `$.a.b[0].c` extraction path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::SchemaState(format!("invalid extraction path {:?}: {}", path, reason))
        };
        let mut rest = path
            .strip_prefix('$')
            .ok_or_else(|| invalid("must start with '$'"))?;
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                if end == 0 {
                    return Err(invalid("empty key"));
                }
                segments.push(PathSegment::Key(after[..end].to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let index = after[..end]
                    .parse()
                    .map_err(|_| invalid("array index is not a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &after[end + 1..];
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }

        if segments.is_empty() {
            return Err(invalid("path selects the whole document"));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Text-array literal for the `#>` / `#>>` operators, e.g. `'{a,b,0,c}'`.
    pub fn pg_literal(&self) -> String {
        let inner = self
            .segments
            .iter()
            .map(|s| match s {
                PathSegment::Key(k) => k.clone(),
                PathSegment::Index(i) => i.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("'{{{}}}'", inner)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for s in &self.segments {
            match s {
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}
