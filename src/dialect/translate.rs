//! SQLite-dialect → PostgreSQL statement translation.
//!
//! A fixed-shape rewriter, not a parser: each [`TranslationRule`] rewrites
//! the code spans of a statement (see [`super::scanner`]) and rules run in
//! registration order. A rule that does not match leaves its input as-is,
//! so translation never fails; anything it cannot fix surfaces later as an
//! engine error.
use regex::{Captures, Regex};
use std::sync::LazyLock;

use super::scanner;

/// Statement-level facts available to every rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementContext {
    /// The statement is `CREATE ...` or `ALTER ...`.
    pub is_ddl: bool,
}

impl StatementContext {
    pub fn of(sql: &str) -> Self {
        let head = scanner::split(sql)
            .into_iter()
            .find(|s| s.is_code() && !s.text.trim().is_empty())
            .map(|s| s.text.trim_start().to_ascii_uppercase())
            .unwrap_or_default();
        Self {
            is_ddl: head.starts_with("CREATE") || head.starts_with("ALTER"),
        }
    }
}

/// One ordered rewrite step applied to the code spans of a statement.
pub trait TranslationRule: Send + Sync {
    /// Unique name identifying this rule.
    fn name(&self) -> &str;

    /// Rewrite a single code span. Returns the span unchanged when the rule
    /// does not apply.
    fn rewrite(&self, code: &str, ctx: &StatementContext) -> String;
}

/// An ordered pipeline of translation rules.
#[derive(Default)]
pub struct Translator {
    rules: Vec<Box<dyn TranslationRule>>,
}

impl Translator {
    /// A translator with no rules; `translate` is the identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// The SQLite → PostgreSQL rule set, in the order the rewrites depend on.
    pub fn sqlite_to_postgres() -> Self {
        let mut t = Self::new();
        t.add_rule(Box::new(Placeholders));
        t.add_rule(Box::new(RegexpOperator));
        t.add_rule(Box::new(LimitOffset));
        t.add_rule(Box::new(BlobType));
        t
    }

    pub fn add_rule(&mut self, rule: Box<dyn TranslationRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn translate(&self, sql: &str) -> String {
        if self.rules.is_empty() {
            return sql.to_string();
        }
        let ctx = StatementContext::of(sql);
        let out = scanner::map_code(sql, |code| {
            self.rules
                .iter()
                .fold(code.to_string(), |acc, rule| rule.rewrite(&acc, &ctx))
        });
        if out != sql {
            tracing::trace!(from = sql, to = %out, "translated statement");
        }
        out
    }
}

/// `?` → `%s`
struct Placeholders;

impl TranslationRule for Placeholders {
    fn name(&self) -> &str {
        "placeholders"
    }

    fn rewrite(&self, code: &str, _ctx: &StatementContext) -> String {
        code.replace('?', "%s")
    }
}

/// `x REGEXP y` → `x ~ y`, `x NOT REGEXP y` → `x !~ y`
struct RegexpOperator;

static NOT_REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bNOT\s+REGEXP\b").expect("invalid regex"));

static REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bREGEXP\b").expect("invalid regex"));

impl TranslationRule for RegexpOperator {
    fn name(&self) -> &str {
        "regexp_operator"
    }

    fn rewrite(&self, code: &str, _ctx: &StatementContext) -> String {
        let negated = NOT_REGEXP.replace_all(code, "!~");
        REGEXP.replace_all(&negated, "~").into_owned()
    }
}

/// `LIMIT offset, count` → `LIMIT count OFFSET offset`, `LIMIT -1` → `LIMIT ALL`.
///
/// With placeholder operands the clause becomes `OFFSET offset LIMIT count`,
/// which PostgreSQL also accepts, so bound parameters keep their order.
struct LimitOffset;

static LIMIT_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bLIMIT\s+(\d+|%s)\s*,\s*(\d+|%s)").expect("invalid regex")
});
static LIMIT_UNBOUNDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+-1\b").expect("invalid regex"));

impl TranslationRule for LimitOffset {
    fn name(&self) -> &str {
        "limit_offset"
    }

    fn rewrite(&self, code: &str, _ctx: &StatementContext) -> String {
        let paired = LIMIT_PAIR.replace_all(code, |caps: &Captures| {
            let (offset, count) = (&caps[1], &caps[2]);
            if offset == "%s" || count == "%s" {
                format!("OFFSET {} LIMIT {}", offset, count)
            } else {
                format!("LIMIT {} OFFSET {}", count, offset)
            }
        });
        LIMIT_UNBOUNDED.replace_all(&paired, "LIMIT ALL").into_owned()
    }
}

/// `BLOB` column type → `BYTEA`, in DDL only.
struct BlobType;

static BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bBLOB\b").expect("invalid regex"));

impl TranslationRule for BlobType {
    fn name(&self) -> &str {
        "blob_type"
    }

    fn rewrite(&self, code: &str, ctx: &StatementContext) -> String {
        if !ctx.is_ddl {
            return code.to_string();
        }
        BLOB.replace_all(code, "BYTEA").into_owned()
    }
}

/// Renumber `%s` placeholders in code spans to the driver's `$1..$n`
/// spelling; `%%` collapses to a literal `%`.
pub fn number_placeholders(sql: &str) -> String {
    let mut n = 0usize;
    scanner::map_code(sql, |code| {
        let mut out = String::with_capacity(code.len() + 4);
        let mut chars = code.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            }
        }
        out
    })
}
