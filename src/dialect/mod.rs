/// SQL dialect handling.
///
/// ```text
/// legacy SQL (SQLite dialect, `?` placeholders)
///       ↓
/// Translator            (translate.rs, `%s` placeholders)
///       ↓
/// number_placeholders   (driver spelling, `$1..$n`)
///       ↓
/// PostgreSQL
/// ```
///
/// Every rewrite works on the code spans produced by `scanner.rs`, so text
/// inside literals, quoted identifiers and comments is never touched.
pub mod scanner;
pub mod translate;

use std::sync::LazyLock;

pub use translate::{number_placeholders, StatementContext, TranslationRule, Translator};

static DEFAULT: LazyLock<Translator> = LazyLock::new(Translator::sqlite_to_postgres);

/// Translate a SQLite-dialect statement with the default rule set.
pub fn translate(sql: &str) -> String {
    DEFAULT.translate(sql)
}

/// Translate and renumber placeholders: the exact text sent to the driver.
pub fn to_driver_sql(translator: &Translator, sql: &str) -> String {
    number_placeholders(&translator.translate(sql))
}
