//! Quote-aware statement scanner.
//!
//! Splits raw SQL text into spans so that textual rewrites only ever touch
//! code, never the inside of string literals, quoted identifiers,
//! dollar-quoted bodies or comments. All span boundaries fall on ASCII
//! delimiters, so every span is a valid `&str` slice of the input.

/// What a span of statement text contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Ordinary SQL text; the only kind rewrites are applied to.
    Code,
    /// `'...'` or `E'...'`
    StringLiteral,
    /// `"..."`
    QuotedIdentifier,
    /// `$$...$$` or `$tag$...$tag$`
    DollarQuoted,
    /// `-- ...` or `/* ... */`
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<'a> {
    pub kind: SpanKind,
    pub text: &'a str,
}

impl Span<'_> {
    pub fn is_code(&self) -> bool {
        self.kind == SpanKind::Code
    }
}

/// Split `sql` into code and non-code spans. Concatenating the span texts
/// yields the input unchanged. Unterminated quotes and comments run to the
/// end of the input.
pub fn split(sql: &str) -> Vec<Span<'_>> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        let quoted = match bytes[i] {
            b'\'' => {
                let escapes = is_escape_string_prefix(bytes, i);
                Some((SpanKind::StringLiteral, scan_quoted(bytes, i, b'\'', escapes)))
            }
            b'"' => Some((SpanKind::QuotedIdentifier, scan_quoted(bytes, i, b'"', false))),
            b'-' if next == Some(b'-') => Some((SpanKind::Comment, scan_line_comment(bytes, i))),
            b'/' if next == Some(b'*') => Some((SpanKind::Comment, scan_block_comment(bytes, i))),
            b'$' => dollar_tag(bytes, i)
                .map(|tag| (SpanKind::DollarQuoted, scan_dollar_quoted(sql, i, tag))),
            _ => None,
        };

        match quoted {
            Some((kind, end)) => {
                if code_start < i {
                    spans.push(Span {
                        kind: SpanKind::Code,
                        text: &sql[code_start..i],
                    });
                }
                spans.push(Span {
                    kind,
                    text: &sql[i..end],
                });
                i = end;
                code_start = end;
            }
            None => i += 1,
        }
    }

    if code_start < bytes.len() {
        spans.push(Span {
            kind: SpanKind::Code,
            text: &sql[code_start..],
        });
    }
    spans
}

/// Rebuild `sql`, passing every code span through `f` and copying every
/// other span verbatim.
pub fn map_code<F>(sql: &str, mut f: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(sql.len() + 16);
    for span in split(sql) {
        if span.is_code() {
            out.push_str(&f(span.text));
        } else {
            out.push_str(span.text);
        }
    }
    out
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `E'...'` strings treat backslash as an escape character.
fn is_escape_string_prefix(bytes: &[u8], quote: usize) -> bool {
    if quote == 0 || !matches!(bytes[quote - 1], b'E' | b'e') {
        return false;
    }
    quote < 2 || !is_ident_byte(bytes[quote - 2])
}

/// Returns the end (exclusive) of a quoted run starting at `start`.
/// A doubled delimiter is an escaped delimiter.
fn scan_quoted(bytes: &[u8], start: usize, delim: u8, backslash_escapes: bool) -> usize {
    let mut j = start + 1;
    while j < bytes.len() {
        let b = bytes[j];
        if backslash_escapes && b == b'\\' {
            j += 2;
            continue;
        }
        if b == delim {
            if bytes.get(j + 1) == Some(&delim) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    bytes.len()
}

fn scan_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| start + p)
        .unwrap_or(bytes.len())
}

/// Block comments nest in PostgreSQL.
fn scan_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut j = start;
    while j + 1 < bytes.len() {
        match (bytes[j], bytes[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return j;
                }
            }
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Recognise an opening dollar-quote tag at `i`: `$$` or `$ident$` where the
/// identifier does not start with a digit (so `$1` stays a parameter).
fn dollar_tag(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && is_ident_byte(bytes[i - 1]) {
        return None;
    }
    let first = *bytes.get(i + 1)?;
    if first == b'$' {
        return Some(2);
    }
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut j = i + 2;
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        j += 1;
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1 - i)
}

fn scan_dollar_quoted(sql: &str, start: usize, tag_len: usize) -> usize {
    let tag = &sql[start..start + tag_len];
    let body = start + tag_len;
    sql[body..]
        .find(tag)
        .map(|p| body + p + tag_len)
        .unwrap_or(sql.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(SpanKind, &str)> {
        split(sql).into_iter().map(|s| (s.kind, s.text)).collect()
    }

    #[test]
    fn test_plain_code_is_one_span() {
        assert_eq!(
            kinds("SELECT * FROM person"),
            vec![(SpanKind::Code, "SELECT * FROM person")]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(split("").is_empty());
    }

    #[test]
    fn test_string_literal_with_doubled_quote() {
        assert_eq!(
            kinds("SELECT 'it''s ?' , ?"),
            vec![
                (SpanKind::Code, "SELECT "),
                (SpanKind::StringLiteral, "'it''s ?'"),
                (SpanKind::Code, " , ?"),
            ]
        );
    }

    #[test]
    fn test_escape_string_backslash() {
        let spans = kinds(r"SELECT E'a\'b' FROM t");
        assert_eq!(spans[1], (SpanKind::StringLiteral, r"'a\'b'"));
        assert_eq!(spans[2], (SpanKind::Code, " FROM t"));
    }

    #[test]
    fn test_identifier_ending_in_e_is_not_escape_prefix() {
        // `name'...'` is not an E-string: backslash has no special meaning.
        let spans = kinds(r"SELECT name'a\' , 1");
        assert_eq!(spans[1], (SpanKind::StringLiteral, r"'a\'"));
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            kinds(r#"SELECT "person" FROM x"#),
            vec![
                (SpanKind::Code, "SELECT "),
                (SpanKind::QuotedIdentifier, r#""person""#),
                (SpanKind::Code, " FROM x"),
            ]
        );
    }

    #[test]
    fn test_comments() {
        let spans = kinds("SELECT 1 -- person ?\nFROM t /* a /* nested */ b */ WHERE");
        assert_eq!(spans[1], (SpanKind::Comment, "-- person ?"));
        assert_eq!(spans[2], (SpanKind::Code, "\nFROM t "));
        assert_eq!(spans[3], (SpanKind::Comment, "/* a /* nested */ b */"));
        assert_eq!(spans[4], (SpanKind::Code, " WHERE"));
    }

    #[test]
    fn test_dollar_quoted_bodies() {
        let spans = kinds("AS $$ BEGIN NEW.x := '?'; END $$ LANGUAGE plpgsql");
        assert_eq!(spans[1].0, SpanKind::DollarQuoted);
        assert_eq!(spans[1].1, "$$ BEGIN NEW.x := '?'; END $$");
        assert_eq!(spans[2], (SpanKind::Code, " LANGUAGE plpgsql"));

        let tagged = kinds("AS $body$ x $$ y $body$;");
        assert_eq!(tagged[1], (SpanKind::DollarQuoted, "$body$ x $$ y $body$"));
    }

    #[test]
    fn test_numbered_parameter_is_code() {
        assert_eq!(
            kinds("WHERE a = $1 AND b = $2"),
            vec![(SpanKind::Code, "WHERE a = $1 AND b = $2")]
        );
    }

    #[test]
    fn test_unterminated_literal_runs_to_end() {
        assert_eq!(
            kinds("SELECT 'open ?"),
            vec![
                (SpanKind::Code, "SELECT "),
                (SpanKind::StringLiteral, "'open ?"),
            ]
        );
    }

    #[test]
    fn test_spans_concatenate_to_input() {
        let sql = "SELECT 'é?' , \"ü\" -- c\n, $t$ ? $t$ /* ? */ ?";
        let joined: String = split(sql).iter().map(|s| s.text).collect();
        assert_eq!(joined, sql);
    }

    #[test]
    fn test_map_code_leaves_literals_alone() {
        let out = map_code("SELECT '?' WHERE a = ?", |code| code.replace('?', "%s"));
        assert_eq!(out, "SELECT '?' WHERE a = %s");
    }
}
