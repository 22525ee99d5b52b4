//! Translation of smart SQL into physical SQL.
//!
//! Smart SQL is a SELECT-only dialect where `{soup}` denotes a soup's table and
//! `{soup:path}` a projected value. Translation runs in two passes, both of
//! which leave single-quoted string literals untouched:
//!
//! 1. a tokenizer replaces every `{...}` token from left to right;
//! 2. a normalization pass rewrites `alias.json_extract(soup` into
//!    `json_extract(alias.soup`, since SQL does not allow a table qualifier in
//!    front of a function call.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

use crate::engine::cache::MetadataCache;
use crate::engine::schema::{self, CREATED_COL, ID_COL, LAST_MODIFIED_COL, SOUP_COL};
use crate::{Error, Result, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE, SOUP_PATH};

/// Column alias carrying the table of an externally stored document.
pub const EXTERNAL_TABLE_COL: &str = "_soupExternalTable";
/// Column alias carrying the entry id of an externally stored document.
pub const EXTERNAL_ID_COL: &str = "_soupExternalId";

static SELECT_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*select\b").expect("valid regex"));
static QUALIFIED_JSON_EXTRACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\.json_extract\(soup").expect("valid regex"));

/// Translates smart SQL, serving repeated texts from the cache.
pub fn convert_smart_sql(conn: &Connection, cache: &mut MetadataCache, smart_sql: &str) -> Result<String> {
    if !SELECT_ONLY.is_match(smart_sql) {
        return Err(Error::InvalidOperation(
            "only SELECT statements are supported in smart sql".to_string(),
        ));
    }
    if let Some(sql) = cache.translated(smart_sql) {
        return Ok(sql.clone());
    }
    let substituted = SmartSqlTranslator { conn, cache }.substitute(smart_sql)?;
    let sql = normalize_qualified_functions(&substituted);
    cache.put_translated(smart_sql, &sql);
    Ok(sql)
}

struct SmartSqlTranslator<'a> {
    conn: &'a Connection,
    cache: &'a mut MetadataCache,
}

impl SmartSqlTranslator<'_> {
    fn substitute(&mut self, smart_sql: &str) -> Result<String> {
        let mut out = String::with_capacity(smart_sql.len() + 32);
        let mut in_literal = false;
        let mut chars = smart_sql.char_indices().enumerate();

        while let Some((position, (byte_idx, ch))) = chars.next() {
            if in_literal {
                out.push(ch);
                if ch == '\'' {
                    in_literal = false;
                }
                continue;
            }
            match ch {
                '\'' => {
                    in_literal = true;
                    out.push(ch);
                }
                '{' => {
                    let rest = &smart_sql[byte_idx + 1..];
                    let end = rest.find('}').ok_or_else(|| Error::SmartSql {
                        position,
                        message: "unterminated token".to_string(),
                    })?;
                    let token = &rest[..end];
                    for _ in 0..token.chars().count() + 1 {
                        chars.next();
                    }
                    let replacement = self.resolve(token, position, &mut out)?;
                    out.push_str(&replacement);
                }
                _ => out.push(ch),
            }
        }
        Ok(out)
    }

    fn resolve(&mut self, token: &str, position: usize, out: &mut String) -> Result<String> {
        let (soup_name, path) = match token.split_once(':') {
            Some((soup, path)) => (soup, Some(path)),
            None => (token, None),
        };
        let fail = |message: String| Error::SmartSql { position, message };

        if soup_name.is_empty() {
            return Err(fail(format!("missing soup name in {{{}}}", token)));
        }
        let table = self
            .cache
            .table_name(self.conn, soup_name)?
            .ok_or_else(|| fail(format!("unknown soup {}", soup_name)))?;

        let Some(path) = path else {
            return Ok(table);
        };
        if path.is_empty() {
            return Err(fail(format!("missing path in {{{}}}", token)));
        }

        let qualified = out.ends_with('.');
        let external = self
            .cache
            .soup_spec(self.conn, soup_name)?
            .map(|spec| spec.uses_external_storage())
            .unwrap_or(false);

        let reserved = match path {
            SOUP_ENTRY_ID => Some(ID_COL),
            SOUP_CREATED_DATE => Some(CREATED_COL),
            SOUP_LAST_MODIFIED_DATE => Some(LAST_MODIFIED_COL),
            _ => None,
        };
        if let Some(column) = reserved {
            return Ok(qualify(qualified, &table, column));
        }

        if path == SOUP_PATH {
            if external {
                let qualifier = if qualified { pop_qualifier(out) } else { table.clone() };
                return Ok(format!(
                    "'{}' AS {}, {}.{} AS {}",
                    table, EXTERNAL_TABLE_COL, qualifier, ID_COL, EXTERNAL_ID_COL
                ));
            }
            return Ok(qualify(qualified, &table, SOUP_COL));
        }

        let specs = self.cache.index_specs(self.conn, soup_name)?;
        if let Some(column) = specs.iter().find(|s| s.path == path).and_then(|s| s.column_name.clone()) {
            return Ok(column);
        }
        if external {
            return Err(fail(format!(
                "{} is not indexed and soup {} stores documents externally",
                path, soup_name
            )));
        }
        Ok(schema::json_extract_expr(path))
    }
}

fn qualify(already_qualified: bool, table: &str, column: &str) -> String {
    if already_qualified {
        column.to_string()
    } else {
        format!("{}.{}", table, column)
    }
}

/// Removes a trailing `alias.` from `out` and returns the alias.
fn pop_qualifier(out: &mut String) -> String {
    out.pop();
    let start = out
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(out.len());
    out.split_off(start)
}

/// Rewrites `alias.json_extract(soup` into `json_extract(alias.soup` outside
/// string literals.
fn normalize_qualified_functions(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for (i, segment) in sql.split('\'').enumerate() {
        if i > 0 {
            out.push('\'');
        }
        if i % 2 == 0 {
            out.push_str(&QUALIFIED_JSON_EXTRACT.replace_all(segment, "json_extract(${1}.soup"));
        } else {
            out.push_str(segment);
        }
    }
    out
}
