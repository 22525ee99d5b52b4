//! Catalog tables, soup table naming and DDL.

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use crate::engine::spec::{has_full_text, IndexSpec, IndexType, SoupFeature, SoupSpec};
use crate::Result;

pub const SOUP_ATTRS_TABLE: &str = "soup_attrs";
pub const SOUP_INDEX_MAP_TABLE: &str = "soup_index_map";
pub const LONG_OPERATIONS_STATUS_TABLE: &str = "long_operations_status";

pub const ID_COL: &str = "id";
pub const SOUP_COL: &str = "soup";
pub const CREATED_COL: &str = "created";
pub const LAST_MODIFIED_COL: &str = "lastModified";

const CATALOG: &str = r#"
CREATE TABLE IF NOT EXISTS soup_attrs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    soupName TEXT NOT NULL UNIQUE,
    externalStorage INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS soup_index_map (
    soupName TEXT NOT NULL,
    path TEXT NOT NULL,
    columnName TEXT,
    columnType TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS soup_index_map_soupName_idx ON soup_index_map (soupName);

CREATE TABLE IF NOT EXISTS long_operations_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    details TEXT NOT NULL,
    status TEXT NOT NULL,
    created INTEGER NOT NULL,
    lastModified INTEGER NOT NULL
);
"#;

/// Creates the catalog tables if they are missing.
pub fn create_catalog(conn: &Connection) -> Result<()> {
    conn.execute_batch(CATALOG)?;
    Ok(())
}

pub fn table_name_for(soup_id: i64) -> String {
    format!("TABLE_{}", soup_id)
}

pub fn fts_table_name(table: &str) -> String {
    format!("{}_fts", table)
}

pub fn old_table_name(table: &str) -> String {
    format!("{}_old", table)
}

pub fn column_name(table: &str, position: usize) -> String {
    format!("{}_{}", table, position)
}

/// The expression indexing and extracting `path` from the document column.
pub fn json_extract_expr(path: &str) -> String {
    format!("json_extract({}, '$.{}')", SOUP_COL, path.replace('\'', "''"))
}

/// Assigns `TABLE_<id>_<position>` column names to value-extracted specs.
pub fn assign_columns(table: &str, specs: &[IndexSpec]) -> Vec<IndexSpec> {
    specs
        .iter()
        .enumerate()
        .map(|(pos, spec)| {
            let column = spec.index_type.has_column().then(|| column_name(table, pos));
            IndexSpec::with_column(&spec.path, spec.index_type, column)
        })
        .collect()
}

/// Creates a soup table with its indexes and, when needed, its FTS table.
///
/// `specs` must already carry their column names (see [`assign_columns`]).
pub fn create_soup_table(conn: &Connection, table: &str, specs: &[IndexSpec], external_storage: bool) -> Result<()> {
    let mut columns = vec![format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", ID_COL)];
    if !external_storage {
        columns.push(format!("{} TEXT", SOUP_COL));
    }
    columns.push(format!("{} INTEGER", CREATED_COL));
    columns.push(format!("{} INTEGER", LAST_MODIFIED_COL));
    for spec in specs {
        if let (Some(column), Some(column_type)) = (&spec.column_name, spec.index_type.column_type()) {
            columns.push(format!("{} {}", column, column_type));
        }
    }

    let mut ddl = vec![format!("CREATE TABLE {} ({})", table, columns.join(", "))];
    for (pos, spec) in specs.iter().enumerate() {
        let index_name = format!("{}_idx", column_name(table, pos));
        let target = match &spec.column_name {
            Some(column) => column.clone(),
            None => json_extract_expr(&spec.path),
        };
        ddl.push(format!("CREATE INDEX {} ON {} ( {} )", index_name, table, target));
    }
    ddl.push(format!("CREATE INDEX {0}_created_idx ON {0} ( {1} )", table, CREATED_COL));
    ddl.push(format!("CREATE INDEX {0}_lastModified_idx ON {0} ( {1} )", table, LAST_MODIFIED_COL));

    if has_full_text(specs) {
        let fts_columns: Vec<&str> = full_text_columns(specs);
        ddl.push(format!(
            "CREATE VIRTUAL TABLE {} USING fts5({})",
            fts_table_name(table),
            fts_columns.join(", ")
        ));
    }

    for statement in &ddl {
        debug!("{}", statement);
        conn.execute(statement, [])?;
    }
    Ok(())
}

pub fn full_text_columns(specs: &[IndexSpec]) -> Vec<&str> {
    specs
        .iter()
        .filter(|s| s.index_type == IndexType::FullText)
        .filter_map(|s| s.column_name.as_deref())
        .collect()
}

/// Drops every explicit index attached to `table`.
pub fn drop_table_indexes(conn: &Connection, table: &str) -> Result<()> {
    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL",
        )?;
        let rows = stmt.query_map([table], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for name in names {
        conn.execute(&format!("DROP INDEX IF EXISTS {}", name), [])?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Inserts the soup's attributes row and returns its table name.
pub fn insert_soup_attrs(conn: &Connection, spec: &SoupSpec) -> Result<String> {
    conn.execute(
        "INSERT INTO soup_attrs (soupName, externalStorage) VALUES (?1, ?2)",
        params![spec.soup_name, spec.uses_external_storage()],
    )?;
    Ok(table_name_for(conn.last_insert_rowid()))
}

pub fn update_soup_features(conn: &Connection, spec: &SoupSpec) -> Result<()> {
    conn.execute(
        "UPDATE soup_attrs SET externalStorage = ?1 WHERE soupName = ?2",
        params![spec.uses_external_storage(), spec.soup_name],
    )?;
    Ok(())
}

pub fn insert_index_map(conn: &Connection, soup_name: &str, specs: &[IndexSpec]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO soup_index_map (soupName, path, columnName, columnType) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for spec in specs {
        stmt.execute(params![soup_name, spec.path, spec.column_name, spec.index_type.as_str()])?;
    }
    Ok(())
}

pub fn delete_index_map(conn: &Connection, soup_name: &str) -> Result<()> {
    conn.execute("DELETE FROM soup_index_map WHERE soupName = ?1", [soup_name])?;
    Ok(())
}

/// Looks up the table name of a soup in the catalog.
pub fn read_table_name(conn: &Connection, soup_name: &str) -> Result<Option<String>> {
    let id: Option<i64> = conn
        .query_row("SELECT id FROM soup_attrs WHERE soupName = ?1", [soup_name], |row| row.get(0))
        .optional()?;
    Ok(id.map(table_name_for))
}

pub fn read_soup_spec(conn: &Connection, soup_name: &str) -> Result<Option<SoupSpec>> {
    let external: Option<bool> = conn
        .query_row(
            "SELECT externalStorage FROM soup_attrs WHERE soupName = ?1",
            [soup_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(external.map(|external| {
        if external {
            SoupSpec::with_features(soup_name, &[SoupFeature::ExternalStorage])
        } else {
            SoupSpec::new(soup_name)
        }
    }))
}

/// Reads the soup's index specs in registration order.
pub fn read_index_specs(conn: &Connection, soup_name: &str) -> Result<Vec<IndexSpec>> {
    let mut stmt = conn.prepare(
        "SELECT path, columnName, columnType FROM soup_index_map WHERE soupName = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map([soup_name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut specs = Vec::new();
    for row in rows {
        let (path, column, column_type) = row?;
        specs.push(IndexSpec::with_column(&path, column_type.parse()?, column));
    }
    Ok(specs)
}

pub fn read_soup_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT soupName FROM soup_attrs ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Removes every catalog row describing `soup_name`.
pub fn delete_soup_catalog(conn: &Connection, soup_name: &str) -> Result<()> {
    conn.execute("DELETE FROM soup_attrs WHERE soupName = ?1", [soup_name])?;
    delete_index_map(conn, soup_name)?;
    conn.execute(
        "DELETE FROM long_operations_status WHERE json_extract(details, '$.soupName') = ?1",
        [soup_name],
    )?;
    Ok(())
}

/// Highest id ever handed out for `table`, from `sqlite_sequence`.
pub fn read_sequence(conn: &Connection, table: &str) -> Result<Option<i64>> {
    let seq = conn
        .query_row("SELECT seq FROM sqlite_sequence WHERE name = ?1", [table], |row| row.get(0))
        .optional()?;
    Ok(seq)
}

/// Sets the `sqlite_sequence` high-water mark of `table`.
pub fn write_sequence(conn: &Connection, table: &str, seq: i64) -> Result<()> {
    conn.execute("DELETE FROM sqlite_sequence WHERE name = ?1", [table])?;
    conn.execute("INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)", params![table, seq])?;
    Ok(())
}
