//! Per-handle cache of soup metadata and compiled statements.

use std::collections::{HashMap, HashSet};

use log::debug;
use rusqlite::{Connection, OptionalExtension, Params};

use crate::engine::schema;
use crate::engine::spec::{IndexSpec, SoupSpec};
use crate::Result;

/// Read-through cache of the soup catalog.
///
/// Populated from the catalog tables on first access and invalidated whenever
/// a soup is dropped or altered. Compiled statements live in the
/// connection's prepared statement cache; this cache remembers which SQL texts
/// were compiled so they can be flushed together with the maps.
#[derive(Debug, Default)]
pub struct MetadataCache {
    table_names: HashMap<String, String>,
    soup_specs: HashMap<String, SoupSpec>,
    index_specs: HashMap<String, Vec<IndexSpec>>,
    next_id_sql: HashMap<String, String>,
    count_sql: HashSet<String>,
    translated_sql: HashMap<String, String>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table name of `soup_name`, or `None` if the soup does not exist.
    pub fn table_name(&mut self, conn: &Connection, soup_name: &str) -> Result<Option<String>> {
        if let Some(table) = self.table_names.get(soup_name) {
            return Ok(Some(table.clone()));
        }
        let table = schema::read_table_name(conn, soup_name)?;
        if let Some(table) = &table {
            self.table_names.insert(soup_name.to_string(), table.clone());
        }
        Ok(table)
    }

    pub fn soup_spec(&mut self, conn: &Connection, soup_name: &str) -> Result<Option<SoupSpec>> {
        if let Some(spec) = self.soup_specs.get(soup_name) {
            return Ok(Some(spec.clone()));
        }
        let spec = schema::read_soup_spec(conn, soup_name)?;
        if let Some(spec) = &spec {
            self.soup_specs.insert(soup_name.to_string(), spec.clone());
        }
        Ok(spec)
    }

    pub fn index_specs(&mut self, conn: &Connection, soup_name: &str) -> Result<Vec<IndexSpec>> {
        if let Some(specs) = self.index_specs.get(soup_name) {
            return Ok(specs.clone());
        }
        let specs = schema::read_index_specs(conn, soup_name)?;
        if !specs.is_empty() {
            self.index_specs.insert(soup_name.to_string(), specs.clone());
        }
        Ok(specs)
    }

    /// Records freshly registered metadata without a catalog round trip.
    pub fn put(&mut self, spec: &SoupSpec, table: &str, index_specs: &[IndexSpec]) {
        self.table_names.insert(spec.soup_name.clone(), table.to_string());
        self.soup_specs.insert(spec.soup_name.clone(), spec.clone());
        self.index_specs.insert(spec.soup_name.clone(), index_specs.to_vec());
    }

    /// Forgets everything known about `soup_name`.
    ///
    /// Translated smart SQL may reference any soup, so it is dropped entirely.
    pub fn invalidate(&mut self, soup_name: &str) {
        debug!("Invalidating cached metadata for soup {}", soup_name);
        if let Some(table) = self.table_names.remove(soup_name) {
            self.next_id_sql.remove(&table);
        }
        self.soup_specs.remove(soup_name);
        self.index_specs.remove(soup_name);
        self.translated_sql.clear();
    }

    /// Allocates the next `_soupEntryId` for `table`.
    ///
    /// Seeded from `sqlite_sequence`, the highest id ever assigned, so ids are
    /// never reused even after deletes.
    pub fn next_id(&mut self, conn: &Connection, table: &str) -> Result<i64> {
        let sql = self
            .next_id_sql
            .entry(table.to_string())
            .or_insert_with(|| format!("SELECT seq FROM sqlite_sequence WHERE name = '{}'", table));
        let mut stmt = conn.prepare_cached(sql)?;
        let seq: Option<i64> = stmt.query_row([], |row| row.get(0)).optional()?;
        Ok(seq.unwrap_or(0) + 1)
    }

    /// Runs a compiled count statement.
    pub fn count<P: Params>(&mut self, conn: &Connection, sql: &str, params: P) -> Result<usize> {
        if self.count_sql.insert(sql.to_string()) {
            debug!("Compiling count statement: {}", sql);
        }
        let mut stmt = conn.prepare_cached(sql)?;
        let count: i64 = stmt.query_row(params, |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn translated(&self, smart_sql: &str) -> Option<&String> {
        self.translated_sql.get(smart_sql)
    }

    pub fn put_translated(&mut self, smart_sql: &str, sql: &str) {
        self.translated_sql.insert(smart_sql.to_string(), sql.to_string());
    }

    /// Number of distinct count statements compiled so far.
    pub fn compiled_count_statements(&self) -> usize {
        self.count_sql.len()
    }

    /// Drops all cached maps and compiled statements. Persisted data is untouched.
    pub fn reset(&mut self, conn: &Connection) {
        conn.flush_prepared_statement_cache();
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec::IndexType;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_catalog(&conn).unwrap();
        let table = schema::insert_soup_attrs(&conn, &SoupSpec::new("people")).unwrap();
        let specs = schema::assign_columns(&table, &[IndexSpec::new("name", IndexType::String)]);
        schema::insert_index_map(&conn, "people", &specs).unwrap();
        schema::create_soup_table(&conn, &table, &specs, false).unwrap();
        conn
    }

    #[test]
    fn test_read_through_and_invalidate() {
        let conn = setup();
        let mut cache = MetadataCache::new();
        assert_eq!(cache.table_name(&conn, "people").unwrap().as_deref(), Some("TABLE_1"));
        assert_eq!(cache.index_specs(&conn, "people").unwrap().len(), 1);
        assert_eq!(cache.table_name(&conn, "nobody").unwrap(), None);

        // Cached values survive catalog changes until invalidated.
        schema::delete_soup_catalog(&conn, "people").unwrap();
        assert!(cache.table_name(&conn, "people").unwrap().is_some());
        cache.invalidate("people");
        assert!(cache.table_name(&conn, "people").unwrap().is_none());
    }

    #[test]
    fn test_next_id_follows_sequence() {
        let conn = setup();
        let mut cache = MetadataCache::new();
        assert_eq!(cache.next_id(&conn, "TABLE_1").unwrap(), 1);
        conn.execute("INSERT INTO TABLE_1 (id, soup, created, lastModified) VALUES (7, '{}', 0, 0)", [])
            .unwrap();
        conn.execute("DELETE FROM TABLE_1", []).unwrap();
        assert_eq!(cache.next_id(&conn, "TABLE_1").unwrap(), 8);
    }

    #[test]
    fn test_count_and_reset() {
        let conn = setup();
        let mut cache = MetadataCache::new();
        assert_eq!(cache.count(&conn, "SELECT count(*) FROM TABLE_1", []).unwrap(), 0);
        cache.count(&conn, "SELECT count(*) FROM TABLE_1", []).unwrap();
        assert_eq!(cache.compiled_count_statements(), 1);

        cache.table_name(&conn, "people").unwrap();
        cache.reset(&conn);
        assert_eq!(cache.compiled_count_statements(), 0);
        assert!(cache.table_names.is_empty());
    }
}
