use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::config::StoreConfig;
use crate::engine::alter::AlterSoupOperation;
use crate::engine::cache::MetadataCache;
use crate::engine::document::{as_object_mut, json_to_sql, now_millis, parse_document, project, to_column_value};
use crate::engine::query_spec::QuerySpec;
use crate::engine::schema::{self, CREATED_COL, ID_COL, LAST_MODIFIED_COL, SOUP_COL};
use crate::engine::smart_sql::{convert_smart_sql, EXTERNAL_ID_COL, EXTERNAL_TABLE_COL};
use crate::engine::spec::{has_full_text, has_json1, validate_index_specs, IndexSpec, IndexType, SoupSpec};
use crate::engine::transaction::TransactionState;
use crate::events::{LogEventSink, StoreEvent, StoreEventSink};
use crate::kv::{KeyValueEncryptedFileStore, KeyValueStore};
use crate::{Error, Result, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE};

/// Ids bound per `IN (...)` statement.
const ID_CHUNK: usize = 500;

/// A JSON document store over one SQLite connection.
///
/// Every operation takes the handle's lock for its whole duration. Writes run
/// in a transaction that joins the caller's transaction when one is open (see
/// [`SmartStore::begin_transaction`]).
pub struct SmartStore {
    inner: Mutex<StoreInner>,
    events: RwLock<Arc<dyn StoreEventSink>>,
}

/// State guarded by the store lock.
pub(crate) struct StoreInner {
    pub(crate) conn: Connection,
    pub(crate) cache: MetadataCache,
    tx: TransactionState,
    external_dir: Option<PathBuf>,
    encryption_key: String,
}

/// Resolved metadata of one soup.
#[derive(Debug, Clone)]
pub(crate) struct SoupContext {
    pub soup_name: String,
    pub table: String,
    pub spec: SoupSpec,
    pub index_specs: Vec<IndexSpec>,
}

impl SmartStore {
    /// Opens the store described by `config`, resuming any interrupted
    /// alter-soup operation.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_event_sink(config, Arc::new(LogEventSink))
    }

    pub fn open_with_event_sink(config: StoreConfig, sink: Arc<dyn StoreEventSink>) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        if !config.encryption_key.is_empty() {
            conn.execute_batch(&format!("PRAGMA key = '{}';", escape_literal(&config.encryption_key)))?;
        }
        if config.wal_mode && config.path.is_some() {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
        schema::create_catalog(&conn)?;

        info!(
            "Opened smart store at {}",
            config
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );

        let store = Self {
            inner: Mutex::new(StoreInner {
                conn,
                cache: MetadataCache::new(),
                tx: TransactionState::default(),
                external_dir: config.resolved_external_storage_dir(),
                encryption_key: config.encryption_key.clone(),
            }),
            events: RwLock::new(sink),
        };
        store.resume_long_operations()?;
        Ok(store)
    }

    pub fn set_event_sink(&self, sink: Arc<dyn StoreEventSink>) {
        *self.events.write() = sink;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock()
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        let sink = self.events.read().clone();
        sink.on_event(&event);
    }

    fn resume_long_operations(&self) -> Result<()> {
        for mut operation in self.get_long_operations()? {
            info!(
                "Resuming alter of soup {} after {}",
                operation.details().soup_name,
                operation.status().as_str()
            );
            operation.run()?;
        }
        Ok(())
    }

    // ----- soups -----

    pub fn register_soup(&self, soup_name: &str, index_specs: &[IndexSpec]) -> Result<()> {
        self.register_soup_with_spec(&SoupSpec::new(soup_name), index_specs)
    }

    /// Creates the soup unless it already exists.
    pub fn register_soup_with_spec(&self, spec: &SoupSpec, index_specs: &[IndexSpec]) -> Result<()> {
        let registered = self.lock().register_soup(spec, index_specs)?;
        if registered {
            self.emit(StoreEvent::SoupRegistered {
                soup_name: spec.soup_name.clone(),
                features: spec.features.clone(),
                index_types: index_specs.iter().map(|s| s.index_type).collect(),
            });
        }
        Ok(())
    }

    pub fn has_soup(&self, soup_name: &str) -> Result<bool> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        Ok(inner.cache.table_name(&inner.conn, soup_name)?.is_some())
    }

    pub fn get_soup_spec(&self, soup_name: &str) -> Result<Option<SoupSpec>> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.cache.soup_spec(&inner.conn, soup_name)
    }

    pub fn get_soup_index_specs(&self, soup_name: &str) -> Result<Vec<IndexSpec>> {
        Ok(self.lock().soup_context(soup_name)?.index_specs)
    }

    pub fn get_soup_table_name(&self, soup_name: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.cache.table_name(&inner.conn, soup_name)
    }

    pub fn get_all_soup_names(&self) -> Result<Vec<String>> {
        schema::read_soup_names(&self.lock().conn)
    }

    /// Drops the soup, its tables and its external storage.
    ///
    /// Unlike the other soup operations, an unknown soup is not an error:
    /// the call returns `false` and leaves the store untouched.
    pub fn drop_soup(&self, soup_name: &str) -> Result<bool> {
        let dropped = self.lock().drop_soup(soup_name)?;
        if dropped {
            self.emit(StoreEvent::SoupDropped {
                soup_name: soup_name.to_string(),
            });
        }
        Ok(dropped)
    }

    pub fn drop_all_soups(&self) -> Result<()> {
        for soup_name in self.get_all_soup_names()? {
            self.drop_soup(&soup_name)?;
        }
        Ok(())
    }

    /// Deletes every element of the soup, keeping its definition.
    pub fn clear_soup(&self, soup_name: &str) -> Result<()> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.clear_soup(&ctx))
    }

    /// Recomputes the index columns of `paths` from the stored documents.
    pub fn re_index_soup(&self, soup_name: &str, paths: &[&str]) -> Result<()> {
        let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.re_index(&ctx, &paths))
    }

    /// Changes the index specs and features of a soup, migrating its data.
    pub fn alter_soup(
        &self,
        soup_name: &str,
        new_spec: &SoupSpec,
        new_index_specs: &[IndexSpec],
        re_index_data: bool,
    ) -> Result<()> {
        let mut operation = AlterSoupOperation::new(self, soup_name, new_spec, new_index_specs, re_index_data)?;
        operation.run()
    }

    /// Alter-soup operations that have not completed.
    pub fn get_long_operations(&self) -> Result<Vec<AlterSoupOperation<'_>>> {
        AlterSoupOperation::load_all(self)
    }

    // ----- elements -----

    /// Inserts `element`, returning it with its id and timestamps injected.
    pub fn create(&self, soup_name: &str, element: Value) -> Result<Value> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.create(&ctx, element))
    }

    /// Replaces the element stored under `entry_id`.
    pub fn update(&self, soup_name: &str, element: Value, entry_id: i64) -> Result<Value> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.update(&ctx, element, entry_id))
    }

    /// Updates the element whose `external_id_path` value matches the one in
    /// `element`, or creates it when there is none.
    ///
    /// With [`SOUP_ENTRY_ID`] as the path, the element is updated when it
    /// carries an id and created otherwise. Any other path must be indexed.
    pub fn upsert(&self, soup_name: &str, element: Value, external_id_path: &str) -> Result<Value> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.upsert(&ctx, element, external_id_path))
    }

    /// Elements with the given ids, in request order. Missing ids are skipped.
    pub fn retrieve(&self, soup_name: &str, ids: &[i64]) -> Result<Vec<Value>> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.retrieve(&ctx, ids)
    }

    pub fn delete(&self, soup_name: &str, ids: &[i64]) -> Result<()> {
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| inner.delete(&ctx, ids))
    }

    /// Deletes every element selected by `spec`.
    ///
    /// For smart queries the first selected column must be the entry id.
    pub fn delete_by_query(&self, soup_name: &str, spec: &QuerySpec) -> Result<()> {
        if let Some(target) = spec.soup_name() {
            if target != soup_name {
                return Err(Error::InvalidOperation(format!(
                    "query targets soup {} but deletion was requested on {}",
                    target, soup_name
                )));
            }
        }
        let mut inner = self.lock();
        let ctx = inner.soup_context(soup_name)?;
        inner.in_transaction(|inner| {
            let ids = inner.query_ids(spec)?;
            inner.delete(&ctx, &ids)
        })
    }

    // ----- queries -----

    /// One page of results.
    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<Vec<Value>> {
        let raw = self.query_raw(spec, page_index)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// One page of results as JSON array text.
    ///
    /// Stored documents are copied verbatim into the output.
    pub fn query_raw(&self, spec: &QuerySpec, page_index: usize) -> Result<String> {
        self.lock().query_raw(spec, page_index)
    }

    pub fn count_query(&self, spec: &QuerySpec) -> Result<usize> {
        self.lock().count_query(spec)
    }

    // ----- transactions -----

    pub fn begin_transaction(&self) -> Result<()> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.tx.begin(&inner.conn)
    }

    pub fn set_transaction_successful(&self) -> Result<()> {
        self.lock().tx.set_successful()
    }

    /// Ends the innermost transaction. The outermost end commits only when
    /// every level was marked successful.
    pub fn end_transaction(&self) -> Result<()> {
        self.lock().end_transaction()
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().tx.depth() > 0
    }

    // ----- maintenance -----

    /// Database size plus the on-disk size of external storage, in bytes.
    pub fn get_database_size(&self) -> Result<u64> {
        self.lock().database_size()
    }

    /// Forgets cached metadata and compiled statements.
    pub fn reset_memory_cache(&self) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.cache.reset(&inner.conn);
    }

    /// Rekeys the database and re-encrypts every external storage directory.
    pub fn change_key(&self, new_key: &str) -> Result<()> {
        self.lock().change_key(new_key)
    }
}

impl StoreInner {
    /// Runs `f` in a transaction level, joining any open transaction.
    pub(crate) fn in_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.tx.begin(&self.conn)?;
        let result = f(self);
        if result.is_ok() {
            self.tx.set_successful()?;
        }
        let ended = self.end_transaction();
        let value = result?;
        ended?;
        Ok(value)
    }

    fn end_transaction(&mut self) -> Result<()> {
        if self.tx.end(&self.conn)? {
            // Metadata cached during the transaction may describe rolled back rows.
            self.cache.reset(&self.conn);
        }
        Ok(())
    }

    pub(crate) fn soup_context(&mut self, soup_name: &str) -> Result<SoupContext> {
        let table = self
            .cache
            .table_name(&self.conn, soup_name)?
            .ok_or_else(|| Error::SoupNotFound(soup_name.to_string()))?;
        let spec = self
            .cache
            .soup_spec(&self.conn, soup_name)?
            .unwrap_or_else(|| SoupSpec::new(soup_name));
        let index_specs = self.cache.index_specs(&self.conn, soup_name)?;
        Ok(SoupContext {
            soup_name: soup_name.to_string(),
            table,
            spec,
            index_specs,
        })
    }

    pub(crate) fn validate_soup_spec(&self, spec: &SoupSpec, index_specs: &[IndexSpec]) -> Result<()> {
        if spec.soup_name.is_empty() {
            return Err(Error::InvalidOperation("soup name must not be empty".to_string()));
        }
        validate_index_specs(&spec.soup_name, index_specs)?;
        if spec.uses_external_storage() {
            if has_json1(index_specs) {
                return Err(Error::InvalidOperation(format!(
                    "json1 indexes are not supported on soup {} which stores documents externally",
                    spec.soup_name
                )));
            }
            if self.external_dir.is_none() {
                return Err(Error::InvalidOperation(format!(
                    "soup {} uses external storage but no external storage directory is configured",
                    spec.soup_name
                )));
            }
        }
        Ok(())
    }

    fn register_soup(&mut self, spec: &SoupSpec, index_specs: &[IndexSpec]) -> Result<bool> {
        self.validate_soup_spec(spec, index_specs)?;
        if self.cache.table_name(&self.conn, &spec.soup_name)?.is_some() {
            debug!("Soup {} already registered", spec.soup_name);
            return Ok(false);
        }
        self.in_transaction(|inner| {
            let table = schema::insert_soup_attrs(&inner.conn, spec)?;
            inner.create_soup_storage(spec, &table, index_specs)?;
            info!("Registered soup {} as {}", spec.soup_name, table);
            Ok(())
        })?;
        Ok(true)
    }

    /// Creates the table, indexes and index map of a soup whose attributes row
    /// already exists.
    pub(crate) fn create_soup_storage(
        &mut self,
        spec: &SoupSpec,
        table: &str,
        index_specs: &[IndexSpec],
    ) -> Result<Vec<IndexSpec>> {
        let specs = schema::assign_columns(table, index_specs);
        schema::create_soup_table(&self.conn, table, &specs, spec.uses_external_storage())?;
        schema::insert_index_map(&self.conn, &spec.soup_name, &specs)?;
        self.cache.put(spec, table, &specs);
        Ok(specs)
    }

    pub(crate) fn external_store(&self, table: &str) -> Result<KeyValueEncryptedFileStore> {
        self.external_store_with_key(table, &self.encryption_key)
    }

    fn external_store_with_key(&self, table: &str, key: &str) -> Result<KeyValueEncryptedFileStore> {
        let dir = self
            .external_dir
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("no external storage directory configured".to_string()))?;
        KeyValueEncryptedFileStore::new(dir, table, key)
    }

    /// Deletes the external storage directory of `table` if there is one.
    pub(crate) fn remove_external_store(&self, table: &str) {
        let Some(dir) = &self.external_dir else {
            return;
        };
        if !dir.join(table).exists() {
            return;
        }
        match self.external_store(table) {
            Ok(store) => {
                if !store.remove_store() {
                    warn!("Failed to remove external storage of {}", table);
                }
            }
            Err(e) => warn!("Failed to open external storage of {}: {}", table, e),
        }
    }

    fn save_external(&self, table: &str, entry_id: i64, element: &Value) -> Result<()> {
        let raw = serde_json::to_string(element)?;
        if !self.external_store(table)?.save_value(&entry_id.to_string(), &raw) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to write external document {} of {}", entry_id, table),
            )));
        }
        Ok(())
    }

    fn create(&mut self, ctx: &SoupContext, mut element: Value) -> Result<Value> {
        as_object_mut(&mut element)?;
        let entry_id = self.cache.next_id(&self.conn, &ctx.table)?;
        let now = now_millis();
        {
            let map = as_object_mut(&mut element)?;
            map.insert(SOUP_ENTRY_ID.to_string(), Value::from(entry_id));
            map.insert(SOUP_CREATED_DATE.to_string(), Value::from(now));
            map.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(now));
        }

        let external = ctx.spec.uses_external_storage();
        let projected = projected_columns(&ctx.index_specs, &element);
        let mut columns = vec![ID_COL.to_string()];
        let mut values = vec![SqlValue::Integer(entry_id)];
        if !external {
            columns.push(SOUP_COL.to_string());
            values.push(SqlValue::Text(serde_json::to_string(&element)?));
        }
        columns.push(CREATED_COL.to_string());
        values.push(SqlValue::Integer(now));
        columns.push(LAST_MODIFIED_COL.to_string());
        values.push(SqlValue::Integer(now));
        for (column, value) in &projected {
            columns.push(column.clone());
            values.push(value.clone());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            ctx.table,
            columns.join(", "),
            placeholders(columns.len())
        );
        self.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        self.write_fts(ctx, entry_id, &projected, false)?;
        if external {
            self.save_external(&ctx.table, entry_id, &element)?;
        }
        debug!("Created entry {} in soup {}", entry_id, ctx.soup_name);
        Ok(element)
    }

    fn update(&mut self, ctx: &SoupContext, mut element: Value, entry_id: i64) -> Result<Value> {
        as_object_mut(&mut element)?;
        let sql = format!("SELECT {} FROM {} WHERE {} = ?1", CREATED_COL, ctx.table, ID_COL);
        let created: i64 = self
            .conn
            .prepare_cached(&sql)?
            .query_row([entry_id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| Error::EntryNotFound {
                soup_name: ctx.soup_name.clone(),
                entry_id,
            })?;
        let now = now_millis();
        {
            let map = as_object_mut(&mut element)?;
            map.insert(SOUP_ENTRY_ID.to_string(), Value::from(entry_id));
            map.insert(SOUP_CREATED_DATE.to_string(), Value::from(created));
            map.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(now));
        }

        let external = ctx.spec.uses_external_storage();
        let projected = projected_columns(&ctx.index_specs, &element);
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        if !external {
            assignments.push(format!("{} = ?", SOUP_COL));
            values.push(SqlValue::Text(serde_json::to_string(&element)?));
        }
        assignments.push(format!("{} = ?", LAST_MODIFIED_COL));
        values.push(SqlValue::Integer(now));
        for (column, value) in &projected {
            assignments.push(format!("{} = ?", column));
            values.push(value.clone());
        }
        values.push(SqlValue::Integer(entry_id));

        let sql = format!("UPDATE {} SET {} WHERE {} = ?", ctx.table, assignments.join(", "), ID_COL);
        self.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        self.write_fts(ctx, entry_id, &projected, true)?;
        if external {
            self.save_external(&ctx.table, entry_id, &element)?;
        }
        debug!("Updated entry {} in soup {}", entry_id, ctx.soup_name);
        Ok(element)
    }

    fn upsert(&mut self, ctx: &SoupContext, mut element: Value, external_id_path: &str) -> Result<Value> {
        as_object_mut(&mut element)?;
        if external_id_path == SOUP_ENTRY_ID {
            return match element.get(SOUP_ENTRY_ID).and_then(Value::as_i64) {
                Some(entry_id) => self.update(ctx, element, entry_id),
                None => self.create(ctx, element),
            };
        }

        let index_type = ctx
            .index_specs
            .iter()
            .find(|s| s.path == external_id_path)
            .map(|s| s.index_type)
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "{} is not an indexed path of soup {}",
                    external_id_path, ctx.soup_name
                ))
            })?;
        let key = match project(&element, external_id_path) {
            Some(value) if !value.is_null() => value,
            _ => {
                return Err(Error::InvalidOperation(format!(
                    "element has no value at {} to upsert by",
                    external_id_path
                )))
            }
        };
        let bound = match index_type {
            IndexType::Json1 => json_to_sql(&key),
            other => to_column_value(Some(&key), other),
        };

        let smart_sql = format!(
            "SELECT {{{0}:{1}}} FROM {{{0}}} WHERE {{{0}:{2}}} = ?",
            ctx.soup_name, SOUP_ENTRY_ID, external_id_path
        );
        let sql = convert_smart_sql(&self.conn, &mut self.cache, &smart_sql)?;
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([bound], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        match ids.as_slice() {
            [] => self.create(ctx, element),
            [entry_id] => self.update(ctx, element, *entry_id),
            _ => Err(Error::DataIntegrity(format!(
                "{} elements of soup {} have {} = {}",
                ids.len(),
                ctx.soup_name,
                external_id_path,
                key
            ))),
        }
    }

    /// Writes the FTS row of `entry_id`, replacing any previous one.
    fn write_fts(&self, ctx: &SoupContext, entry_id: i64, projected: &[(String, SqlValue)], replace: bool) -> Result<()> {
        if !has_full_text(&ctx.index_specs) {
            return Ok(());
        }
        let fts = schema::fts_table_name(&ctx.table);
        if replace {
            self.conn
                .prepare_cached(&format!("DELETE FROM {} WHERE rowid = ?1", fts))?
                .execute([entry_id])?;
        }
        let columns = schema::full_text_columns(&ctx.index_specs);
        let mut values = vec![SqlValue::Integer(entry_id)];
        for column in &columns {
            let value = projected
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, v)| v.clone())
                .unwrap_or(SqlValue::Null);
            values.push(value);
        }
        let sql = format!(
            "INSERT INTO {} (rowid, {}) VALUES ({})",
            fts,
            columns.join(", "),
            placeholders(values.len())
        );
        self.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
        Ok(())
    }

    fn retrieve(&mut self, ctx: &SoupContext, ids: &[i64]) -> Result<Vec<Value>> {
        let external = ctx.spec.uses_external_storage();
        // Blob writes are outside the SQL transaction, so the row decides
        // whether an externally stored element exists.
        let blobs = if external {
            Some(self.external_store(&ctx.table)?)
        } else {
            None
        };
        let selected = if external { ID_COL.to_string() } else { format!("{}, {}", ID_COL, SOUP_COL) };

        let mut found: HashMap<i64, Value> = HashMap::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                selected,
                ctx.table,
                ID_COL,
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let raw = match &blobs {
                    Some(store) => match store.get_value(&id.to_string()) {
                        Some(raw) => raw,
                        None => {
                            warn!("External document {} of soup {} is missing", id, ctx.soup_name);
                            continue;
                        }
                    },
                    None => row.get(1)?,
                };
                found.insert(id, parse_document(&raw)?);
            }
        }
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    fn delete(&mut self, ctx: &SoupContext, ids: &[i64]) -> Result<()> {
        let fts = has_full_text(&ctx.index_specs).then(|| schema::fts_table_name(&ctx.table));
        for chunk in ids.chunks(ID_CHUNK) {
            let marks = placeholders(chunk.len());
            self.conn.execute(
                &format!("DELETE FROM {} WHERE {} IN ({})", ctx.table, ID_COL, marks),
                params_from_iter(chunk.iter()),
            )?;
            if let Some(fts) = &fts {
                self.conn.execute(
                    &format!("DELETE FROM {} WHERE rowid IN ({})", fts, marks),
                    params_from_iter(chunk.iter()),
                )?;
            }
        }
        if ctx.spec.uses_external_storage() {
            let store = self.external_store(&ctx.table)?;
            for id in ids {
                store.delete_value(&id.to_string());
            }
        }
        debug!("Deleted {} entries from soup {}", ids.len(), ctx.soup_name);
        Ok(())
    }

    fn query_ids(&mut self, spec: &QuerySpec) -> Result<Vec<i64>> {
        let sql = convert_smart_sql(&self.conn, &mut self.cache, spec.id_smart_sql())?;
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(query_args(spec)), |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub(crate) fn query_raw(&mut self, spec: &QuerySpec, page_index: usize) -> Result<String> {
        if spec.page_size() == 0 {
            return Err(Error::InvalidOperation("page size must be positive".to_string()));
        }
        let sql = convert_smart_sql(&self.conn, &mut self.cache, spec.smart_sql())?;
        let offset = page_index.saturating_mul(spec.page_size());
        let paged = format!("{} LIMIT {},{}", sql, offset, spec.page_size());
        self.write_rows(&paged, query_args(spec), spec.returns_documents())
    }

    pub(crate) fn count_query(&mut self, spec: &QuerySpec) -> Result<usize> {
        let sql = convert_smart_sql(&self.conn, &mut self.cache, spec.count_smart_sql())?;
        self.cache.count(&self.conn, &sql, params_from_iter(query_args(spec)))
    }

    /// Runs `sql` and writes the rows as a JSON array.
    ///
    /// Document columns holding valid JSON are copied verbatim. An external document column pair
    /// is replaced by the document loaded from the blob store. With
    /// `documents` set, single-column rows are written without a wrapping
    /// array.
    fn write_rows(&self, sql: &str, args: Vec<SqlValue>, documents: bool) -> Result<String> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut blob_stores: HashMap<String, KeyValueEncryptedFileStore> = HashMap::new();
        let mut rows = stmt.query(params_from_iter(args))?;

        let mut out = String::from("[");
        let mut first = true;
        while let Some(row) = rows.next()? {
            if !first {
                out.push(',');
            }
            first = false;

            let mut cells = Vec::with_capacity(names.len());
            let mut i = 0;
            while i < names.len() {
                if names[i] == EXTERNAL_TABLE_COL && names.get(i + 1).map(String::as_str) == Some(EXTERNAL_ID_COL) {
                    let table: String = row.get(i)?;
                    let entry_id: i64 = row.get(i + 1)?;
                    if !blob_stores.contains_key(&table) {
                        let store = self.external_store(&table)?;
                        blob_stores.insert(table.clone(), store);
                    }
                    let raw = blob_stores
                        .get(&table)
                        .and_then(|store| store.get_value(&entry_id.to_string()));
                    cells.push(raw.unwrap_or_else(|| "null".to_string()));
                    i += 2;
                    continue;
                }
                cells.push(cell_json(row.get_ref(i)?, names[i] == SOUP_COL)?);
                i += 1;
            }

            if documents && cells.len() == 1 {
                out.push_str(&cells[0]);
            } else {
                out.push('[');
                out.push_str(&cells.join(","));
                out.push(']');
            }
        }
        out.push(']');
        Ok(out)
    }

    /// Every stored document of the soup with its id.
    fn all_documents(&self, ctx: &SoupContext) -> Result<Vec<(i64, Value)>> {
        if ctx.spec.uses_external_storage() {
            let ids: Vec<i64> = {
                let mut stmt = self.conn.prepare(&format!("SELECT {} FROM {} ORDER BY {}", ID_COL, ctx.table, ID_COL))?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let store = self.external_store(&ctx.table)?;
            let mut documents = Vec::with_capacity(ids.len());
            for id in ids {
                match store.get_value(&id.to_string()) {
                    Some(raw) => documents.push((id, parse_document(&raw)?)),
                    None => warn!("External document {} of soup {} is missing", id, ctx.soup_name),
                }
            }
            return Ok(documents);
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {}, {} FROM {} ORDER BY {}",
            ID_COL, SOUP_COL, ctx.table, ID_COL
        ))?;
        let mut rows = stmt.query([])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(1)?;
            documents.push((row.get(0)?, parse_document(&raw)?));
        }
        Ok(documents)
    }

    pub(crate) fn re_index(&mut self, ctx: &SoupContext, paths: &[String]) -> Result<()> {
        let targets: Vec<&IndexSpec> = ctx
            .index_specs
            .iter()
            .filter(|s| s.column_name.is_some() && paths.contains(&s.path))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let refresh_fts = targets.iter().any(|s| s.index_type == IndexType::FullText);
        let assignments: Vec<String> = targets
            .iter()
            .filter_map(|s| s.column_name.as_deref())
            .map(|column| format!("{} = ?", column))
            .collect();
        let sql = format!("UPDATE {} SET {} WHERE {} = ?", ctx.table, assignments.join(", "), ID_COL);

        let documents = self.all_documents(ctx)?;
        for (entry_id, document) in &documents {
            let mut values: Vec<SqlValue> = targets
                .iter()
                .map(|s| to_column_value(project(document, &s.path).as_ref(), s.index_type))
                .collect();
            values.push(SqlValue::Integer(*entry_id));
            self.conn.prepare_cached(&sql)?.execute(params_from_iter(values))?;
            if refresh_fts {
                let projected = projected_columns(&ctx.index_specs, document);
                self.write_fts(ctx, *entry_id, &projected, true)?;
            }
        }
        info!(
            "Re-indexed {} of soup {} over {} entries",
            paths.join(", "),
            ctx.soup_name,
            documents.len()
        );
        Ok(())
    }

    fn clear_soup(&mut self, ctx: &SoupContext) -> Result<()> {
        self.conn.execute(&format!("DELETE FROM {}", ctx.table), [])?;
        if has_full_text(&ctx.index_specs) {
            self.conn
                .execute(&format!("DELETE FROM {}", schema::fts_table_name(&ctx.table)), [])?;
        }
        if ctx.spec.uses_external_storage() {
            self.external_store(&ctx.table)?.delete_all();
        }
        info!("Cleared soup {}", ctx.soup_name);
        Ok(())
    }

    fn drop_soup(&mut self, soup_name: &str) -> Result<bool> {
        let Some(table) = self.cache.table_name(&self.conn, soup_name)? else {
            return Ok(false);
        };
        self.in_transaction(|inner| {
            let old = schema::old_table_name(&table);
            for name in [
                table.clone(),
                schema::fts_table_name(&table),
                schema::fts_table_name(&old),
                old.clone(),
            ] {
                inner.conn.execute(&format!("DROP TABLE IF EXISTS {}", name), [])?;
            }
            schema::delete_soup_catalog(&inner.conn, soup_name)
        })?;
        self.cache.invalidate(soup_name);
        self.remove_external_store(&table);
        info!("Dropped soup {} ({})", soup_name, table);
        Ok(true)
    }

    fn database_size(&mut self) -> Result<u64> {
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let mut size = (page_count.max(0) as u64) * (page_size.max(0) as u64);
        for soup_name in schema::read_soup_names(&self.conn)? {
            let ctx = self.soup_context(&soup_name)?;
            if ctx.spec.uses_external_storage() {
                size += self.external_store(&ctx.table)?.size_on_disk();
            }
        }
        Ok(size)
    }

    fn change_key(&mut self, new_key: &str) -> Result<()> {
        if self.tx.depth() > 0 {
            return Err(Error::InvalidOperation(
                "cannot change the key inside a transaction".to_string(),
            ));
        }
        let mut external = Vec::new();
        for soup_name in schema::read_soup_names(&self.conn)? {
            let ctx = self.soup_context(&soup_name)?;
            if ctx.spec.uses_external_storage() {
                external.push(ctx);
            }
        }

        // Blob stores first: unlike the database rekey, each can be restored
        // to the old key.
        let mut rekeyed: Vec<&SoupContext> = Vec::new();
        for ctx in &external {
            if !self.external_store(&ctx.table)?.change_encryption_key(new_key) {
                self.revert_external_keys(&rekeyed, new_key);
                return Err(Error::Encryption(format!(
                    "failed to re-encrypt external storage of soup {}",
                    ctx.soup_name
                )));
            }
            rekeyed.push(ctx);
        }

        if !self.encryption_key.is_empty() || !new_key.is_empty() {
            let rekey = self
                .conn
                .execute_batch(&format!("PRAGMA rekey = '{}';", escape_literal(new_key)));
            if let Err(e) = rekey {
                self.revert_external_keys(&rekeyed, new_key);
                return Err(e.into());
            }
        }
        self.encryption_key = new_key.to_string();
        info!("Changed store encryption key");
        Ok(())
    }

    /// Puts the blob stores of `soups`, already moved to `new_key`, back under
    /// the current key.
    fn revert_external_keys(&self, soups: &[&SoupContext], new_key: &str) {
        for ctx in soups {
            let reverted = self
                .external_store_with_key(&ctx.table, new_key)
                .map(|store| store.change_encryption_key(&self.encryption_key))
                .unwrap_or(false);
            if reverted {
                warn!("Restored the previous key on external storage of soup {}", ctx.soup_name);
            } else {
                error!(
                    "External storage of soup {} is left encrypted with the new key",
                    ctx.soup_name
                );
            }
        }
    }
}

/// Index column values projected from `element`.
fn projected_columns(index_specs: &[IndexSpec], element: &Value) -> Vec<(String, SqlValue)> {
    index_specs
        .iter()
        .filter_map(|spec| {
            let column = spec.column_name.clone()?;
            let value = project(element, &spec.path);
            Some((column, to_column_value(value.as_ref(), spec.index_type)))
        })
        .collect()
}

fn query_args(spec: &QuerySpec) -> Vec<SqlValue> {
    spec.args().iter().map(json_to_sql).collect()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn escape_literal(text: &str) -> String {
    text.replace('\'', "''")
}

fn cell_json(value: ValueRef<'_>, raw_document: bool) -> Result<String> {
    Ok(match value {
        ValueRef::Null => "null".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(|n| n.to_string())
            .unwrap_or_else(|| "null".to_string()),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| Error::Internal(e.to_string()))?;
            // A column merely named `soup` may hold anything.
            if raw_document && serde_json::from_str::<&RawValue>(text).is_ok() {
                text.to_string()
            } else {
                serde_json::to_string(text)?
            }
        }
        ValueRef::Blob(bytes) => serde_json::to_string(&hex::encode(bytes))?,
    })
}
