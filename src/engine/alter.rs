//! Resumable alter-soup migrations.
//!
//! An alteration is a fixed sequence of steps. Each step runs in its own
//! transaction together with the update of the operation's row in
//! `long_operations_status`, so after a crash the row names the last step that
//! committed and the operation resumes right after it.

use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::engine::document::now_millis;
use crate::engine::schema::{self, CREATED_COL, ID_COL, LAST_MODIFIED_COL, SOUP_COL};
use crate::engine::spec::{has_full_text, IndexSpec, SoupSpec};
use crate::engine::store::{SmartStore, StoreInner};
use crate::events::StoreEvent;
use crate::kv::KeyValueStore;
use crate::{Error, Result};

/// Steps of an alter-soup operation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlterSoupStep {
    Starting,
    RenameOldSoupTable,
    DropOldIndexes,
    RegisterSoupUsingTableName,
    CopyTable,
    ReIndexSoup,
    DropOldTable,
}

impl AlterSoupStep {
    pub const LAST: AlterSoupStep = AlterSoupStep::DropOldTable;

    /// The step following `self`, or `None` after the last one.
    /// `ReIndexSoup` only runs when `re_index_data` is set.
    pub fn next(self, re_index_data: bool) -> Option<AlterSoupStep> {
        use AlterSoupStep::*;
        match self {
            Starting => Some(RenameOldSoupTable),
            RenameOldSoupTable => Some(DropOldIndexes),
            DropOldIndexes => Some(RegisterSoupUsingTableName),
            RegisterSoupUsingTableName => Some(CopyTable),
            CopyTable if re_index_data => Some(ReIndexSoup),
            CopyTable => Some(DropOldTable),
            ReIndexSoup => Some(DropOldTable),
            DropOldTable => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlterSoupStep::Starting => "STARTING",
            AlterSoupStep::RenameOldSoupTable => "RENAME_OLD_SOUP_TABLE",
            AlterSoupStep::DropOldIndexes => "DROP_OLD_INDEXES",
            AlterSoupStep::RegisterSoupUsingTableName => "REGISTER_SOUP_USING_TABLE_NAME",
            AlterSoupStep::CopyTable => "COPY_TABLE",
            AlterSoupStep::ReIndexSoup => "RE_INDEX_SOUP",
            AlterSoupStep::DropOldTable => "DROP_OLD_TABLE",
        }
    }
}

impl fmt::Display for AlterSoupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlterSoupStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        use AlterSoupStep::*;
        [
            Starting,
            RenameOldSoupTable,
            DropOldIndexes,
            RegisterSoupUsingTableName,
            CopyTable,
            ReIndexSoup,
            DropOldTable,
        ]
        .into_iter()
        .find(|step| step.as_str() == s)
        .ok_or_else(|| Error::DataIntegrity(format!("unknown alter soup status: {}", s)))
    }
}

/// Everything needed to resume an alteration, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterSoupDetails {
    pub soup_name: String,
    pub soup_table_name: String,
    pub old_soup_spec: SoupSpec,
    pub new_soup_spec: SoupSpec,
    /// Old index specs with their column names.
    pub old_index_specs: Vec<IndexSpec>,
    /// New index specs, columns assigned when the new table is created.
    pub new_index_specs: Vec<IndexSpec>,
    pub re_index_data: bool,
}

/// A persisted, resumable alteration of one soup.
pub struct AlterSoupOperation<'a> {
    store: &'a SmartStore,
    row_id: i64,
    status: AlterSoupStep,
    details: AlterSoupDetails,
}

impl<'a> AlterSoupOperation<'a> {
    /// Value of the `type` column of alter-soup rows.
    pub const TYPE: &'static str = "AlterSoup";

    /// Snapshots the current definition of `soup_name` and records the
    /// operation as `STARTING`. Nothing else is changed until it runs.
    pub fn new(
        store: &'a SmartStore,
        soup_name: &str,
        new_spec: &SoupSpec,
        new_index_specs: &[IndexSpec],
        re_index_data: bool,
    ) -> Result<Self> {
        if new_spec.soup_name != soup_name {
            return Err(Error::InvalidOperation(format!(
                "cannot rename soup {} to {} while altering it",
                soup_name, new_spec.soup_name
            )));
        }
        let mut inner = store.lock();
        inner.validate_soup_spec(new_spec, new_index_specs)?;
        let ctx = inner.soup_context(soup_name)?;
        if pending_row(&inner, soup_name)?.is_some() {
            return Err(Error::InvalidOperation(format!(
                "an alter operation is already pending for soup {}",
                soup_name
            )));
        }

        let details = AlterSoupDetails {
            soup_name: soup_name.to_string(),
            soup_table_name: ctx.table.clone(),
            old_soup_spec: ctx.spec.clone(),
            new_soup_spec: new_spec.clone(),
            old_index_specs: ctx.index_specs.clone(),
            new_index_specs: new_index_specs
                .iter()
                .map(|s| IndexSpec::new(&s.path, s.index_type))
                .collect(),
            re_index_data,
        };
        let raw = serde_json::to_string(&details)?;
        let now = now_millis();
        inner.conn.execute(
            "INSERT INTO long_operations_status (type, details, status, created, lastModified) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![Self::TYPE, raw, AlterSoupStep::Starting.as_str(), now],
        )?;
        let row_id = inner.conn.last_insert_rowid();
        info!("Recorded alter operation {} for soup {}", row_id, soup_name);

        Ok(Self {
            store,
            row_id,
            status: AlterSoupStep::Starting,
            details,
        })
    }

    /// Incomplete operations recorded in the store, oldest first.
    pub(crate) fn load_all(store: &'a SmartStore) -> Result<Vec<Self>> {
        let rows: Vec<(i64, String, String)> = {
            let inner = store.lock();
            let mut stmt = inner.conn.prepare(
                "SELECT id, details, status FROM long_operations_status WHERE type = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([Self::TYPE], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        rows.into_iter()
            .map(|(row_id, details, status)| {
                Ok(Self {
                    store,
                    row_id,
                    status: status.parse()?,
                    details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }

    pub fn id(&self) -> i64 {
        self.row_id
    }

    /// The last step that completed.
    pub fn status(&self) -> AlterSoupStep {
        self.status
    }

    pub fn details(&self) -> &AlterSoupDetails {
        &self.details
    }

    pub fn is_complete(&self) -> bool {
        self.status == AlterSoupStep::LAST
    }

    /// Runs every remaining step.
    pub fn run(&mut self) -> Result<()> {
        self.run_to(AlterSoupStep::LAST)
    }

    /// Runs the remaining steps up to and including `to_step`.
    pub fn run_to(&mut self, to_step: AlterSoupStep) -> Result<()> {
        while let Some(step) = self.status.next(self.details.re_index_data) {
            if step > to_step {
                break;
            }
            self.execute(step)?;
            self.status = step;
            if step == AlterSoupStep::LAST {
                self.store.emit(StoreEvent::SoupAltered {
                    soup_name: self.details.soup_name.clone(),
                    features: self.details.new_soup_spec.features.clone(),
                    index_types: self.details.new_index_specs.iter().map(|s| s.index_type).collect(),
                    re_index_data: self.details.re_index_data,
                });
            }
        }
        Ok(())
    }

    fn execute(&self, step: AlterSoupStep) -> Result<()> {
        info!("Alter soup {}: {}", self.details.soup_name, step);
        let mut inner = self.store.lock();
        let result = inner.in_transaction(|inner| {
            apply_step(inner, &self.details, step)?;
            record_step(inner, self.row_id, step)
        });
        // The cache may have seen tables that this step renamed or replaced.
        inner.cache.invalidate(&self.details.soup_name);
        result
    }
}

fn pending_row(inner: &StoreInner, soup_name: &str) -> Result<Option<i64>> {
    let row_id = inner
        .conn
        .query_row(
            "SELECT id FROM long_operations_status WHERE type = ?1 AND json_extract(details, '$.soupName') = ?2 LIMIT 1",
            params![AlterSoupOperation::TYPE, soup_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row_id)
}

fn record_step(inner: &StoreInner, row_id: i64, step: AlterSoupStep) -> Result<()> {
    if step == AlterSoupStep::LAST {
        inner
            .conn
            .execute("DELETE FROM long_operations_status WHERE id = ?1", [row_id])?;
    } else {
        inner.conn.execute(
            "UPDATE long_operations_status SET status = ?1, lastModified = ?2 WHERE id = ?3",
            params![step.as_str(), now_millis(), row_id],
        )?;
    }
    Ok(())
}

fn apply_step(inner: &mut StoreInner, details: &AlterSoupDetails, step: AlterSoupStep) -> Result<()> {
    let table = details.soup_table_name.as_str();
    let old_table = schema::old_table_name(table);
    match step {
        AlterSoupStep::Starting => Ok(()),
        AlterSoupStep::RenameOldSoupTable => {
            inner
                .conn
                .execute(&format!("ALTER TABLE {} RENAME TO {}", table, old_table), [])?;
            if has_full_text(&details.old_index_specs) {
                inner.conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        schema::fts_table_name(table),
                        schema::fts_table_name(&old_table)
                    ),
                    [],
                )?;
            }
            Ok(())
        }
        AlterSoupStep::DropOldIndexes => schema::drop_table_indexes(&inner.conn, &old_table),
        AlterSoupStep::RegisterSoupUsingTableName => {
            schema::update_soup_features(&inner.conn, &details.new_soup_spec)?;
            schema::delete_index_map(&inner.conn, &details.soup_name)?;
            inner.create_soup_storage(&details.new_soup_spec, table, &details.new_index_specs)?;
            Ok(())
        }
        AlterSoupStep::CopyTable => copy_table(inner, details, &old_table),
        AlterSoupStep::ReIndexSoup => {
            let old_keys: Vec<String> = details.old_index_specs.iter().map(IndexSpec::path_type).collect();
            let paths: Vec<String> = details
                .new_index_specs
                .iter()
                .filter(|s| s.index_type.has_column() && !old_keys.contains(&s.path_type()))
                .map(|s| s.path.clone())
                .collect();
            let ctx = inner.soup_context(&details.soup_name)?;
            inner.re_index(&ctx, &paths)
        }
        AlterSoupStep::DropOldTable => {
            inner
                .conn
                .execute(&format!("DROP TABLE IF EXISTS {}", schema::fts_table_name(&old_table)), [])?;
            inner.conn.execute(&format!("DROP TABLE IF EXISTS {}", old_table), [])?;
            if details.old_soup_spec.uses_external_storage() && !details.new_soup_spec.uses_external_storage() {
                inner.remove_external_store(table);
            }
            Ok(())
        }
    }
}

/// Copies the rows of the old table into the new one.
///
/// The new table is emptied first, so running this again after a crash
/// produces the same contents.
fn copy_table(inner: &mut StoreInner, details: &AlterSoupDetails, old_table: &str) -> Result<()> {
    let table = details.soup_table_name.as_str();
    let new_specs = schema::assign_columns(table, &details.new_index_specs);
    let old_external = details.old_soup_spec.uses_external_storage();
    let new_external = details.new_soup_spec.uses_external_storage();

    inner.conn.execute(&format!("DELETE FROM {}", table), [])?;
    if has_full_text(&new_specs) {
        inner
            .conn
            .execute(&format!("DELETE FROM {}", schema::fts_table_name(table)), [])?;
    }

    let mut target = vec![ID_COL.to_string(), CREATED_COL.to_string(), LAST_MODIFIED_COL.to_string()];
    let mut source = target.clone();
    if !old_external && !new_external {
        target.push(SOUP_COL.to_string());
        source.push(SOUP_COL.to_string());
    }
    for spec in &new_specs {
        let Some(column) = &spec.column_name else {
            continue;
        };
        let compatible = details.old_index_specs.iter().find(|old| {
            old.path == spec.path
                && old.column_name.is_some()
                && old.index_type.column_type() == spec.index_type.column_type()
        });
        if let Some(old_column) = compatible.and_then(|old| old.column_name.as_ref()) {
            target.push(column.clone());
            source.push(old_column.clone());
        }
    }
    inner.conn.execute(
        &format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            table,
            target.join(", "),
            source.join(", "),
            old_table
        ),
        [],
    )?;

    if let Some(seq) = schema::read_sequence(&inner.conn, old_table)? {
        schema::write_sequence(&inner.conn, table, seq)?;
    }

    if !old_external && new_external {
        move_documents_to_blobs(inner, table, old_table)?;
    } else if old_external && !new_external {
        move_documents_into_rows(inner, table)?;
    }

    if has_full_text(&new_specs) {
        let columns = schema::full_text_columns(&new_specs).join(", ");
        inner.conn.execute(
            &format!(
                "INSERT INTO {} (rowid, {}) SELECT {}, {} FROM {}",
                schema::fts_table_name(table),
                columns,
                ID_COL,
                columns,
                table
            ),
            [],
        )?;
    }
    Ok(())
}

fn move_documents_to_blobs(inner: &StoreInner, table: &str, old_table: &str) -> Result<()> {
    let store = inner.external_store(table)?;
    let mut stmt = inner
        .conn
        .prepare(&format!("SELECT {}, {} FROM {}", ID_COL, SOUP_COL, old_table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let entry_id: i64 = row.get(0)?;
        let raw: String = row.get(1)?;
        if !store.save_value(&entry_id.to_string(), &raw) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to move document {} of {} to external storage", entry_id, table),
            )));
        }
    }
    Ok(())
}

fn move_documents_into_rows(inner: &StoreInner, table: &str) -> Result<()> {
    let store = inner.external_store(table)?;
    let ids: Vec<i64> = {
        let mut stmt = inner.conn.prepare(&format!("SELECT {} FROM {}", ID_COL, table))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    let sql = format!("UPDATE {} SET {} = ?1 WHERE {} = ?2", table, SOUP_COL, ID_COL);
    for entry_id in ids {
        match store.get_value(&entry_id.to_string()) {
            Some(raw) => {
                inner.conn.execute(&sql, params![raw, entry_id])?;
            }
            None => warn!("External document {} of {} is missing", entry_id, table),
        }
    }
    Ok(())
}
