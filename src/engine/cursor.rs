use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::value::RawValue;

use crate::engine::query_spec::QuerySpec;
use crate::engine::store::SmartStore;
use crate::{Error, Result};

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

/// A page-indexed view over the results of a query.
#[derive(Debug, Clone)]
pub struct StoreCursor {
    cursor_id: u64,
    spec: QuerySpec,
    total_entries: usize,
    total_pages: usize,
    current_page_index: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CursorData<'a> {
    cursor_id: u64,
    soup_name: Option<&'a str>,
    current_page_index: usize,
    page_size: usize,
    total_entries: usize,
    total_pages: usize,
    current_page_ordered_entries: &'a RawValue,
}

impl StoreCursor {
    /// Counts the results of `spec` and positions the cursor on page 0.
    pub fn new(store: &SmartStore, spec: QuerySpec) -> Result<Self> {
        if spec.page_size() == 0 {
            return Err(Error::InvalidOperation("page size must be positive".to_string()));
        }
        let total_entries = store.count_query(&spec)?;
        let total_pages = total_entries.div_ceil(spec.page_size());
        Ok(Self {
            cursor_id: NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed),
            spec,
            total_entries,
            total_pages,
            current_page_index: 0,
        })
    }

    pub fn cursor_id(&self) -> u64 {
        self.cursor_id
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn current_page_index(&self) -> usize {
        self.current_page_index
    }

    /// Moves to `page_index`, clamped to the existing pages.
    pub fn move_to_page_index(&mut self, page_index: usize) {
        self.current_page_index = page_index.min(self.total_pages.saturating_sub(1));
    }

    /// Serializes the cursor with the rows of its current page.
    ///
    /// The page is queried again on every call.
    pub fn get_data(&self, store: &SmartStore) -> Result<String> {
        let rows = store.query_raw(&self.spec, self.current_page_index)?;
        let rows = RawValue::from_string(rows)?;
        let data = CursorData {
            cursor_id: self.cursor_id,
            soup_name: self.spec.soup_name(),
            current_page_index: self.current_page_index,
            page_size: self.spec.page_size(),
            total_entries: self.total_entries,
            total_pages: self.total_pages,
            current_page_ordered_entries: &rows,
        };
        Ok(serde_json::to_string(&data)?)
    }
}
