//! Declarative queries over soups.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SOUP_ENTRY_ID, SOUP_PATH};

/// Kind of a [`QuerySpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Exact,
    Range,
    Like,
    Match,
    Smart,
}

/// Sort direction of structured queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

/// An immutable query.
///
/// The smart SQL of the query, its count variant and the variant selecting
/// entry ids are computed once when the spec is built.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    query_type: QueryType,
    soup_name: Option<String>,
    path: Option<String>,
    select_paths: Option<Vec<String>>,
    match_key: Option<Value>,
    begin_key: Option<Value>,
    end_key: Option<Value>,
    like_key: Option<Value>,
    order_path: Option<String>,
    order: Order,
    page_size: usize,
    smart_sql: String,
    count_smart_sql: String,
    id_smart_sql: String,
}

impl QuerySpec {
    /// Every element of the soup.
    pub fn all(soup_name: &str, order_path: Option<&str>, order: Order, page_size: usize) -> Self {
        Self::range(soup_name, None, None, None, order_path, order, page_size)
    }

    /// Elements whose `path` equals `match_key`.
    pub fn exact(
        soup_name: &str,
        path: &str,
        match_key: impl Into<Value>,
        order_path: Option<&str>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::structured(QueryType::Exact, soup_name, Some(path), order_path, order, page_size);
        spec.match_key = Some(match_key.into());
        spec.compute()
    }

    /// Elements whose `path` lies between `begin_key` and `end_key`, either
    /// bound being optional. With no path and no bounds, every element.
    pub fn range(
        soup_name: &str,
        path: Option<&str>,
        begin_key: Option<Value>,
        end_key: Option<Value>,
        order_path: Option<&str>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::structured(QueryType::Range, soup_name, path, order_path, order, page_size);
        if path.is_some() {
            spec.begin_key = begin_key;
            spec.end_key = end_key;
        }
        spec.compute()
    }

    /// Elements whose `path` matches the SQL `LIKE` pattern `like_key`.
    pub fn like(
        soup_name: &str,
        path: &str,
        like_key: impl Into<Value>,
        order_path: Option<&str>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::structured(QueryType::Like, soup_name, Some(path), order_path, order, page_size);
        spec.like_key = Some(like_key.into());
        spec.compute()
    }

    /// Full-text match against one full_text path, or the whole soup when
    /// `path` is `None`.
    pub fn full_text_match(
        soup_name: &str,
        path: Option<&str>,
        match_key: &str,
        order_path: Option<&str>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::structured(QueryType::Match, soup_name, path, order_path, order, page_size);
        spec.match_key = Some(Value::String(match_key.to_string()));
        spec.compute()
    }

    /// Caller-supplied smart SQL, taken verbatim.
    pub fn smart(smart_sql: &str, page_size: usize) -> Self {
        let spec = Self {
            query_type: QueryType::Smart,
            soup_name: None,
            path: None,
            select_paths: None,
            match_key: None,
            begin_key: None,
            end_key: None,
            like_key: None,
            order_path: None,
            order: Order::Ascending,
            page_size,
            smart_sql: smart_sql.to_string(),
            count_smart_sql: String::new(),
            id_smart_sql: String::new(),
        };
        spec.compute()
    }

    /// Returns a copy selecting `paths` instead of whole documents.
    ///
    /// Has no effect on smart queries.
    pub fn with_select_paths(mut self, paths: &[&str]) -> Self {
        if self.query_type == QueryType::Smart {
            return self;
        }
        self.select_paths = Some(paths.iter().map(|p| p.to_string()).collect());
        self.compute()
    }

    fn structured(
        query_type: QueryType,
        soup_name: &str,
        path: Option<&str>,
        order_path: Option<&str>,
        order: Order,
        page_size: usize,
    ) -> Self {
        Self {
            query_type,
            soup_name: Some(soup_name.to_string()),
            path: path.map(str::to_string),
            select_paths: None,
            match_key: None,
            begin_key: None,
            end_key: None,
            like_key: None,
            order_path: Some(order_path.unwrap_or(SOUP_ENTRY_ID).to_string()),
            order,
            page_size,
            smart_sql: String::new(),
            count_smart_sql: String::new(),
            id_smart_sql: String::new(),
        }
    }

    fn compute(mut self) -> Self {
        if self.query_type == QueryType::Smart {
            self.count_smart_sql = format!("SELECT count(*) FROM ({})", self.smart_sql);
            self.id_smart_sql = self.smart_sql.clone();
            return self;
        }

        let soup = self.soup_name.clone().unwrap_or_default();
        // The FTS table repeats the indexed column names, so a match query
        // qualifies every column it selects or orders by.
        let qualified = self.query_type == QueryType::Match;
        let field = |path: &str| {
            if qualified {
                format!("{{{0}}}.{{{0}:{1}}}", soup, path)
            } else {
                format!("{{{}:{}}}", soup, path)
            }
        };

        let select = match &self.select_paths {
            Some(paths) => paths.iter().map(|p| field(p)).collect::<Vec<_>>().join(", "),
            None => field(SOUP_PATH),
        };
        let from = match self.query_type {
            QueryType::Match => format!("{{{0}}}, {{{0}}}_fts", soup),
            _ => format!("{{{}}}", soup),
        };
        let where_clause = self.where_clause(&soup);
        let filter = if where_clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_clause)
        };
        let order_path = self.order_path.clone().unwrap_or_else(|| SOUP_ENTRY_ID.to_string());

        self.smart_sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} {}",
            select,
            from,
            filter,
            field(&order_path),
            self.order.as_sql()
        );
        self.count_smart_sql = format!("SELECT count(*) FROM {}{}", from, filter);
        self.id_smart_sql = format!("SELECT {} FROM {}{}", field(SOUP_ENTRY_ID), from, filter);
        self
    }

    fn where_clause(&self, soup: &str) -> String {
        let Some(path) = &self.path else {
            return match self.query_type {
                QueryType::Match => format!(
                    "{{{0}}}_fts.rowid = {{{0}:{1}}} AND {{{0}}}_fts MATCH '{2}'",
                    soup,
                    SOUP_ENTRY_ID,
                    escaped_match_key(&self.match_key)
                ),
                _ => String::new(),
            };
        };
        let field = format!("{{{}:{}}}", soup, path);
        match self.query_type {
            QueryType::Exact => format!("{} = ?", field),
            QueryType::Like => format!("{} LIKE ?", field),
            QueryType::Range => match (&self.begin_key, &self.end_key) {
                (Some(_), Some(_)) => format!("{0} >= ? AND {0} <= ?", field),
                (Some(_), None) => format!("{} >= ?", field),
                (None, Some(_)) => format!("{} <= ?", field),
                (None, None) => String::new(),
            },
            QueryType::Match => format!(
                "{{{0}}}_fts.rowid = {{{0}:{1}}} AND {{{0}}}_fts.{2} MATCH '{3}'",
                soup,
                SOUP_ENTRY_ID,
                field,
                escaped_match_key(&self.match_key)
            ),
            QueryType::Smart => String::new(),
        }
    }

    /// Values bound to the `?` placeholders, in order.
    pub fn args(&self) -> Vec<Value> {
        match self.query_type {
            QueryType::Exact => self.match_key.iter().cloned().collect(),
            QueryType::Like => self.like_key.iter().cloned().collect(),
            QueryType::Range => self.begin_key.iter().chain(self.end_key.iter()).cloned().collect(),
            QueryType::Match | QueryType::Smart => Vec::new(),
        }
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn soup_name(&self) -> Option<&str> {
        self.soup_name.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn select_paths(&self) -> Option<&[String]> {
        self.select_paths.as_deref()
    }

    pub fn match_key(&self) -> Option<&Value> {
        self.match_key.as_ref()
    }

    pub fn begin_key(&self) -> Option<&Value> {
        self.begin_key.as_ref()
    }

    pub fn end_key(&self) -> Option<&Value> {
        self.end_key.as_ref()
    }

    pub fn like_key(&self) -> Option<&Value> {
        self.like_key.as_ref()
    }

    pub fn order_path(&self) -> Option<&str> {
        self.order_path.as_deref()
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn smart_sql(&self) -> &str {
        &self.smart_sql
    }

    pub fn count_smart_sql(&self) -> &str {
        &self.count_smart_sql
    }

    pub(crate) fn id_smart_sql(&self) -> &str {
        &self.id_smart_sql
    }

    /// Whether each row is a single whole document rather than an array of
    /// selected columns.
    pub fn returns_documents(&self) -> bool {
        self.query_type != QueryType::Smart && self.select_paths.is_none()
    }
}

/// FTS MATCH arguments cannot be bound, so the key is inlined as a literal.
fn escaped_match_key(key: &Option<Value>) -> String {
    match key {
        Some(Value::String(s)) => s.replace('\'', "''"),
        Some(other) => other.to_string().replace('\'', "''"),
        None => String::new(),
    }
}
