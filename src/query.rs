//! Query specifications and canonical cache keys.
//!
//! A `QuerySpec` describes one point query against the backend; its
//! canonical `QueryKey` identifies the cached result. Two specs that
//! describe the same query always produce the same key, regardless of
//! the order filter columns were added in.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

/// Sort direction for an ordered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// Ordering clause for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortOrder,
}

/// A point query against the data backend: table, equality filter,
/// ordering, and pagination.
///
/// The filter is a `BTreeMap` so canonicalization is independent of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub table: String,
    pub filter: BTreeMap<String, Value>,
    pub order: Option<OrderBy>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl QuerySpec {
    /// Query selecting every row of `table`.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            filter: BTreeMap::new(),
            order: None,
            limit: None,
            offset: None,
        }
    }

    /// Add an equality predicate on `column`.
    pub fn filter_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(column.into(), value.into());
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortOrder) -> Self {
        self.order = Some(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Canonical cache key for this query.
    ///
    /// Filter columns are emitted in sorted order with JSON-encoded
    /// values, so `"7"` and `7` produce distinct keys.
    pub fn key(&self) -> QueryKey {
        let mut key = self.table.clone();
        let mut first = true;
        for (column, value) in &self.filter {
            key.push(if first { '?' } else { '&' });
            first = false;
            let _ = write!(key, "{column}={value}");
        }
        if let Some(order) = &self.order {
            let _ = write!(key, "|order={}.{}", order.column, order.direction.as_str());
        }
        if let Some(limit) = self.limit {
            let _ = write!(key, "|limit={limit}");
        }
        if let Some(offset) = self.offset {
            let _ = write!(key, "|offset={offset}");
        }
        QueryKey(key)
    }
}

/// Canonical identity of a cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
