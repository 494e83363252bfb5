//! Statement builders for INSERT, UPDATE, DELETE and SELECT.
//!
//! Every builder renders to `(sql, params)` for a given [`Dialect`]; values
//! are always bound through placeholders.

use relmodel_core::{ColumnMap, Dialect, Error, Result, Value};

use crate::expr::{Filter, OrderBy, bind_markers, where_clause};

/// INSERT query builder.
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    values: ColumnMap,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: ColumnMap::new(),
        }
    }

    /// Add or replace one column value.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Add every column of `values`, in order.
    pub fn values(mut self, values: ColumnMap) -> Self {
        self.values.extend(values);
        self
    }

    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        if self.values.is_empty() {
            let sql = match dialect {
                Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", self.table),
                Dialect::Postgres | Dialect::Sqlite => {
                    format!("INSERT INTO {} DEFAULT VALUES", self.table)
                }
            };
            return (sql, Vec::new());
        }

        let columns: Vec<&str> = self.values.keys().map(String::as_str).collect();
        let placeholders: Vec<String> = (1..=columns.len())
            .map(|i| dialect.placeholder(i))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, self.values.values().cloned().collect())
    }
}

/// UPDATE query builder.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    sets: ColumnMap,
    filters: Vec<Filter>,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: ColumnMap::new(),
            filters: Vec::new(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.insert(column.into(), value.into());
        self
    }

    pub fn set_all(mut self, values: ColumnMap) -> Self {
        self.sets.extend(values);
        self
    }

    /// Add a WHERE condition; conditions are ANDed.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Build the statement. An UPDATE without SET columns is rejected.
    pub fn build(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        if self.sets.is_empty() {
            return Err(Error::builder(format!(
                "UPDATE of {} has no columns to set",
                self.table
            )));
        }
        let assignments: Vec<String> = self.sets.keys().map(|c| format!("{c} = ?")).collect();
        let mut params: Vec<Value> = self.sets.values().cloned().collect();
        let sql = format!(
            "UPDATE {} SET {}{}",
            self.table,
            assignments.join(", "),
            where_clause(&self.filters, &mut params)
        );
        Ok((bind_markers(&sql, dialect), params))
    }
}

/// DELETE query builder.
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    filters: Vec<Filter>,
}

impl DeleteBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = format!(
            "DELETE FROM {}{}",
            self.table,
            where_clause(&self.filters, &mut params)
        );
        (bind_markers(&sql, dialect), params)
    }
}

/// SELECT query builder.
///
/// Only what entity loading needs: one table, optional inner joins,
/// ANDed filters, ordering and a limit/offset window.
#[derive(Debug, Clone)]
pub struct Select {
    table: String,
    columns: String,
    joins: Vec<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    /// `SELECT * FROM table`
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            joins: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Replace the projection (`"*"` by default).
    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    /// `INNER JOIN table ON on`
    pub fn inner_join(mut self, table: &str, on: &str) -> Self {
        self.joins.push(format!(" INNER JOIN {table} ON {on}"));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push_filter(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn push_order_by(&mut self, order: OrderBy) {
        self.order_by.push(order);
    }

    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = limit;
    }

    pub fn set_offset(&mut self, offset: Option<u64>) {
        self.offset = offset;
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn body(&self, params: &mut Vec<Value>) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns, self.table);
        for join in &self.joins {
            sql.push_str(join);
        }
        sql.push_str(&where_clause(&self.filters, params));
        sql
    }

    /// Build the statement. An offset without a limit is rejected.
    pub fn build(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        let mut params = Vec::new();
        let mut sql = self.body(&mut params);
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self.order_by.iter().map(OrderBy::to_sql).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(_)) => {
                return Err(Error::builder("OFFSET requires a LIMIT"));
            }
            (None, None) => {}
        }
        Ok((bind_markers(&sql, dialect), params))
    }
}
