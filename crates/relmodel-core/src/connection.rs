//! Database connection traits.
//!
//! - [`Connection`] executes statements and brackets transactions
//! - [`Driver`] opens connections from a [`DataSourceConfig`]
//!
//! Connections are synchronous: every call runs to completion on the
//! calling thread. A connection is shared behind `&self`, so drivers guard
//! their native handle internally.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Ordered column name to value map, used for raw query results and for
/// the column set of an INSERT.
pub type ColumnMap = IndexMap<String, Value>;

/// A database connection.
pub trait Connection: Send + Sync {
    /// The dialect statements for this connection must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the key generated for the new row.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Begin a transaction.
    fn begin(&self) -> Result<()>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the open transaction.
    fn rollback(&self) -> Result<()>;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        (**self).insert(sql, params)
    }

    fn begin(&self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }
}

/// Opens connections for one kind of database.
pub trait Driver: Send + Sync {
    /// Name under which the driver is registered ("sqlite", ...).
    fn name(&self) -> &str;

    /// Open a connection described by `config`.
    fn connect(&self, config: &DataSourceConfig) -> Result<Box<dyn Connection>>;
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Registered driver name
    pub driver: String,
    /// Driver-specific location (file path, `:memory:`, server URL)
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DataSourceConfig {
    pub fn new(driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Parse a configuration from JSON such as
    /// `{"driver": "sqlite", "url": ":memory:"}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let cfg = DataSourceConfig::new("sqlite", ":memory:")
            .username("sa")
            .password("pw");
        assert_eq!(cfg.driver, "sqlite");
        assert_eq!(cfg.username.as_deref(), Some("sa"));
        assert_eq!(cfg.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_config_from_json() {
        let cfg = DataSourceConfig::from_json(r#"{"driver":"sqlite","url":"app.db"}"#).unwrap();
        assert_eq!(cfg, DataSourceConfig::new("sqlite", "app.db"));
    }

    #[test]
    fn test_config_from_json_rejects_missing_url() {
        let err = DataSourceConfig::from_json(r#"{"driver":"sqlite"}"#).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
