//! Core types and traits for relmodel.
//!
//! This crate provides the foundations shared by every other relmodel crate:
//!
//! - [`Value`] and [`Row`] for data moving to and from the database
//! - [`Connection`] and [`Driver`] for talking to a database
//! - [`Error`] covering mapping, loading, query and configuration failures

pub mod connection;
pub mod dialect;
pub mod error;
pub mod row;
pub mod value;

pub use connection::{ColumnMap, Connection, DataSourceConfig, Driver};
pub use dialect::Dialect;
pub use error::{
    AnnotationError, ConfigError, ConnectionError, ConnectionErrorKind, EntityError,
    EntityIdError, EntityIdErrorKind, EntityLoaderError, Error, QueryError, QueryErrorKind,
    Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
