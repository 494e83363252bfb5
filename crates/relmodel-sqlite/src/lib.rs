//! SQLite driver for relmodel.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Talks to SQLite through `libsqlite3-sys` (bundled, so no system library
//! is needed) and implements the [`Connection`](relmodel_core::Connection)
//! and [`Driver`](relmodel_core::Driver) traits from relmodel-core.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmodel_core::{Connection, Value};
//! use relmodel_sqlite::SqliteConnection;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE user (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let id = conn.insert("INSERT INTO user (name) VALUES (?1)", &[Value::from("Ann")])?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage class |
//! |-------|----------------------|
//! | `Bool` | INTEGER (0/1) |
//! | `TinyInt`, `SmallInt`, `Int`, `BigInt` | INTEGER |
//! | `Float`, `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Json` | TEXT |
//! | `Null` | NULL |
//!
//! Integers always come back as `BigInt` and reals as `Double`.
//!
//! # Thread Safety
//!
//! `SqliteConnection` is both `Send` and `Sync`; the database handle sits
//! behind a mutex.

pub mod connection;
pub mod types;

pub use connection::{SqliteConfig, SqliteConnection, SqliteDriver};

/// Version string of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    types::version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }
}
