//! SQLite connection and driver.
//!
//! Safe wrappers around the SQLite C API implementing the
//! [`Connection`] and [`Driver`] traits from relmodel-core.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers

use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libsqlite3_sys as ffi;
use relmodel_core::{
    ColumnInfo, Connection, ConnectionError, ConnectionErrorKind, DataSourceConfig, Dialect,
    Driver, Error, QueryError, QueryErrorKind, Result, Row, TransactionError,
    TransactionErrorKind, Value,
};

// The bundled bindings of libsqlite3-sys omit `sqlite3_close_v2`, but the
// bundled SQLite library exports it.
unsafe extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

use crate::types;

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for in-memory database.
    pub path: String,
    /// Open without write access. The file must exist.
    pub read_only: bool,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            read_only: false,
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set busy timeout.
    #[must_use]
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    fn open_flags(&self) -> c_int {
        let mut flags = ffi::SQLITE_OPEN_URI | ffi::SQLITE_OPEN_FULLMUTEX;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        } else {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

/// Inner state of the SQLite connection, protected by a mutex for thread safety.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is opened in serialized mode and every access goes
// through the Mutex in SqliteConnection.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| connect_error("Invalid path: contains null byte".to_string()))?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe {
            ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, config.open_flags(), ptr::null())
        };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                types::error_string(rc)
            } else {
                // SAFETY: db is valid, errmsg returns a valid C string
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };
            return Err(connect_error(format!("Failed to open database: {msg}")));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        tracing::debug!(path = %config.path, read_only = config.read_only, "Opened SQLite database");

        Ok(Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute SQL directly without preparing (for DDL, etc.). May hold
    /// several `;`-separated statements.
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec(inner.db, sql)
    }

    /// Whether a transaction opened through [`Connection::begin`] is active.
    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    fn set_transaction(&self, begin: bool, sql: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_transaction == begin {
            let (kind, state) = if begin {
                (TransactionErrorKind::AlreadyActive, "while a transaction is active")
            } else {
                (TransactionErrorKind::NotActive, "without an active transaction")
            };
            return Err(Error::Transaction(TransactionError {
                kind,
                message: format!("{sql} issued {state}"),
            }));
        }
        exec(inner.db, sql)?;
        inner.in_transaction = begin;
        tracing::trace!(statement = sql, "Transaction state changed");
        Ok(())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statement outlives a call
            unsafe {
                sqlite3_close_v2(inner.db);
            }
        }
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql, params)?;

        let col_count = stmt.column_count();
        let mut col_names = Vec::with_capacity(col_count as usize);
        for i in 0..col_count {
            // SAFETY: stmt is valid, i is in range
            let name = unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{i}"));
            col_names.push(name);
        }
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        while stmt.step()? {
            let values = (0..col_count)
                // SAFETY: stmt is valid, we just got SQLITE_ROW
                .map(|i| unsafe { types::read_column(stmt.raw, i) })
                .collect();
            rows.push(Row::with_columns(Arc::clone(&columns), values));
        }
        Ok(rows)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql, params)?;
        while stmt.step()? {}
        // SAFETY: db is valid
        let changes = unsafe { ffi::sqlite3_changes(inner.db) };
        Ok(changes as u64)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql, params)?;
        while stmt.step()? {}
        // SAFETY: db is valid; the lock keeps other statements out until here
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(inner.db) })
    }

    fn begin(&self) -> Result<()> {
        self.set_transaction(true, "BEGIN")
    }

    fn commit(&self) -> Result<()> {
        self.set_transaction(false, "COMMIT")
    }

    fn rollback(&self) -> Result<()> {
        self.set_transaction(false, "ROLLBACK")
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Opens [`SqliteConnection`]s; the data source url is the database path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self, config: &DataSourceConfig) -> Result<Box<dyn Connection>> {
        Ok(Box::new(SqliteConnection::open(&SqliteConfig::file(
            config.url.as_str(),
        ))?))
    }
}

/// A prepared statement with its parameters bound, finalized on drop.
struct Statement<'a> {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    sql: &'a str,
}

impl<'a> Statement<'a> {
    fn prepare(db: *mut ffi::sqlite3, sql: &'a str, params: &[Value]) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some(sql.to_string()),
            message: "SQL contains null byte".to_string(),
            source: None,
        }))?;

        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(db_error(db, sql));
        }
        let stmt = Self { raw, db, sql };

        // SAFETY: stmt is valid
        let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt.raw) } as usize;
        if expected != params.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                message: format!(
                    "statement expects {expected} parameters, {} supplied",
                    params.len()
                ),
                source: None,
            }));
        }
        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(stmt.raw, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                let mut err = db_error(db, sql);
                if let Error::Query(q) = &mut err {
                    q.message = format!("Failed to bind parameter {}: {}", i + 1, q.message);
                }
                return Err(err);
            }
        }
        Ok(stmt)
    }

    fn column_count(&self) -> c_int {
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_column_count(self.raw) }
    }

    /// Advance one row. `Ok(true)` when a row is available.
    fn step(&self) -> Result<bool> {
        // SAFETY: stmt is valid
        match unsafe { ffi::sqlite3_step(self.raw) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => Err(db_error(self.db, self.sql)),
        }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        // SAFETY: stmt is valid and finalized exactly once
        unsafe { ffi::sqlite3_finalize(self.raw) };
    }
}

fn exec(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        message: "SQL contains null byte".to_string(),
        source: None,
    }))?;

    let mut errmsg_ptr: *mut c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg_ptr) };

    if rc != ffi::SQLITE_OK {
        let message = if errmsg_ptr.is_null() {
            types::error_string(rc)
        } else {
            // SAFETY: errmsg_ptr is a valid string allocated by SQLite
            unsafe {
                let msg = CStr::from_ptr(errmsg_ptr).to_string_lossy().into_owned();
                ffi::sqlite3_free(errmsg_ptr.cast());
                msg
            }
        };
        return Err(Error::Query(QueryError {
            kind: error_code_to_kind(rc),
            sql: Some(sql.to_string()),
            message,
            source: None,
        }));
    }
    Ok(())
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
        .to_string_lossy()
        .into_owned()
}

fn db_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (message, code) = unsafe { (errmsg(db), ffi::sqlite3_errcode(db)) };
    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn connect_error(message: String) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE user (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, data BLOB)")
            .unwrap();
        conn
    }

    #[test]
    fn test_insert_returns_rowid() {
        let conn = conn();
        let a = conn.insert("INSERT INTO user (name) VALUES (?1)", &["a".into()]).unwrap();
        let b = conn.insert("INSERT INTO user (name) VALUES (?1)", &["b".into()]).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_query_reads_storage_classes() {
        let conn = conn();
        conn.insert(
            "INSERT INTO user (name, score, data) VALUES (?1, ?2, ?3)",
            &[Value::Text("a".into()), Value::Float(1.5), Value::Bytes(vec![1, 2])],
        )
        .unwrap();
        let rows = conn.query("SELECT * FROM user WHERE id = ?1", &[Value::Int(1)]).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(1)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("a".into())));
        assert_eq!(row.get_by_name("score"), Some(&Value::Double(1.5)));
        assert_eq!(row.get_by_name("data"), Some(&Value::Bytes(vec![1, 2])));
    }

    #[test]
    fn test_execute_counts_changes() {
        let conn = conn();
        conn.execute_raw("INSERT INTO user (name) VALUES ('a'); INSERT INTO user (name) VALUES ('b')")
            .unwrap();
        let n = conn.execute("UPDATE user SET score = ?1", &[Value::Double(2.0)]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(conn.execute("DELETE FROM user WHERE id = ?1", &[Value::BigInt(9)]).unwrap(), 0);
    }

    #[test]
    fn test_constraint_violation_kind() {
        let conn = conn();
        let err = conn.insert("INSERT INTO user (name) VALUES (?1)", &[Value::Null]).unwrap_err();
        match err {
            Error::Query(q) => {
                assert_eq!(q.kind, QueryErrorKind::Constraint);
                assert_eq!(q.sql.as_deref(), Some("INSERT INTO user (name) VALUES (?1)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let conn = conn();
        assert!(conn.query("SELECT * FROM user WHERE id = ?1", &[]).is_err());
    }

    #[test]
    fn test_syntax_error() {
        let conn = conn();
        assert!(conn.query("SELEC nonsense", &[]).is_err());
    }

    #[test]
    fn test_transaction_rollback() {
        let conn = conn();
        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.insert("INSERT INTO user (name) VALUES (?1)", &["a".into()]).unwrap();
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());
        assert!(conn.query("SELECT * FROM user", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_state_errors() {
        let conn = conn();
        assert!(matches!(conn.commit(), Err(Error::Transaction(_))));
        conn.begin().unwrap();
        assert!(matches!(conn.begin(), Err(Error::Transaction(_))));
        conn.commit().unwrap();
    }

    #[test]
    fn test_driver_connects() {
        let conn = SqliteDriver
            .connect(&DataSourceConfig::new("sqlite", ":memory:"))
            .unwrap();
        assert_eq!(conn.dialect(), Dialect::Sqlite);
        assert_eq!(SqliteDriver.name(), "sqlite");
    }
}
