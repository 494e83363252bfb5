//! Error types for relmodel operations.

use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Declared mapping metadata is missing or contradictory
    Annotation(AnnotationError),
    /// Identifier declaration or identifier value problems
    EntityId(EntityIdError),
    /// An association references an entity that cannot be written
    Entity(EntityError),
    /// A row could not be turned into an entity
    EntityLoader(EntityLoaderError),
    /// Query execution or query building errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Connection-related errors
    Connection(ConnectionError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
}

#[derive(Debug)]
pub struct AnnotationError {
    pub type_name: String,
    pub message: String,
}

#[derive(Debug)]
pub struct EntityIdError {
    pub type_name: String,
    pub kind: EntityIdErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityIdErrorKind {
    /// More than one member is marked as identifier
    MultipleIds,
    /// No member is marked as identifier
    NoId,
    /// An id value is present although the database generates it
    AutoGeneratedId,
    /// No id value is present although the database does not generate it
    MissingIdValue,
}

#[derive(Debug)]
pub struct EntityError {
    pub message: String,
}

#[derive(Debug)]
pub struct EntityLoaderError {
    pub type_name: String,
    pub member: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Database busy or locked
    Busy,
    /// A lazy query builder was used incorrectly
    Builder,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// BEGIN while a transaction is open
    AlreadyActive,
    /// COMMIT or ROLLBACK without a transaction
    NotActive,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Build an [`Error::Annotation`].
    pub fn annotation(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Annotation(AnnotationError {
            type_name: type_name.into(),
            message: message.into(),
        })
    }

    /// Build an [`Error::EntityId`].
    pub fn entity_id(type_name: impl Into<String>, kind: EntityIdErrorKind) -> Self {
        Error::EntityId(EntityIdError {
            type_name: type_name.into(),
            kind,
        })
    }

    /// Build an [`Error::Entity`].
    pub fn entity(message: impl Into<String>) -> Self {
        Error::Entity(EntityError {
            message: message.into(),
        })
    }

    /// Build an [`Error::EntityLoader`].
    pub fn loader(
        type_name: impl Into<String>,
        member: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::EntityLoader(EntityLoaderError {
            type_name: type_name.into(),
            member: member.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build a builder-misuse [`Error::Query`].
    pub fn builder(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Builder,
            sql: None,
            message: message.into(),
            source: None,
        })
    }

    /// Build an [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The identifier error kind, if this is an [`Error::EntityId`].
    pub fn entity_id_kind(&self) -> Option<EntityIdErrorKind> {
        match self {
            Error::EntityId(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Annotation(e) => write!(f, "Annotation error: {}", e),
            Error::EntityId(e) => write!(f, "Entity id error: {}", e),
            Error::Entity(e) => write!(f, "Entity error: {}", e.message),
            Error::EntityLoader(e) => write!(f, "Entity loader error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad mapping for {}: {}", self.type_name, self.message)
    }
}

impl fmt::Display for EntityIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityIdErrorKind::MultipleIds => write!(
                f,
                "{} declares more than one identifier member",
                self.type_name
            ),
            EntityIdErrorKind::NoId => write!(
                f,
                "{} does not declare an identifier member",
                self.type_name
            ),
            EntityIdErrorKind::AutoGeneratedId => write!(
                f,
                "{} has a generated identifier but the instance already carries an id value",
                self.type_name
            ),
            EntityIdErrorKind::MissingIdValue => write!(
                f,
                "{} has no id value and its identifier is not generated",
                self.type_name
            ),
        }
    }
}

impl fmt::Display for EntityLoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member {
            Some(member) => write!(
                f,
                "cannot load {}.{}: {}",
                self.type_name, member, self.message
            ),
            None => write!(f, "cannot load {}: {}", self.type_name, self.message),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql {
            Some(sql) => write!(f, "{} (sql: {})", self.message, sql),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.actual)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<AnnotationError> for Error {
    fn from(err: AnnotationError) -> Self {
        Error::Annotation(err)
    }
}

impl From<EntityIdError> for Error {
    fn from(err: EntityIdError) -> Self {
        Error::EntityId(err)
    }
}

impl From<EntityError> for Error {
    fn from(err: EntityError) -> Self {
        Error::Entity(err)
    }
}

impl From<EntityLoaderError> for Error {
    fn from(err: EntityLoaderError) -> Self {
        Error::EntityLoader(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
