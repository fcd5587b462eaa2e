//! Error types for SQLEntity operations.

use std::fmt;

/// The primary error type for all SQLEntity operations.
#[derive(Debug)]
pub enum Error {
    /// Entity lifecycle errors (not managed, not found, identity conflicts)
    Entity(EntityError),
    /// Transaction and savepoint state errors
    Transaction(TransactionError),
    /// A flush statement failed
    Write(WriteError),
    /// Query execution errors reported by the connection
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Missing or inconsistent entity metadata
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    pub entity_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityErrorKind {
    /// The entity is not tracked by the current unit of work
    NotManaged,
    /// The requested row does not exist
    NotFound,
    /// A different live instance is already registered for the same identity
    IdentityConflict,
    /// The entity has no identifier value where one is required
    MissingIdentifier,
    /// The entity does not expose the requested field or association
    UnknownField,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Flush or commit without an open transaction
    NoActiveTransaction,
    /// Begin while a transaction is already open
    AlreadyActive,
    /// The backend does not support savepoints
    SavepointUnsupported,
    /// Malformed savepoint name, or one already on the nesting stack
    InvalidSavepointName,
    /// Savepoint not found
    SavepointNotFound,
}

/// Statement kinds issued during flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
    JunctionInsert,
    JunctionDelete,
}

impl WriteOperation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Insert => "INSERT",
            WriteOperation::Update => "UPDATE",
            WriteOperation::Delete => "DELETE",
            WriteOperation::JunctionInsert => "junction INSERT",
            WriteOperation::JunctionDelete => "junction DELETE",
        }
    }
}

#[derive(Debug)]
pub struct WriteError {
    pub operation: WriteOperation,
    pub table: String,
    pub source: Box<Error>,
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
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity_type: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn not_managed(entity_type: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        Error::Entity(EntityError {
            message: format!("{entity_type} instance is not managed by the current unit of work"),
            entity_type,
            kind: EntityErrorKind::NotManaged,
        })
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl fmt::Debug) -> Self {
        let entity_type = entity_type.into();
        Error::Entity(EntityError {
            message: format!("{entity_type} with identifier {id:?} not found"),
            entity_type,
            kind: EntityErrorKind::NotFound,
        })
    }

    pub fn entity(
        kind: EntityErrorKind,
        entity_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Entity(EntityError {
            kind,
            entity_type: entity_type.into(),
            message: message.into(),
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    pub fn mapping(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity_type: entity_type.into(),
            message: message.into(),
        })
    }

    /// Wrap a connection failure raised by a flush statement.
    pub fn write(operation: WriteOperation, table: impl Into<String>, source: Error) -> Self {
        Error::Write(WriteError {
            operation,
            table: table.into(),
            source: Box::new(source),
        })
    }

    pub fn entity_kind(&self) -> Option<EntityErrorKind> {
        match self {
            Error::Entity(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self {
            Error::Transaction(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_not_managed(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::NotManaged)
    }

    pub fn is_not_found(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::NotFound)
    }

    pub fn is_write_failure(&self) -> bool {
        matches!(self, Error::Write(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Write(w) => w.source.sql(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Entity(e) => write!(f, "Entity error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Write(e) => write!(f, "Write error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
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
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Write(e) => Some(e.source.as_ref()),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on \"{}\" failed: {}",
            self.operation.as_str(),
            self.table,
            self.source
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity_type, self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<EntityError> for Error {
    fn from(err: EntityError) -> Self {
        Error::Entity(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        Error::Write(err)
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

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for SQLEntity operations.
pub type Result<T> = std::result::Result<T, Error>;
