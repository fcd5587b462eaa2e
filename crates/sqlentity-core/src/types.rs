//! SQL type definitions and storage conversion.
//!
//! Every mapped field declares a [`SqlType`]. When a value crosses the
//! storage boundary (statement parameters on flush, row cells on hydration)
//! it passes through the converter registered for that type in a
//! [`TypeRegistry`]. Types without a registered converter pass through
//! unchanged.

use crate::error::{Error, TypeError};
use crate::{Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// SQL data types a field can be mapped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    Boolean,

    // String types
    VarChar(u32),
    Text,

    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,
    TimestampTz,

    Uuid,
    Json,

    // Custom type name
    Custom(&'static str),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::Custom(name) => (*name).to_string(),
        }
    }

    /// Registry key: the type name without length or precision arguments.
    pub fn family(&self) -> &'static str {
        match self {
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Decimal { .. } => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::VarChar(_) => "VARCHAR",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampTz => "TIMESTAMPTZ",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
            SqlType::Custom(name) => name,
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt
                | SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Decimal { .. }
        )
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// Converts field values to and from their stored representation.
///
/// Implementations must be pure: the engine calls them at flush time for
/// every parameter and at hydration time for every cell, and compares the
/// results against snapshots.
pub trait TypeConverter: Send + Sync {
    fn to_storage(&self, value: Value) -> Result<Value>;
    fn from_storage(&self, value: Value) -> Result<Value>;
}

/// Stores UUIDs as their hyphenated text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTextConverter;

impl TypeConverter for UuidTextConverter {
    fn to_storage(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            other => other
                .as_uuid()
                .map(|id| Value::Text(id.hyphenated().to_string()))
                .ok_or_else(|| uuid_mismatch(&other)),
        }
    }

    fn from_storage(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            other => other
                .as_uuid()
                .map(Value::from)
                .ok_or_else(|| uuid_mismatch(&other)),
        }
    }
}

fn uuid_mismatch(value: &Value) -> Error {
    Error::Type(TypeError {
        expected: "UUID",
        actual: value.type_name().to_string(),
        column: None,
    })
}

/// Stores JSON documents as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTextConverter;

impl TypeConverter for JsonTextConverter {
    fn to_storage(&self, value: Value) -> Result<Value> {
        match value {
            Value::Json(doc) => Ok(Value::Text(serde_json::to_string(&doc)?)),
            other => Ok(other),
        }
    }

    fn from_storage(&self, value: Value) -> Result<Value> {
        match value {
            Value::Text(text) => Ok(Value::Json(serde_json::from_str(&text)?)),
            other => Ok(other),
        }
    }
}

/// Per-type converter table consulted at the storage boundary.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    converters: HashMap<String, Arc<dyn TypeConverter>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.converters.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry")
            .field("converters", &names)
            .finish()
    }
}

impl TypeRegistry {
    /// Create an empty registry (every type passes through).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter for a type family, replacing any previous one.
    pub fn register(&mut self, sql_type: &SqlType, converter: impl TypeConverter + 'static) {
        self.converters
            .insert(sql_type.family().to_string(), Arc::new(converter));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, sql_type: &SqlType, converter: impl TypeConverter + 'static) -> Self {
        self.register(sql_type, converter);
        self
    }

    pub fn has_converter(&self, sql_type: &SqlType) -> bool {
        self.converters.contains_key(sql_type.family())
    }

    pub fn to_storage(&self, sql_type: &SqlType, value: Value) -> Result<Value> {
        match self.converters.get(sql_type.family()) {
            Some(converter) => converter.to_storage(value),
            None => Ok(value),
        }
    }

    pub fn from_storage(&self, sql_type: &SqlType, value: Value) -> Result<Value> {
        match self.converters.get(sql_type.family()) {
            Some(converter) => converter.from_storage(value),
            None => Ok(value),
        }
    }
}
