//! Core types and traits for SQLEntity Rust.
//!
//! This crate provides the foundational abstractions the persistence engine
//! is built on:
//!
//! - `Entity` accessor trait and the shared `EntityRef` handle / lazy proxy
//! - `EntityMetadata` and the `MetadataRegistry` describing tables, fields,
//!   associations and inheritance
//! - `Connection` trait and the `DriverRegistry`
//! - `TypeRegistry` for storage conversion of field values
//! - `Value`, `Row` and the `Error` type

pub mod connection;
pub mod entity;
pub mod error;
pub mod field;
pub mod metadata;
pub mod relationship;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, ConnectionConfig, DriverFactory, DriverRegistry};
pub use entity::{Association, Entity, EntityRef, LoadedEntity, Loader, unknown_field};
pub use error::{
    EntityError, EntityErrorKind, Error, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, WriteError, WriteOperation,
};
pub use field::FieldMapping;
pub use metadata::{EntityMetadata, IdStrategy, InheritanceMapping, MetadataRegistry};
pub use relationship::{AssociationKind, AssociationMapping, JunctionTable};
pub use row::Row;
pub use types::{JsonTextConverter, SqlType, TypeConverter, TypeRegistry, UuidTextConverter};
pub use value::Value;
