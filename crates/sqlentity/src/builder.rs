//! Building entity managers.
//!
//! An [`EntityManagerBuilder`] collects entity metadata, type converters and
//! configuration, then produces an [`EntityManager`] for a connection. Errors
//! from registration are reported by the `build*` methods, so the chain
//! itself never fails.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlentity::prelude::*;
//!
//! let em = EntityManager::builder()
//!     .entity(author_metadata())
//!     .entity(post_metadata())
//!     .converter(SqlType::Uuid, UuidTextConverter)
//!     .auto_begin(false)
//!     .build(connection)?;
//!
//! // Or open the connection through a driver registry
//! let em = EntityManager::builder()
//!     .entity(author_metadata())
//!     .connect(&drivers, "postgres://localhost/app")?;
//! ```

use sqlentity_core::{
    Connection, DriverRegistry, EntityMetadata, MetadataRegistry, Result, SqlType,
    TypeConverter, TypeRegistry,
};
use sqlentity_session::{EntityManager, EntityManagerConfig};

/// Builder for [`EntityManager`] instances with a fluent API.
#[derive(Debug, Default)]
pub struct EntityManagerBuilder {
    entities: Vec<EntityMetadata>,
    types: TypeRegistry,
    config: EntityManagerConfig,
}

/// Adds [`EntityManager::builder`].
pub trait EntityManagerExt {
    fn builder() -> EntityManagerBuilder;
}

impl<C: Connection + 'static> EntityManagerExt for EntityManager<C> {
    fn builder() -> EntityManagerBuilder {
        EntityManagerBuilder::new()
    }
}

impl EntityManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type.
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    /// Register a storage converter for columns of `sql_type`.
    pub fn converter(mut self, sql_type: SqlType, converter: impl TypeConverter + 'static) -> Self {
        self.types.register(&sql_type, converter);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EntityManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn auto_begin(mut self, value: bool) -> Self {
        self.config.auto_begin = value;
        self
    }

    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.savepoint_prefix = prefix.into();
        self
    }

    pub fn use_savepoints(mut self, value: bool) -> Self {
        self.config.use_savepoints = value;
        self
    }

    /// Build the entity manager over `connection`.
    ///
    /// Fails when an entity type is registered twice, when an association
    /// names an unknown target, or when the configuration is invalid.
    pub fn build<C: Connection + 'static>(self, connection: C) -> Result<EntityManager<C>> {
        let mut metadata = MetadataRegistry::new();
        for entity in self.entities {
            metadata.register(entity)?;
        }
        tracing::debug!(entities = metadata.len(), "Building entity manager");
        EntityManager::with_config(connection, metadata, self.types, self.config)
    }

    /// Open a connection for `url` through `drivers` and build over it.
    pub fn connect(
        self,
        drivers: &DriverRegistry,
        url: &str,
    ) -> Result<EntityManager<Box<dyn Connection>>> {
        let connection = drivers.connect(url)?;
        self.build(connection)
    }
}
