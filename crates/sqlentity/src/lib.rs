//! SQLEntity Rust - unit-of-work persistence for relational databases.
//!
//! SQLEntity tracks plain Rust structs and writes their changes back as
//! ordered SQL, providing:
//!
//! - An identity map: one in-memory instance per row
//! - Snapshot-based dirty checking and changed-column UPDATEs
//! - Cascading persist with referenced rows inserted first
//! - Many-to-many junction rows kept in sync with collections
//! - Lazy references that load on first use
//! - Per-unit-of-work savepoints
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlentity::prelude::*;
//!
//! let mut em = EntityManager::builder()
//!     .entity(
//!         EntityMetadata::new("Hero", "heroes", || Box::new(Hero::default()))
//!             .id_strategy(IdStrategy::Database)
//!             .field(FieldMapping::id("id", SqlType::BigInt))
//!             .field(FieldMapping::new("name", SqlType::Text)),
//!     )
//!     .build(connection)?;
//!
//! // Insert
//! let hero = EntityRef::new(Hero { id: None, name: "Spider-Man".into() });
//! em.persist(&hero)?;
//! em.flush()?;
//!
//! // Find (served from the identity map the second time)
//! let found = em.find("Hero", hero.get("id")?)?.expect("hero exists");
//! assert_eq!(found, hero);
//!
//! // Update: only changed columns are written
//! hero.set("name", "Peter Parker")?;
//! em.flush()?;
//!
//! // Delete
//! em.remove(&hero)?;
//! em.flush()?;
//! ```

// Re-export all public types from sub-crates
pub use sqlentity_core::{
    Association,
    AssociationKind,
    AssociationMapping,
    // Connections
    Connection,
    ConnectionConfig,
    DriverFactory,
    DriverRegistry,
    // Entities
    Entity,
    EntityError,
    EntityErrorKind,
    EntityMetadata,
    EntityRef,
    Error,
    FieldMapping,
    IdStrategy,
    InheritanceMapping,
    JsonTextConverter,
    JunctionTable,
    LoadedEntity,
    Loader,
    MetadataRegistry,
    QueryError,
    QueryErrorKind,
    Result,
    Row,
    SqlType,
    TransactionError,
    TransactionErrorKind,
    TypeConverter,
    TypeRegistry,
    UuidTextConverter,
    Value,
    WriteError,
    WriteOperation,
    unknown_field,
};

pub use sqlentity_session::{
    ChangeTracker, EntityManager, EntityManagerConfig, FlushResult, HydrationMode, IdentityMap,
    PendingCounts, SavepointState, SessionContext, UnitOfWork, UnitOfWorkId,
};

// Entity manager construction
pub mod builder;
pub use builder::{EntityManagerBuilder, EntityManagerExt};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Association,
        AssociationMapping,
        // Connections
        Connection,
        DriverRegistry,
        // Entities
        Entity,
        EntityManager,
        // Building
        EntityManagerBuilder,
        EntityManagerConfig,
        EntityManagerExt,
        EntityMetadata,
        EntityRef,
        Error,
        FieldMapping,
        HydrationMode,
        IdStrategy,
        InheritanceMapping,
        JunctionTable,
        MetadataRegistry,
        Result,
        Row,
        SqlType,
        UuidTextConverter,
        Value,
        unknown_field,
    };
}
