//! Unit of Work and Entity Manager for SQLEntity Rust.
//!
//! `sqlentity-session` is the **persistence layer**. It coordinates object
//! identity, change tracking, cascading and transactional writes on top of
//! the metadata and connection abstractions in `sqlentity-core`.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory instance per `(type, identifier)`.
//! - **Change tracking**: snapshots taken when entities become managed,
//!   compared by value at flush time.
//! - **Flush**: dependency-ordered INSERT/UPDATE/DELETE plus junction rows.
//! - **Savepoints**: every unit of work writes behind its own savepoint, so a
//!   failed flush never discards a sibling unit's work.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is written before `flush`/`commit`.
//! - **Handles, not copies**: entities are shared [`EntityRef`] handles; the
//!   identity map hands out the same handle for the same row.
//! - **Lazy references**: foreign keys hydrate into proxies that load on
//!   first non-identifier access.
//!
//! # Example
//!
//! ```ignore
//! let mut em = EntityManager::new(conn, metadata)?;
//!
//! // New entities are INSERTed on flush, referenced ones first
//! em.persist(&post)?;
//!
//! // Loads once; later finds return the same handle
//! let author = em.find("Author", 1_i64)?;
//!
//! // Mark for deletion
//! em.remove(&old_post)?;
//!
//! // Flush and commit
//! em.commit()?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod hydrator;
pub mod identity_map;
pub mod junction;
pub mod proxy;
pub mod savepoint;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, Changes, ObjectSnapshot};
pub use flush::{FlushOrderer, FlushResult, LinkTableOp, PendingOp};
pub use hydrator::{Hydrated, HydrationMode, Hydrator};
pub use identity_map::{IdentityMap, ObjectKey};
pub use junction::{JunctionChangeSet, JunctionChanges, JunctionKey};
pub use proxy::ProxyFactory;
pub use savepoint::{SavepointStack, SavepointState, is_valid_savepoint_name};
pub use unit_of_work::{PendingCounts, UnitOfWork, UnitOfWorkId};

use serde::{Deserialize, Serialize};
use sqlentity_core::error::ConfigError;
use sqlentity_core::{
    Connection, EntityRef, Error, MetadataRegistry, Result, Row, TransactionErrorKind,
    TypeRegistry, Value,
};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for an [`EntityManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityManagerConfig {
    /// Whether `flush` opens (and then commits) a transaction when none is
    /// active.
    pub auto_begin: bool,
    /// Prefix of unit-of-work savepoint names (`<prefix>_<unit>_<n>`).
    pub savepoint_prefix: String,
    /// Whether each unit of work flushes behind its own savepoint.
    pub use_savepoints: bool,
    /// Whether commit releases open savepoints before `COMMIT`.
    pub release_savepoints_on_commit: bool,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            savepoint_prefix: "uow".to_string(),
            use_savepoints: true,
            release_savepoints_on_commit: true,
        }
    }
}

impl EntityManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `auto_begin` option (builder pattern).
    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }

    pub fn use_savepoints(mut self, value: bool) -> Self {
        self.use_savepoints = value;
        self
    }

    pub fn release_savepoints_on_commit(mut self, value: bool) -> Self {
        self.release_savepoints_on_commit = value;
        self
    }

    /// Check that the prefix yields valid savepoint names.
    pub fn validate(&self) -> Result<()> {
        let sample = format!("{}_1_1", self.savepoint_prefix);
        if self.savepoint_prefix.is_empty() || !is_valid_savepoint_name(&sample) {
            return Err(Error::Config(ConfigError {
                message: format!(
                    "savepoint prefix '{}' does not form valid savepoint names",
                    self.savepoint_prefix
                ),
                source: None,
            }));
        }
        Ok(())
    }
}

// ============================================================================
// Shared context
// ============================================================================

/// What every part of the engine needs: the connection, entity metadata and
/// storage conversions. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub connection: Arc<dyn Connection>,
    pub metadata: Arc<MetadataRegistry>,
    pub types: Arc<TypeRegistry>,
}

impl SessionContext {
    pub fn new(
        connection: Arc<dyn Connection>,
        metadata: Arc<MetadataRegistry>,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            connection,
            metadata,
            types,
        }
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("metadata", &self.metadata)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Entity Manager
// ============================================================================

/// The public entry point: a connection, its units of work and the
/// transaction they share.
///
/// One unit of work is current at a time; every entity operation goes to it.
/// All units share the connection's transaction and its savepoint stack.
pub struct EntityManager<C: Connection + 'static> {
    connection: Arc<C>,
    context: SessionContext,
    config: EntityManagerConfig,
    units: Vec<UnitOfWork>,
    current: usize,
    savepoints: SavepointStack,
}

impl<C: Connection + 'static> fmt::Debug for EntityManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("config", &self.config)
            .field("units", &self.units.len())
            .field("current", &self.units[self.current].id())
            .field("savepoints", &self.savepoints)
            .finish_non_exhaustive()
    }
}

impl<C: Connection + 'static> EntityManager<C> {
    /// Create an entity manager with the default configuration and no type
    /// converters.
    pub fn new(connection: C, metadata: MetadataRegistry) -> Result<Self> {
        Self::with_config(
            connection,
            metadata,
            TypeRegistry::new(),
            EntityManagerConfig::default(),
        )
    }

    /// Create an entity manager; validates the configuration and the
    /// metadata's cross references.
    pub fn with_config(
        connection: C,
        metadata: MetadataRegistry,
        types: TypeRegistry,
        config: EntityManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        metadata.validate()?;
        let connection = Arc::new(connection);
        let shared: Arc<dyn Connection> = connection.clone();
        let context = SessionContext::new(shared, Arc::new(metadata), Arc::new(types));
        tracing::debug!(
            entities = context.metadata.len(),
            auto_begin = config.auto_begin,
            use_savepoints = config.use_savepoints,
            "Entity manager created"
        );
        Ok(Self {
            connection,
            context,
            config,
            units: vec![UnitOfWork::new(UnitOfWorkId(1))],
            current: 0,
            savepoints: SavepointStack::new(),
        })
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.context.metadata
    }

    /// The savepoints currently open on the connection.
    pub fn savepoints(&self) -> &SavepointStack {
        &self.savepoints
    }

    // ========================================================================
    // Units of Work
    // ========================================================================

    /// The current unit of work.
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.units[self.current]
    }

    /// Start a new unit of work and make it current.
    pub fn create_unit_of_work(&mut self) -> UnitOfWorkId {
        let id = UnitOfWorkId(self.units.len() as u64 + 1);
        self.units.push(UnitOfWork::new(id));
        self.current = self.units.len() - 1;
        tracing::debug!(unit = %id, "Created unit of work");
        id
    }

    /// Make an existing unit of work current.
    pub fn set_unit_of_work(&mut self, id: UnitOfWorkId) -> Result<()> {
        let position = self
            .units
            .iter()
            .position(|unit| unit.id() == id)
            .ok_or_else(|| Error::Custom(format!("unknown unit of work {id}")))?;
        self.current = position;
        tracing::trace!(unit = %id, "Switched unit of work");
        Ok(())
    }

    /// Pending work of the current unit as the next flush would see it.
    pub fn pending_counts(&mut self) -> Result<PendingCounts> {
        self.units[self.current].pending_counts(&self.context)
    }

    // ========================================================================
    // Entity Operations
    // ========================================================================

    /// Find an entity by identifier: the managed instance when there is
    /// one, otherwise the row is loaded and hydrated.
    pub fn find(&mut self, entity_type: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.units[self.current].find(&self.context, entity_type, id.into())
    }

    /// Make `entity` (and everything reachable from it) managed; new
    /// entities are inserted on the next flush.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.units[self.current].persist(&self.context, entity)
    }

    /// Schedule a managed entity for deletion.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.units[self.current].remove(entity)
    }

    /// Reload a managed entity from the database.
    pub fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.units[self.current].refresh(&self.context, entity)
    }

    /// Stop managing `entity`; pending changes to it are dropped.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        self.units[self.current].detach(entity)
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.units[self.current].contains(entity)
    }

    /// Copy a detached entity onto its managed counterpart.
    pub fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.units[self.current].merge(&self.context, entity)
    }

    /// A lazy reference: no SQL until a non-identifier field is read.
    pub fn get_reference(&mut self, entity_type: &str, id: impl Into<Value>) -> Result<EntityRef> {
        self.units[self.current].get_reference(&self.context, entity_type, id.into())
    }

    /// Load a one-to-many or many-to-many collection of a managed entity.
    pub fn load_collection(&mut self, owner: &EntityRef, field: &str) -> Result<Vec<EntityRef>> {
        self.units[self.current].load_collection(&self.context, owner, field)
    }

    /// Hydrate a row obtained elsewhere (e.g. a custom query).
    pub fn hydrate(
        &mut self,
        row: &Row,
        entity_type: &str,
        mode: HydrationMode,
    ) -> Result<EntityRef> {
        self.units[self.current].hydrate(&self.context, row, entity_type, mode)
    }

    // ========================================================================
    // Flush & Transaction Management
    // ========================================================================

    pub fn in_transaction(&self) -> bool {
        self.connection.in_transaction()
    }

    /// Write the current unit's pending changes.
    ///
    /// Without an active transaction this either fails (`auto_begin` off) or
    /// runs inside an implicit one that is committed on success and rolled
    /// back on failure.
    pub fn flush(&mut self) -> Result<FlushResult> {
        if self.in_transaction() {
            return self.flush_current();
        }
        if !self.config.auto_begin {
            return Err(Error::transaction(
                TransactionErrorKind::NoActiveTransaction,
                "flush requires an active transaction (auto_begin is off)",
            ));
        }
        tracing::debug!("Opening implicit transaction for flush");
        self.begin()?;
        match self.flush_current() {
            Ok(result) => {
                self.finish_commit()?;
                Ok(result)
            }
            Err(error) => {
                self.rollback_quietly();
                Err(error)
            }
        }
    }

    fn flush_current(&mut self) -> Result<FlushResult> {
        self.units[self.current].flush(&self.context, &mut self.savepoints, &self.config)
    }

    /// Drop the current unit's managed state, rolling back to its savepoint
    /// when that is still the innermost one.
    pub fn clear(&mut self) -> Result<()> {
        self.units[self.current].clear(&*self.context.connection, &mut self.savepoints)
    }

    /// Begin a transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active",
            ));
        }
        self.connection.begin()?;
        self.savepoints.clear();
        tracing::debug!("Transaction started");
        Ok(())
    }

    /// Flush the current unit, release savepoints and commit.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_transaction() {
            return Err(Error::transaction(
                TransactionErrorKind::NoActiveTransaction,
                "commit requires an active transaction",
            ));
        }
        self.flush_current()?;
        self.finish_commit()
    }

    fn finish_commit(&mut self) -> Result<()> {
        if self.config.release_savepoints_on_commit {
            let failed = self.savepoints.release_all(&*self.context.connection);
            if failed > 0 {
                tracing::warn!(failed, "Some savepoints could not be released before commit");
            }
        }
        self.connection.commit()?;
        self.savepoints.clear();
        for unit in &mut self.units {
            unit.mark_savepoint_released();
        }
        tracing::info!("Transaction committed");
        Ok(())
    }

    /// Roll back the transaction. Every unit of work forgets its managed
    /// state, since it may describe rows that no longer exist.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction() {
            tracing::debug!("Rollback without an active transaction");
            return Ok(());
        }
        let outcome = self.connection.rollback();
        self.savepoints.clear();
        for unit in &mut self.units {
            unit.reset_savepoint();
            unit.discard();
        }
        tracing::info!("Transaction rolled back");
        outcome
    }

    fn rollback_quietly(&mut self) {
        if let Err(error) = self.rollback() {
            tracing::warn!(%error, "Rollback failed");
        }
    }

    /// Run `work` in a transaction: commit when it succeeds, roll back when
    /// it (or the commit) fails.
    pub fn transactional<R>(&mut self, work: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.begin()?;
        let outcome = work(self).and_then(|value| self.commit().map(|()| value));
        if let Err(error) = &outcome {
            tracing::warn!(%error, "Transactional work failed; rolling back");
            self.rollback_quietly();
        }
        outcome
    }
}
