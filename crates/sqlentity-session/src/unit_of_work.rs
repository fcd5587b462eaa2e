//! The unit of work: one scope of managed entities and their pending writes.
//!
//! A unit owns an identity map, a change tracker, the insert/delete
//! schedules and the junction change set. Nothing is written until
//! [`UnitOfWork::flush`], which:
//!
//! 1. cascades persist over everything reachable from managed entities,
//! 2. diffs many-to-many collections and dirty-checks snapshots,
//! 3. opens (or reuses) the unit's savepoint,
//! 4. deletes, inserts, updates and rewrites junction rows, in that order.
//!
//! A failed flush rolls the connection back to the unit's savepoint and
//! leaves the schedules as they were, so it can be retried once the cause is
//! fixed.

use crate::change_tracker::{ChangeTracker, Changes, ObjectSnapshot, reference_value};
use crate::flush::{FlushOrderer, FlushResult, LinkTableOp, PendingOp};
use crate::hydrator::{HydrationMode, Hydrator, fetch_by_column, fetch_by_id, fetch_linked};
use crate::identity_map::IdentityMap;
use crate::junction::{JunctionChangeSet, JunctionKey};
use crate::proxy::{ProxyFactory, find_in_hierarchy};
use crate::savepoint::{SavepointStack, SavepointState, UnitSavepoint};
use crate::{EntityManagerConfig, SessionContext};
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlentity_core::{
    Association, AssociationKind, AssociationMapping, Connection, EntityErrorKind,
    EntityMetadata, EntityRef, Error, IdStrategy, LoadedEntity, Result, Row, SqlType,
    TransactionErrorKind, Value, WriteOperation, unknown_field,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Identifies a unit of work within its entity manager; also part of its
/// savepoint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitOfWorkId(pub u64);

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub insertions: usize,
    pub updates: usize,
    pub deletions: usize,
    pub junction_inserts: usize,
    pub junction_deletes: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.insertions
            + self.updates
            + self.deletions
            + self.junction_inserts
            + self.junction_deletes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// How far a cascade reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cascade {
    /// An explicit persist: revives removed targets and schedules links.
    Persist,
    /// Reachability at flush time: leaves removed targets alone; links come
    /// from the collection diff.
    Flush,
}

/// What a successful write pass did, applied to the schedules afterwards.
#[derive(Default)]
struct Written {
    result: FlushResult,
    deleted: Vec<EntityRef>,
    touched: IndexSet<EntityRef>,
}

#[derive(Debug)]
pub struct UnitOfWork {
    id: UnitOfWorkId,
    identity: Arc<Mutex<IdentityMap>>,
    tracker: ChangeTracker,
    insertions: IndexSet<EntityRef>,
    updates: IndexSet<EntityRef>,
    deletions: IndexSet<EntityRef>,
    junctions: JunctionChangeSet,
    savepoint: UnitSavepoint,
}

impl UnitOfWork {
    pub fn new(id: UnitOfWorkId) -> Self {
        Self {
            id,
            identity: Arc::new(Mutex::new(IdentityMap::new())),
            tracker: ChangeTracker::new(),
            insertions: IndexSet::new(),
            updates: IndexSet::new(),
            deletions: IndexSet::new(),
            junctions: JunctionChangeSet::new(),
            savepoint: UnitSavepoint::default(),
        }
    }

    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    /// The identity map, shared with the loaders of proxies this unit hands
    /// out.
    pub fn identity_map(&self) -> &Arc<Mutex<IdentityMap>> {
        &self.identity
    }

    pub fn change_tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn savepoint_state(&self) -> SavepointState {
        self.savepoint.state()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint.name()
    }

    /// Whether `entity` is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        !self.deletions.contains(entity)
            && (self.insertions.contains(entity) || self.identity.lock().contains_ref(entity))
    }

    pub fn is_scheduled_for_insert(&self, entity: &EntityRef) -> bool {
        self.insertions.contains(entity)
    }

    pub fn is_scheduled_for_delete(&self, entity: &EntityRef) -> bool {
        self.deletions.contains(entity)
    }

    /// Whether anything is scheduled, as of the last dirty check.
    pub fn has_pending_writes(&self) -> bool {
        !self.insertions.is_empty()
            || !self.updates.is_empty()
            || !self.deletions.is_empty()
            || !self.junctions.is_empty()
    }

    pub fn proxy_factory(&self, ctx: &SessionContext) -> ProxyFactory {
        ProxyFactory::bound(ctx.clone(), &self.identity)
    }

    fn find_managed(
        &self,
        ctx: &SessionContext,
        entity_type: &'static str,
        id: &Value,
    ) -> Option<EntityRef> {
        find_in_hierarchy(&self.identity.lock(), &ctx.metadata, entity_type, id)
    }

    /// Managed handles in registration order: the identity map first, then
    /// insertions still waiting for a generated identifier.
    fn managed_handles(&self) -> Vec<EntityRef> {
        let mut handles: IndexSet<EntityRef> = self.identity.lock().handles().into_iter().collect();
        handles.extend(self.insertions.iter().cloned());
        handles
            .into_iter()
            .filter(|entity| !self.deletions.contains(entity))
            .collect()
    }

    // ========================================================================
    // Persist / remove / detach
    // ========================================================================

    /// Make `entity` managed and schedule it for insertion, cascading to
    /// everything it references.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(unit = %self.id, entity = entity.entity_type())
    )]
    pub fn persist(&mut self, ctx: &SessionContext, entity: &EntityRef) -> Result<()> {
        self.persist_one(ctx, entity)
    }

    fn persist_one(&mut self, ctx: &SessionContext, entity: &EntityRef) -> Result<()> {
        if self.deletions.shift_remove(entity) {
            tracing::debug!(entity = entity.entity_type(), "Persist cancelled a pending removal");
            return Ok(());
        }
        if self.insertions.contains(entity) || self.identity.lock().contains_ref(entity) {
            return Ok(());
        }
        let meta = ctx.metadata.get(entity.entity_type())?;
        if entity.is_proxy() {
            // A reference stands for a row that already exists.
            let id = meta.id_of(entity);
            self.identity.lock().register(meta.entity_type, id, entity.clone())?;
            return Ok(());
        }

        let id = assign_identifier(&meta, entity)?;
        if !id.is_null() {
            self.identity.lock().register(meta.entity_type, id, entity.clone())?;
        }
        self.insertions.insert(entity.clone());
        tracing::debug!(entity = meta.entity_type, "Scheduled for insertion");
        self.cascade(ctx, &meta, entity, Cascade::Persist)
    }

    fn cascade(
        &mut self,
        ctx: &SessionContext,
        meta: &EntityMetadata,
        owner: &EntityRef,
        mode: Cascade,
    ) -> Result<()> {
        for assoc in &meta.associations {
            let Some(value) = owner.read_untracked(|e| e.get_association(assoc.name)) else {
                continue;
            };
            let targets: Vec<EntityRef> = value
                .refs()
                .into_iter()
                .filter(|target| mode == Cascade::Persist || !self.deletions.contains(target))
                .collect();
            for target in targets {
                self.persist_one(ctx, &target)?;
                match assoc.kind {
                    AssociationKind::ToOneOwning => {
                        copy_foreign_key(ctx, meta, owner, assoc, &target)?;
                    }
                    AssociationKind::ToOneInverse | AssociationKind::ToManyInverse => {
                        link_back(ctx, &target, assoc, owner)?;
                    }
                    AssociationKind::ToManyOwning => {
                        copy_owner_key(ctx, owner, assoc, &target)?;
                        link_back(ctx, &target, assoc, owner)?;
                    }
                    AssociationKind::ManyToMany => {
                        if let (Cascade::Persist, Some(junction)) = (mode, assoc.junction) {
                            let key = JunctionKey::new(junction, owner, assoc.name);
                            self.junctions.schedule_insert(key, target);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Schedule `entity` for deletion. An entity that was never written is
    /// simply forgotten.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(unit = %self.id, entity = entity.entity_type())
    )]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        if !self.contains(entity) {
            return Err(Error::not_managed(entity.entity_type()));
        }
        self.junctions.forget_owner(entity);
        self.junctions.forget_element(entity);
        self.updates.shift_remove(entity);
        if self.insertions.shift_remove(entity) {
            self.identity.lock().forget(entity);
            self.tracker.remove(entity);
            tracing::debug!("Dropped pending insertion");
            return Ok(());
        }
        self.deletions.insert(entity.clone());
        tracing::debug!("Scheduled for deletion");
        Ok(())
    }

    /// Stop managing `entity`. Returns whether it was known to this unit.
    pub fn detach(&mut self, entity: &EntityRef) -> bool {
        let registered = self.identity.lock().forget(entity).is_some();
        let inserted = self.insertions.shift_remove(entity);
        let deleted = self.deletions.shift_remove(entity);
        self.updates.shift_remove(entity);
        self.tracker.remove(entity);
        self.junctions.forget_owner(entity);
        registered || inserted || deleted
    }

    /// Drop all managed state. Rolls back to this unit's savepoint first
    /// when it is still the innermost one.
    pub fn clear(&mut self, conn: &dyn Connection, savepoints: &mut SavepointStack) -> Result<()> {
        let rolled_back = self.savepoint.rollback(savepoints, conn, true);
        self.discard();
        tracing::debug!(unit = %self.id, "Unit of work cleared");
        rolled_back.map(|_| ())
    }

    /// Drop all managed state without touching the connection (the
    /// transaction it belonged to was rolled back).
    pub(crate) fn discard(&mut self) {
        self.identity.lock().clear();
        self.tracker.clear();
        self.insertions.clear();
        self.updates.clear();
        self.deletions.clear();
        self.junctions.clear();
    }

    pub(crate) fn mark_savepoint_released(&mut self) {
        self.savepoint.mark_released();
    }

    pub(crate) fn reset_savepoint(&mut self) {
        self.savepoint.reset();
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// The managed instance for `(entity_type, id)`, loading it when this
    /// unit has not seen it yet.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(unit = %self.id))]
    pub fn find(
        &mut self,
        ctx: &SessionContext,
        entity_type: &str,
        id: Value,
    ) -> Result<Option<EntityRef>> {
        let meta = ctx.metadata.get(entity_type)?;
        if id.is_null() {
            return Ok(None);
        }
        if let Some(found) = self.find_managed(ctx, meta.entity_type, &id) {
            if self.deletions.contains(&found) {
                return Ok(None);
            }
            return match found.initialize() {
                Ok(()) => Ok(Some(found)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            };
        }
        let Some(row) = fetch_by_id(&*ctx.connection, &meta, &ctx.types, &id)? else {
            tracing::debug!("No row");
            return Ok(None);
        };
        self.hydrate(ctx, &row, meta.entity_type, HydrationMode::Managed)
            .map(Some)
    }

    /// A handle for `(entity_type, id)` without touching the database: the
    /// managed instance, or a registered lazy proxy.
    pub fn get_reference(
        &mut self,
        ctx: &SessionContext,
        entity_type: &str,
        id: Value,
    ) -> Result<EntityRef> {
        let meta = ctx.metadata.get(entity_type)?;
        if id.is_null() {
            return Err(Error::entity(
                EntityErrorKind::MissingIdentifier,
                meta.entity_type,
                "a reference needs an identifier",
            ));
        }
        self.proxy_factory(ctx).reference(meta.entity_type, id)
    }

    /// Turn a row into an entity. In managed mode the identity map wins: an
    /// instance already managed for the row's identifier is returned as is,
    /// and an uninitialized proxy for it is initialized from the row.
    pub fn hydrate(
        &mut self,
        ctx: &SessionContext,
        row: &Row,
        declared: &str,
        mode: HydrationMode,
    ) -> Result<EntityRef> {
        let hydrator = Hydrator::new(&ctx.metadata, &ctx.types);
        if mode == HydrationMode::Detached {
            let factory = ProxyFactory::detached(ctx.clone());
            let built = hydrator.build(row, declared, &mut |target, id| factory.proxy(target, id))?;
            return Ok(EntityRef::from_box(built.entity));
        }

        let meta = hydrator.resolve_type(row, declared)?;
        let declared_type = ctx.metadata.get(declared)?.entity_type;
        let id = hydrator.identifier(&meta, row)?;
        if id.is_null() {
            return Err(Error::entity(
                EntityErrorKind::MissingIdentifier,
                meta.entity_type,
                "row carries no identifier value",
            ));
        }
        let lookup = |unit: &Self| {
            unit.find_managed(ctx, meta.entity_type, &id)
                .or_else(|| unit.identity.lock().find(declared_type, &id))
        };
        if let Some(found) = lookup(self).filter(EntityRef::is_initialized) {
            return Ok(found);
        }

        let factory = self.proxy_factory(ctx);
        let built = hydrator.build(row, meta.entity_type, &mut |target, target_id| {
            factory.reference(target, target_id)
        })?;
        // Building may have registered a proxy for this very row.
        match lookup(self) {
            Some(found) if found.is_initialized() => Ok(found),
            Some(proxy) => {
                let baseline = ObjectSnapshot::capture_detached(
                    built.entity.as_ref(),
                    &built.metadata,
                    &ctx.metadata,
                )?;
                proxy.initialize_with(LoadedEntity::new(built.entity));
                self.tracker.insert(&proxy, baseline);
                tracing::trace!(entity = built.metadata.entity_type, "Initialized proxy from row");
                Ok(proxy)
            }
            None => {
                let entity = EntityRef::from_box(built.entity);
                self.identity
                    .lock()
                    .register(built.metadata.entity_type, built.id, entity.clone())?;
                self.tracker.snapshot(&entity, &built.metadata, &ctx.metadata)?;
                Ok(entity)
            }
        }
    }

    /// Reload `entity` from its row, discarding unflushed changes.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(unit = %self.id, entity = entity.entity_type())
    )]
    pub fn refresh(&mut self, ctx: &SessionContext, entity: &EntityRef) -> Result<()> {
        if !self.contains(entity) {
            return Err(Error::not_managed(entity.entity_type()));
        }
        let meta = ctx.metadata.get(entity.entity_type())?;
        let id = meta.id_of(entity);
        let row = if id.is_null() {
            None
        } else {
            fetch_by_id(&*ctx.connection, &meta, &ctx.types, &id)?
        };
        let Some(row) = row else {
            return Err(Error::not_found(meta.entity_type, id));
        };

        let hydrator = Hydrator::new(&ctx.metadata, &ctx.types);
        let factory = self.proxy_factory(ctx);
        let mut resolve = |target, target_id| factory.reference(target, target_id);
        if entity.is_initialized() {
            hydrator.populate(entity, &row, &mut resolve)?;
        } else {
            let built = hydrator.build(&row, meta.entity_type, &mut resolve)?;
            entity.initialize_with(LoadedEntity::new(built.entity));
        }
        self.updates.shift_remove(entity);
        self.tracker.snapshot(entity, &meta, &ctx.metadata)
    }

    /// Copy a detached entity's state onto the managed instance with the
    /// same identifier, loading it if needed. Without such an instance the
    /// entity itself is persisted.
    pub fn merge(&mut self, ctx: &SessionContext, entity: &EntityRef) -> Result<EntityRef> {
        if self.contains(entity) {
            return Ok(entity.clone());
        }
        let meta = ctx.metadata.get(entity.entity_type())?;
        let id = meta.id_of(entity);
        let managed = if id.is_null() {
            None
        } else {
            self.find(ctx, meta.entity_type, id)?
        };
        let Some(managed) = managed else {
            self.persist(ctx, entity)?;
            return Ok(entity.clone());
        };

        let (fields, associations) = entity.read_untracked(|e| {
            let fields: Vec<_> = meta
                .fields
                .iter()
                .filter_map(|f| e.get_field(f.name).map(|v| (f.name, v)))
                .collect();
            let associations: Vec<_> = meta
                .associations
                .iter()
                .filter_map(|a| {
                    e.get_association(a.name)
                        .filter(Association::is_loaded)
                        .map(|v| (a.name, v))
                })
                .collect();
            (fields, associations)
        });
        managed.initialize()?;
        managed.write_untracked(|e| {
            for (name, value) in fields {
                e.set_field(name, value)?;
            }
            for (name, association) in associations {
                e.set_association(name, association)?;
            }
            Ok::<(), Error>(())
        })?;
        tracing::debug!(entity = meta.entity_type, "Merged detached state");
        Ok(managed)
    }

    /// Load a collection association of a managed entity and set it on the
    /// entity. Members resolve through the identity map.
    #[tracing::instrument(level = "debug", skip(self, ctx, owner), fields(unit = %self.id))]
    pub fn load_collection(
        &mut self,
        ctx: &SessionContext,
        owner: &EntityRef,
        field: &str,
    ) -> Result<Vec<EntityRef>> {
        if !self.contains(owner) {
            return Err(Error::not_managed(owner.entity_type()));
        }
        let meta = ctx.metadata.get(owner.entity_type())?;
        let assoc = meta
            .association_named(field)
            .ok_or_else(|| unknown_field(meta.entity_type, field))?;
        let target = ctx.metadata.get(assoc.target)?;
        let owner_id = meta.id_of(owner);
        if owner_id.is_null() {
            return Err(Error::entity(
                EntityErrorKind::MissingIdentifier,
                meta.entity_type,
                format!("cannot load '{field}' before the owner has an identifier"),
            ));
        }
        let owner_key = storage_id(ctx, &meta, owner_id)?;
        let mapped_by = || assoc.inverse.and_then(|inverse| target.association_named(inverse));
        let unmapped = || {
            Error::mapping(
                meta.entity_type,
                format!("'{field}' has no column to load it by"),
            )
        };

        let conn = &*ctx.connection;
        let rows = match assoc.kind {
            AssociationKind::ToManyOwning => {
                let column = assoc.join_column.ok_or_else(unmapped)?;
                fetch_by_column(conn, &target, column, owner_key)?
            }
            AssociationKind::ToManyInverse => {
                let column = mapped_by()
                    .and_then(|back| back.join_column)
                    .ok_or_else(unmapped)?;
                fetch_by_column(conn, &target, column, owner_key)?
            }
            AssociationKind::ManyToMany => {
                let junction = match assoc.junction {
                    Some(junction) => junction,
                    None => mapped_by()
                        .and_then(|back| back.junction)
                        .map(|junction| junction.flipped())
                        .ok_or_else(unmapped)?,
                };
                fetch_linked(conn, &target, &junction, owner_key)?
            }
            AssociationKind::ToOneOwning | AssociationKind::ToOneInverse => {
                return Err(Error::mapping(
                    meta.entity_type,
                    format!("'{field}' is not a collection"),
                ));
            }
        };

        let members = rows
            .iter()
            .map(|row| self.hydrate(ctx, row, target.entity_type, HydrationMode::Managed))
            .collect::<Result<Vec<_>>>()?;
        owner.set_association(assoc.name, Association::Many(members.clone()))?;
        if assoc.writes_junction() {
            self.tracker.set_collection(owner, assoc.name, members.clone());
        }
        tracing::debug!(members = members.len(), "Loaded collection");
        Ok(members)
    }

    // ========================================================================
    // Change computation
    // ========================================================================

    /// Cascade over every managed entity, diff owning collections and
    /// recompute the set of dirty entities.
    fn compute_changes(&mut self, ctx: &SessionContext) -> Result<()> {
        for entity in self.managed_handles() {
            if !entity.is_initialized() {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            self.cascade(ctx, &meta, &entity, Cascade::Flush)?;
        }
        self.junctions = self.junction_changes(ctx)?;
        self.updates.clear();
        for entity in self.managed_handles() {
            if self.insertions.contains(&entity) {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            if self.tracker.is_dirty(&entity, &meta, &ctx.metadata)? {
                self.updates.insert(entity);
            }
        }
        Ok(())
    }

    /// Link rows to write, rebuilt from each owner's snapshot against its
    /// current collections.
    fn junction_changes(&self, ctx: &SessionContext) -> Result<JunctionChangeSet> {
        let mut changes = JunctionChangeSet::new();
        for entity in self.managed_handles() {
            if !entity.is_initialized() {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            self.diff_junctions(&meta, &entity, &mut changes);
        }
        Ok(changes)
    }

    fn diff_junctions(
        &self,
        meta: &EntityMetadata,
        owner: &EntityRef,
        changes: &mut JunctionChangeSet,
    ) {
        for assoc in meta.associations.iter().filter(|a| a.writes_junction()) {
            let Some(junction) = assoc.junction else {
                continue;
            };
            let Some(Association::Many(current)) =
                owner.read_untracked(|e| e.get_association(assoc.name))
            else {
                continue;
            };
            let baseline = self
                .tracker
                .get(owner)
                .map(|snapshot| snapshot.collection(assoc.name).to_vec())
                .unwrap_or_default();
            let key = JunctionKey::new(junction, owner, assoc.name);
            for element in &current {
                if !baseline.contains(element) && !self.deletions.contains(element) {
                    changes.schedule_insert(key.clone(), element.clone());
                }
            }
            for element in baseline {
                if !current.contains(&element) {
                    changes.schedule_delete(key.clone(), element);
                }
            }
        }
    }

    /// Pending work as the next flush would see it.
    pub fn pending_counts(&mut self, ctx: &SessionContext) -> Result<PendingCounts> {
        let junctions = self.junction_changes(ctx)?;
        let mut updates = 0;
        for entity in self.managed_handles() {
            if !entity.is_initialized() {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            if !self.insertions.contains(&entity)
                && self.tracker.is_dirty(&entity, &meta, &ctx.metadata)?
            {
                updates += 1;
            }
        }
        Ok(PendingCounts {
            insertions: self.insertions.len(),
            updates,
            deletions: self.deletions.len(),
            junction_inserts: junctions.insert_count(),
            junction_deletes: junctions.delete_count(),
        })
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change. Requires an open transaction.
    #[tracing::instrument(level = "info", skip_all, fields(unit = %self.id))]
    pub fn flush(
        &mut self,
        ctx: &SessionContext,
        savepoints: &mut SavepointStack,
        config: &EntityManagerConfig,
    ) -> Result<FlushResult> {
        let conn = &*ctx.connection;
        if !conn.in_transaction() {
            return Err(Error::transaction(
                TransactionErrorKind::NoActiveTransaction,
                "flush requires an active transaction",
            ));
        }
        self.compute_changes(ctx)?;
        if !self.has_pending_writes() {
            tracing::debug!("Nothing to flush");
            return Ok(FlushResult::new());
        }
        if config.use_savepoints && conn.supports_savepoints() {
            self.savepoint
                .ensure(savepoints, conn, &config.savepoint_prefix, self.id)?;
        }

        let started = Instant::now();
        let mut generated = Vec::new();
        match self.write_pending(ctx, &mut generated) {
            Ok(written) => {
                let result = written.result;
                self.finish(ctx, written)?;
                tracing::info!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    junction_inserted = result.junction_inserted,
                    junction_deleted = result.junction_deleted,
                    elapsed = ?started.elapsed(),
                    "Flush complete"
                );
                Ok(result)
            }
            Err(error) => {
                tracing::error!(%error, "Flush failed");
                if let Err(revert_error) = self.revert_generated(ctx, &generated) {
                    tracing::warn!(%revert_error, "Failed to revert generated identifiers");
                }
                match self.savepoint.rollback(savepoints, conn, false) {
                    Ok(true) => {
                        tracing::info!(
                            savepoint = ?self.savepoint.name(),
                            "Rolled back to unit savepoint"
                        );
                    }
                    Ok(false) => {}
                    Err(rollback_error) => {
                        tracing::warn!(%rollback_error, "Failed to roll back unit savepoint");
                    }
                }
                Err(error)
            }
        }
    }

    /// Run every pending statement. Entities that received a database
    /// generated identifier are pushed onto `generated` as they are written.
    fn write_pending(
        &mut self,
        ctx: &SessionContext,
        generated: &mut Vec<EntityRef>,
    ) -> Result<Written> {
        let conn = &*ctx.connection;
        let mut written = Written::default();

        // Deletes: dependents first.
        for entity in self.dependency_order(ctx, &self.deletions)?.delete_order() {
            let meta = ctx.metadata.get(entity.entity_type())?;
            let id = storage_id(ctx, &meta, meta.id_of(&entity))?;
            for assoc in meta.associations.iter().filter(|a| a.writes_junction()) {
                if let Some(junction) = assoc.junction {
                    LinkTableOp::UnlinkAll {
                        table: junction.table,
                        local_column: junction.owning_column,
                        local_value: id.clone(),
                    }
                    .execute(conn)?;
                }
            }
            PendingOp::Delete {
                table: meta.table,
                id_column: meta.id_column(),
                id,
            }
            .execute(conn)?;
            written.result.deleted += 1;
            written.deleted.push(entity);
        }

        // Inserts: dependencies first.
        for entity in self.dependency_order(ctx, &self.insertions)?.insert_order() {
            let meta = ctx.metadata.get(entity.entity_type())?;
            refresh_foreign_keys(ctx, &meta, &entity)?;
            self.insert_op(ctx, &meta, &entity)?.execute(conn)?;
            if meta.id_of(&entity).is_null() {
                let raw = conn
                    .last_insert_id()
                    .map_err(|e| Error::write(WriteOperation::Insert, meta.table, e))?;
                let id = ctx.types.from_storage(&meta.identifier().sql_type, raw)?;
                let id_field = meta.identifier().name;
                entity.write_untracked(|e| e.set_field(id_field, id.clone()))?;
                tracing::debug!(entity = meta.entity_type, id = ?id, "Read generated identifier");
                self.identity
                    .lock()
                    .register(meta.entity_type, id, entity.clone())?;
                generated.push(entity.clone());
            }
            propagate_owner_key(ctx, &meta, &entity)?;
            written.result.inserted += 1;
            written.touched.insert(entity);
        }

        // Updates: foreign keys may have just become known.
        for entity in self.managed_handles() {
            if self.insertions.contains(&entity) || !entity.is_initialized() {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            refresh_foreign_keys(ctx, &meta, &entity)?;
            let Some(changes) = self.tracker.changes(&entity, &meta, &ctx.metadata)? else {
                continue;
            };
            if !changes.needs_update() {
                continue;
            }
            update_op(ctx, &meta, &entity, &changes)?.execute(conn)?;
            written.result.updated += 1;
            written.touched.insert(entity);
        }

        // Junction rows: unlink, then link.
        let mut unlinks = Vec::new();
        let mut links = Vec::new();
        for (key, changes) in self.junctions.iter() {
            let owner_meta = ctx.metadata.get(key.owner.entity_type())?;
            let owner_id = required_id(ctx, &owner_meta, &key.owner)?;
            for element in &changes.deletes {
                unlinks.push(LinkTableOp::Unlink {
                    table: key.junction.table,
                    local_column: key.junction.owning_column,
                    local_value: owner_id.clone(),
                    remote_column: key.junction.inverse_column,
                    remote_value: element_id(ctx, element)?,
                });
            }
            for element in &changes.inserts {
                links.push(LinkTableOp::Link {
                    table: key.junction.table,
                    local_column: key.junction.owning_column,
                    local_value: owner_id.clone(),
                    remote_column: key.junction.inverse_column,
                    remote_value: element_id(ctx, element)?,
                });
            }
            written.touched.insert(key.owner.clone());
        }
        for op in &unlinks {
            if op.execute(conn)? {
                written.result.junction_deleted += 1;
            }
        }
        for op in &links {
            if op.execute(conn)? {
                written.result.junction_inserted += 1;
            }
        }
        Ok(written)
    }

    /// Undo identifiers read back during a write pass that was rolled back,
    /// so a retry lets the database generate them again.
    fn revert_generated(&self, ctx: &SessionContext, generated: &[EntityRef]) -> Result<()> {
        for entity in generated {
            let meta = ctx.metadata.get(entity.entity_type())?;
            let id_field = meta.identifier().name;
            self.identity.lock().forget(entity);
            entity.write_untracked(|e| e.set_field(id_field, Value::Null))?;
            tracing::debug!(entity = meta.entity_type, "Reverted generated identifier");
        }
        Ok(())
    }

    /// Apply a successful write pass: forget deleted entities, re-snapshot
    /// written ones and clear the schedules.
    fn finish(&mut self, ctx: &SessionContext, written: Written) -> Result<()> {
        for entity in &written.deleted {
            self.identity.lock().forget(entity);
            self.tracker.remove(entity);
        }
        self.insertions.clear();
        self.updates.clear();
        self.deletions.clear();
        self.junctions.clear();
        for entity in &written.touched {
            if !self.contains(entity) {
                continue;
            }
            let meta = ctx.metadata.get(entity.entity_type())?;
            self.tracker.snapshot(entity, &meta, &ctx.metadata)?;
        }
        Ok(())
    }

    /// Order `entities` so that referenced rows come before the rows whose
    /// foreign keys point at them.
    fn dependency_order(
        &self,
        ctx: &SessionContext,
        entities: &IndexSet<EntityRef>,
    ) -> Result<FlushOrderer> {
        let mut orderer = FlushOrderer::new();
        for entity in entities {
            orderer.add(entity.clone());
        }
        for entity in entities {
            let meta = ctx.metadata.get(entity.entity_type())?;
            for assoc in &meta.associations {
                let edge = match assoc.kind {
                    AssociationKind::ToOneOwning | AssociationKind::ToManyOwning => assoc.kind,
                    _ => continue,
                };
                let Some(value) = entity.read_untracked(|e| e.get_association(assoc.name)) else {
                    continue;
                };
                for target in value.refs() {
                    if edge == AssociationKind::ToOneOwning {
                        orderer.depends_on(entity, &target);
                    } else {
                        orderer.depends_on(&target, entity);
                    }
                }
            }
        }
        Ok(orderer)
    }

    fn insert_op(
        &self,
        ctx: &SessionContext,
        meta: &EntityMetadata,
        entity: &EntityRef,
    ) -> Result<PendingOp> {
        let (values, references) = entity.read_untracked(|e| {
            let values: Vec<_> = meta
                .fields
                .iter()
                .map(|f| (f, e.get_field(f.name).unwrap_or(Value::Null)))
                .collect();
            let references: Vec<_> = meta
                .unmapped_join_columns()
                .map(|a| (a, e.get_association(a.name)))
                .collect();
            (values, references)
        });

        let mut columns = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len());
        for (field, value) in values {
            if field.identifier && value.is_null() && meta.id_strategy == IdStrategy::Database {
                continue;
            }
            columns.push(field.column);
            params.push(ctx.types.to_storage(&field.sql_type, value)?);
        }
        for (assoc, value) in references {
            let Some(column) = assoc.join_column else {
                continue;
            };
            let key = match value {
                Some(Association::One(Some(target))) => {
                    let key = reference_value(&target, assoc, &ctx.metadata)?;
                    foreign_key_storage(ctx, assoc, key)?
                }
                Some(Association::One(None)) => Value::Null,
                _ => continue,
            };
            columns.push(column);
            params.push(key);
        }
        if let Some(inheritance) = &meta.inheritance {
            if let Some(value) = &inheritance.discriminator_value {
                if !columns.contains(&inheritance.discriminator_column) {
                    columns.push(inheritance.discriminator_column);
                    params.push(value.clone());
                }
            }
        }
        Ok(PendingOp::Insert {
            table: meta.table,
            columns,
            values: params,
        })
    }
}

/// Give a new entity its identifier according to its strategy.
fn assign_identifier(meta: &EntityMetadata, entity: &EntityRef) -> Result<Value> {
    let id = meta.id_of(entity);
    if !id.is_null() {
        return Ok(id);
    }
    match meta.id_strategy {
        IdStrategy::Database => Ok(Value::Null),
        IdStrategy::TimeOrdered => {
            let field = meta.identifier();
            let id = match field.sql_type {
                SqlType::Text | SqlType::VarChar(_) => {
                    Value::Text(uuid::Uuid::now_v7().hyphenated().to_string())
                }
                _ => Value::new_time_ordered_uuid(),
            };
            entity.write_untracked(|e| e.set_field(field.name, id.clone()))?;
            tracing::trace!(entity = meta.entity_type, "Generated time-ordered identifier");
            Ok(id)
        }
        IdStrategy::Assigned => Err(Error::entity(
            EntityErrorKind::MissingIdentifier,
            meta.entity_type,
            format!(
                "{} uses assigned identifiers; set '{}' before persisting",
                meta.entity_type,
                meta.identifier().name
            ),
        )),
    }
}

fn set_if_changed(entity: &EntityRef, field: &'static str, value: Value) -> Result<()> {
    let current = entity.read_untracked(|e| e.get_field(field));
    if current.as_ref() == Some(&value) {
        return Ok(());
    }
    entity.write_untracked(|e| e.set_field(field, value))
}

/// Copy the key of an owning to-one target into the scalar field mapped to
/// the join column. A target without an identifier yet is skipped; the flush
/// copies again right before the insert.
fn copy_foreign_key(
    ctx: &SessionContext,
    meta: &EntityMetadata,
    owner: &EntityRef,
    assoc: &AssociationMapping,
    target: &EntityRef,
) -> Result<()> {
    let Some(field) = assoc.join_column.and_then(|column| meta.field_for_column(column)) else {
        return Ok(());
    };
    let value = reference_value(target, assoc, &ctx.metadata)?;
    if value.is_null() {
        return Ok(());
    }
    set_if_changed(owner, field.name, value)
}

/// Set the join column field of a `ToManyOwning` element to its owner's key.
fn copy_owner_key(
    ctx: &SessionContext,
    owner: &EntityRef,
    assoc: &AssociationMapping,
    element: &EntityRef,
) -> Result<()> {
    let Some(column) = assoc.join_column else {
        return Ok(());
    };
    if !element.is_initialized() {
        return Ok(());
    }
    let element_meta = ctx.metadata.get(element.entity_type())?;
    let Some(field) = element_meta.field_for_column(column) else {
        return Ok(());
    };
    let value = reference_value(owner, assoc, &ctx.metadata)?;
    if value.is_null() {
        return Ok(());
    }
    set_if_changed(element, field.name, value)
}

/// Point the to-one back-reference of `element` at `owner`.
fn link_back(
    ctx: &SessionContext,
    element: &EntityRef,
    assoc: &AssociationMapping,
    owner: &EntityRef,
) -> Result<()> {
    let Some(inverse) = assoc.inverse else {
        return Ok(());
    };
    if !element.is_initialized() {
        return Ok(());
    }
    let element_meta = ctx.metadata.get(element.entity_type())?;
    let Some(back) = element_meta.association_named(inverse) else {
        return Ok(());
    };
    if !back.kind.is_to_one() {
        return Ok(());
    }
    let current = element.read_untracked(|e| e.get_association(inverse));
    let linked = matches!(&current, Some(Association::One(Some(target))) if target == owner);
    if !linked {
        element.write_untracked(|e| e.set_association(inverse, Association::one(owner)))?;
    }
    if back.kind == AssociationKind::ToOneOwning {
        copy_foreign_key(ctx, &element_meta, element, back, owner)?;
    }
    Ok(())
}

fn refresh_foreign_keys(
    ctx: &SessionContext,
    meta: &EntityMetadata,
    entity: &EntityRef,
) -> Result<()> {
    for assoc in meta
        .associations
        .iter()
        .filter(|a| a.kind == AssociationKind::ToOneOwning)
    {
        if let Some(Association::One(Some(target))) =
            entity.read_untracked(|e| e.get_association(assoc.name))
        {
            copy_foreign_key(ctx, meta, entity, assoc, &target)?;
        }
    }
    Ok(())
}

/// After inserting `owner`, hand its identifier to `ToManyOwning` elements.
fn propagate_owner_key(
    ctx: &SessionContext,
    meta: &EntityMetadata,
    owner: &EntityRef,
) -> Result<()> {
    for assoc in meta
        .associations
        .iter()
        .filter(|a| a.kind == AssociationKind::ToManyOwning)
    {
        let Some(value) = owner.read_untracked(|e| e.get_association(assoc.name)) else {
            continue;
        };
        for element in value.refs() {
            copy_owner_key(ctx, owner, assoc, &element)?;
        }
    }
    Ok(())
}

fn update_op(
    ctx: &SessionContext,
    meta: &EntityMetadata,
    entity: &EntityRef,
    changes: &Changes,
) -> Result<PendingOp> {
    let mut set_columns = Vec::new();
    let mut set_values = Vec::new();
    for name in &changes.fields {
        let Some(field) = meta.field_named(name) else {
            continue;
        };
        let value = entity
            .read_untracked(|e| e.get_field(field.name))
            .unwrap_or(Value::Null);
        set_columns.push(field.column);
        set_values.push(ctx.types.to_storage(&field.sql_type, value)?);
    }
    for name in &changes.foreign_keys {
        let Some(assoc) = meta.association_named(name) else {
            continue;
        };
        let Some(column) = assoc.join_column else {
            continue;
        };
        let key = match entity.read_untracked(|e| e.get_association(assoc.name)) {
            Some(Association::One(Some(target))) => {
                foreign_key_storage(ctx, assoc, reference_value(&target, assoc, &ctx.metadata)?)?
            }
            _ => Value::Null,
        };
        set_columns.push(column);
        set_values.push(key);
    }
    Ok(PendingOp::Update {
        table: meta.table,
        id_column: meta.id_column(),
        id: storage_id(ctx, meta, meta.id_of(entity))?,
        set_columns,
        set_values,
    })
}

fn storage_id(ctx: &SessionContext, meta: &EntityMetadata, id: Value) -> Result<Value> {
    ctx.types.to_storage(&meta.identifier().sql_type, id)
}

fn required_id(ctx: &SessionContext, meta: &EntityMetadata, entity: &EntityRef) -> Result<Value> {
    let id = meta.id_of(entity);
    if id.is_null() {
        return Err(Error::entity(
            EntityErrorKind::MissingIdentifier,
            meta.entity_type,
            "junction rows need the identifiers of both sides",
        ));
    }
    storage_id(ctx, meta, id)
}

fn element_id(ctx: &SessionContext, element: &EntityRef) -> Result<Value> {
    let meta = ctx.metadata.get(element.entity_type())?;
    required_id(ctx, &meta, element)
}

/// Convert a foreign key to storage with the type of the column it points at.
fn foreign_key_storage(
    ctx: &SessionContext,
    assoc: &AssociationMapping,
    value: Value,
) -> Result<Value> {
    let target = ctx.metadata.get(assoc.target)?;
    let sql_type = assoc
        .referenced_column
        .and_then(|column| target.field_for_column(column))
        .map_or(&target.identifier().sql_type, |field| &field.sql_type);
    ctx.types.to_storage(sql_type, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlentity_core::{
        Entity, FieldMapping, JunctionTable, MetadataRegistry, TypeRegistry,
    };
    use sqlentity_testkit::RecordingConnection;
    use std::any::Any;

    #[derive(Debug, Default)]
    struct Author {
        id: Option<i64>,
        name: String,
    }

    #[derive(Debug, Default)]
    struct Book {
        id: i64,
        title: String,
        author_id: Option<i64>,
        author: Association,
        genres: Association,
    }

    #[derive(Debug, Default)]
    struct Genre {
        id: i64,
        label: String,
    }

    #[derive(Debug, Default)]
    struct Person {
        id: i64,
        name: String,
        partner_id: Option<i64>,
        partner: Association,
    }

    impl Entity for Author {
        fn entity_type(&self) -> &'static str {
            "Author"
        }

        fn get_field(&self, field: &str) -> Option<Value> {
            match field {
                "id" => Some(self.id.into()),
                "name" => Some(self.name.clone().into()),
                _ => None,
            }
        }

        fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "id" => self.id = value.try_into()?,
                "name" => self.name = value.try_into()?,
                _ => return Err(unknown_field("Author", field)),
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Entity for Book {
        fn entity_type(&self) -> &'static str {
            "Book"
        }

        fn get_field(&self, field: &str) -> Option<Value> {
            match field {
                "id" => Some(Value::BigInt(self.id)),
                "title" => Some(self.title.clone().into()),
                "author_id" => Some(self.author_id.into()),
                _ => None,
            }
        }

        fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "id" => self.id = value.try_into()?,
                "title" => self.title = value.try_into()?,
                "author_id" => self.author_id = value.try_into()?,
                _ => return Err(unknown_field("Book", field)),
            }
            Ok(())
        }

        fn get_association(&self, field: &str) -> Option<Association> {
            match field {
                "author" => Some(self.author.clone()),
                "genres" => Some(self.genres.clone()),
                _ => None,
            }
        }

        fn set_association(&mut self, field: &str, value: Association) -> Result<()> {
            match field {
                "author" => self.author = value,
                "genres" => self.genres = value,
                _ => return Err(unknown_field("Book", field)),
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Entity for Genre {
        fn entity_type(&self) -> &'static str {
            "Genre"
        }

        fn get_field(&self, field: &str) -> Option<Value> {
            match field {
                "id" => Some(Value::BigInt(self.id)),
                "label" => Some(self.label.clone().into()),
                _ => None,
            }
        }

        fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "id" => self.id = value.try_into()?,
                "label" => self.label = value.try_into()?,
                _ => return Err(unknown_field("Genre", field)),
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl Entity for Person {
        fn entity_type(&self) -> &'static str {
            "Person"
        }

        fn get_field(&self, field: &str) -> Option<Value> {
            match field {
                "id" => Some(Value::BigInt(self.id)),
                "name" => Some(self.name.clone().into()),
                "partner_id" => Some(self.partner_id.into()),
                _ => None,
            }
        }

        fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "id" => self.id = value.try_into()?,
                "name" => self.name = value.try_into()?,
                "partner_id" => self.partner_id = value.try_into()?,
                _ => return Err(unknown_field("Person", field)),
            }
            Ok(())
        }

        fn get_association(&self, field: &str) -> Option<Association> {
            match field {
                "partner" => Some(self.partner.clone()),
                _ => None,
            }
        }

        fn set_association(&mut self, field: &str, value: Association) -> Result<()> {
            match field {
                "partner" => self.partner = value,
                _ => return Err(unknown_field("Person", field)),
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    const BOOK_GENRES: JunctionTable = JunctionTable::new("book_genres", "book_id", "genre_id");

    fn context(conn: &RecordingConnection) -> SessionContext {
        let metadata = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Author", "authors", || Box::new(Author::default()))
                    .id_strategy(IdStrategy::Database)
                    .field(FieldMapping::id("id", SqlType::BigInt))
                    .field(FieldMapping::new("name", SqlType::Text)),
            )
            .and_then(|m| {
                m.with(
                    EntityMetadata::new("Book", "books", || Box::new(Book::default()))
                        .field(FieldMapping::id("id", SqlType::BigInt))
                        .field(FieldMapping::new("title", SqlType::Text))
                        .field(FieldMapping::new("author_id", SqlType::BigInt).nullable(true))
                        .association(AssociationMapping::to_one("author", "Author", "author_id"))
                        .association(AssociationMapping::many_to_many(
                            "genres",
                            "Genre",
                            BOOK_GENRES,
                        )),
                )
            })
            .and_then(|m| {
                m.with(
                    EntityMetadata::new("Genre", "genres", || Box::new(Genre::default()))
                        .field(FieldMapping::id("id", SqlType::BigInt))
                        .field(FieldMapping::new("label", SqlType::Text)),
                )
            })
            .and_then(|m| {
                m.with(
                    EntityMetadata::new("Person", "people", || Box::new(Person::default()))
                        .field(FieldMapping::id("id", SqlType::BigInt))
                        .field(FieldMapping::new("name", SqlType::Text))
                        .field(FieldMapping::new("partner_id", SqlType::BigInt).nullable(true))
                        .association(AssociationMapping::to_one(
                            "partner",
                            "Person",
                            "partner_id",
                        )),
                )
            })
            .unwrap();
        SessionContext::new(
            Arc::new(conn.clone()) as Arc<dyn Connection>,
            Arc::new(metadata),
            Arc::new(TypeRegistry::new()),
        )
    }

    fn book(id: i64, title: &str) -> EntityRef {
        EntityRef::new(Book {
            id,
            title: title.to_string(),
            ..Book::default()
        })
    }

    fn genre(id: i64, label: &str) -> EntityRef {
        EntityRef::new(Genre {
            id,
            label: label.to_string(),
        })
    }

    fn person(id: i64, name: &str) -> EntityRef {
        EntityRef::new(Person {
            id,
            name: name.to_string(),
            ..Person::default()
        })
    }

    fn flush(
        unit: &mut UnitOfWork,
        ctx: &SessionContext,
        stack: &mut SavepointStack,
    ) -> Result<FlushResult> {
        unit.flush(ctx, stack, &EntityManagerConfig::default())
    }

    #[test]
    fn test_flush_inserts_referenced_rows_first() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();

        let author = EntityRef::new(Author {
            id: None,
            name: "Le Guin".to_string(),
        });
        let novel = book(10, "The Dispossessed");
        novel
            .set_association("author", Association::one(&author))
            .unwrap();
        unit.persist(&ctx, &novel).unwrap();
        assert!(unit.contains(&author));

        conn.begin().unwrap();
        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 2);

        let writes = conn.writes();
        assert!(writes[0].starts_with("INSERT INTO \"authors\""));
        assert!(writes[1].starts_with("INSERT INTO \"books\""));
        assert_eq!(
            writes[1].params,
            vec![
                Value::BigInt(10),
                Value::from("The Dispossessed"),
                Value::BigInt(1)
            ]
        );
        assert_eq!(author.get("id").unwrap(), Value::BigInt(1));
        assert_eq!(
            unit.identity_map().lock().find("Author", &Value::BigInt(1)),
            Some(author)
        );
        assert_eq!(unit.savepoint_name(), Some("uow_1_1"));
    }

    #[test]
    fn test_second_flush_writes_only_changed_columns() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let novel = book(1, "Draft");
        unit.persist(&ctx, &novel).unwrap();
        flush(&mut unit, &ctx, &mut stack).unwrap();
        conn.clear_log();

        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());
        assert!(conn.writes().is_empty());

        novel.set("title", "Final").unwrap();
        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.updated, 1);
        let writes = conn.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].sql, "UPDATE \"books\" SET \"title\" = $1 WHERE \"id\" = $2");
        assert_eq!(writes[0].params, vec![Value::from("Final"), Value::BigInt(1)]);
    }

    #[test]
    fn test_second_instance_with_same_identifier_conflicts() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        unit.persist(&ctx, &book(2, "First")).unwrap();

        let err = unit.persist(&ctx, &book(2, "Second")).unwrap_err();
        assert_eq!(err.entity_kind(), Some(EntityErrorKind::IdentityConflict));
    }

    #[test]
    fn test_remove_unmanaged_is_rejected_without_sql() {
        let conn = RecordingConnection::new();
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let err = unit.remove(&book(3, "Stray")).unwrap_err();
        assert!(err.is_not_managed());
        assert!(conn.sql_log().is_empty());
    }

    #[test]
    fn test_removing_pending_insert_forgets_it() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        let novel = book(4, "Never written");
        unit.persist(&ctx, &novel).unwrap();
        unit.remove(&novel).unwrap();
        assert!(!unit.contains(&novel));

        conn.begin().unwrap();
        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());
        assert!(conn.writes().is_empty());
    }

    #[test]
    fn test_delete_unlinks_junction_rows_first() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();
        let novel = book(5, "Gone");
        unit.persist(&ctx, &novel).unwrap();
        flush(&mut unit, &ctx, &mut stack).unwrap();
        conn.clear_log();

        unit.remove(&novel).unwrap();
        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.deleted, 1);
        let writes = conn.writes();
        assert_eq!(
            writes[0].sql,
            "DELETE FROM \"book_genres\" WHERE \"book_id\" = $1"
        );
        assert_eq!(writes[1].sql, "DELETE FROM \"books\" WHERE \"id\" = $1");
        assert!(unit.identity_map().lock().is_empty());
    }

    #[test]
    fn test_collection_changes_become_junction_rows() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let fantasy = EntityRef::new(Genre {
            id: 1,
            label: "fantasy".to_string(),
        });
        let novel = book(6, "Earthsea");
        novel
            .set_association("genres", Association::many([fantasy.clone()]))
            .unwrap();
        unit.persist(&ctx, &novel).unwrap();
        assert_eq!(unit.pending_counts(&ctx).unwrap().junction_inserts, 1);

        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.junction_inserted, 1);

        conn.clear_log();
        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());

        novel
            .set_association("genres", Association::Many(Vec::new()))
            .unwrap();
        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.junction_deleted, 1);
        assert_eq!(
            conn.writes()[0].sql,
            "DELETE FROM \"book_genres\" WHERE \"book_id\" = $1 AND \"genre_id\" = $2"
        );
    }

    #[test]
    fn test_failed_flush_rolls_back_and_keeps_schedule() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let novel = book(7, "Unlucky");
        unit.persist(&ctx, &novel).unwrap();
        conn.fail_once("INSERT INTO \"books\"", "disk full");
        let err = flush(&mut unit, &ctx, &mut stack).unwrap_err();
        assert!(err.is_write_failure());
        assert_eq!(unit.savepoint_state(), SavepointState::RolledBack);
        assert!(unit.is_scheduled_for_insert(&novel));

        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(conn.live_writes().len(), 1);
    }

    #[test]
    fn test_flush_requires_transaction() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        let err = flush(&mut unit, &ctx, &mut stack).unwrap_err();
        assert_eq!(
            err.transaction_kind(),
            Some(TransactionErrorKind::NoActiveTransaction)
        );
    }

    #[test]
    fn test_hydrate_returns_managed_instance() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let row = Row::from_pairs([
            ("id", Value::BigInt(8)),
            ("title", Value::from("Tehanu")),
            ("author_id", Value::BigInt(2)),
        ]);
        let first = unit
            .hydrate(&ctx, &row, "Book", HydrationMode::Managed)
            .unwrap();
        let second = unit
            .hydrate(&ctx, &row, "Book", HydrationMode::Managed)
            .unwrap();
        assert_eq!(first, second);

        let author = first.association("author").unwrap().refs();
        assert!(author[0].is_proxy());
        assert!(unit.contains(&author[0]));

        let detached = unit
            .hydrate(&ctx, &row, "Book", HydrationMode::Detached)
            .unwrap();
        assert_ne!(detached, first);
        assert!(!unit.contains(&detached));
    }

    #[test]
    fn test_refresh_discards_unflushed_changes() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        conn.respond(
            "SELECT * FROM \"books\"",
            vec![Row::from_pairs([
                ("id", Value::BigInt(9)),
                ("title", Value::from("Stored")),
                ("author_id", Value::Null),
            ])],
        );
        let found = unit.find(&ctx, "Book", Value::BigInt(9)).unwrap().unwrap();
        found.set("title", "Edited").unwrap();
        assert_eq!(unit.pending_counts(&ctx).unwrap().updates, 1);

        unit.refresh(&ctx, &found).unwrap();
        assert_eq!(found.get("title").unwrap(), Value::from("Stored"));
        assert_eq!(unit.pending_counts(&ctx).unwrap().updates, 0);
    }
    #[test]
    fn test_collection_emptied_before_flush_writes_no_link() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let fantasy = genre(1, "fantasy");
        let novel = book(6, "Earthsea");
        novel
            .set_association("genres", Association::many([fantasy.clone()]))
            .unwrap();
        unit.persist(&ctx, &novel).unwrap();
        novel
            .set_association("genres", Association::Many(Vec::new()))
            .unwrap();
        assert_eq!(unit.pending_counts(&ctx).unwrap().junction_inserts, 0);

        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.junction_inserted, 0);
        assert!(
            conn.writes()
                .iter()
                .all(|w| !w.starts_with("INSERT INTO \"book_genres\""))
        );
        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());
    }

    #[test]
    fn test_pending_counts_does_not_keep_reverted_unlink() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let fantasy = genre(1, "fantasy");
        let novel = book(6, "Earthsea");
        novel
            .set_association("genres", Association::many([fantasy.clone()]))
            .unwrap();
        unit.persist(&ctx, &novel).unwrap();
        flush(&mut unit, &ctx, &mut stack).unwrap();
        conn.clear_log();

        novel
            .set_association("genres", Association::Many(Vec::new()))
            .unwrap();
        assert_eq!(unit.pending_counts(&ctx).unwrap().junction_deletes, 1);
        novel
            .set_association("genres", Association::many([fantasy.clone()]))
            .unwrap();
        assert!(unit.pending_counts(&ctx).unwrap().is_empty());

        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());
        assert!(conn.writes().is_empty());
    }

    #[test]
    fn test_failed_flush_reverts_generated_identifier() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let author = EntityRef::new(Author {
            id: None,
            name: "Ada".to_string(),
        });
        let novel = book(11, "Notes");
        novel
            .set_association("author", Association::one(&author))
            .unwrap();
        unit.persist(&ctx, &novel).unwrap();
        conn.fail_once("INSERT INTO \"books\"", "disk full");
        flush(&mut unit, &ctx, &mut stack).unwrap_err();

        assert_eq!(author.get("id").unwrap(), Value::Null);
        assert!(unit.contains(&author));
        assert!(unit.is_scheduled_for_insert(&author));
        assert!(conn.live_writes().is_empty());

        conn.clear_log();
        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 2);
        let writes = conn.writes();
        assert_eq!(writes[0].sql, "INSERT INTO \"authors\" (\"name\") VALUES ($1)");
        assert_eq!(writes[0].params, vec![Value::from("Ada")]);
        let id = author.get("id").unwrap();
        assert!(!id.is_null());
        assert_eq!(novel.get("author_id").unwrap(), id);
        assert_eq!(
            unit.identity_map().lock().find("Author", &id),
            Some(author)
        );
    }

    #[test]
    fn test_mutually_referencing_entities_insert_once() {
        let conn = RecordingConnection::new();
        let ctx = context(&conn);
        let mut unit = UnitOfWork::new(UnitOfWorkId(1));
        let mut stack = SavepointStack::new();
        conn.begin().unwrap();

        let ann = person(1, "Ann");
        let bob = person(2, "Bob");
        ann.set_association("partner", Association::one(&bob))
            .unwrap();
        bob.set_association("partner", Association::one(&ann))
            .unwrap();
        unit.persist(&ctx, &ann).unwrap();
        assert!(unit.contains(&bob));
        assert_eq!(unit.pending_counts(&ctx).unwrap().insertions, 2);

        let result = flush(&mut unit, &ctx, &mut stack).unwrap();
        assert_eq!(result.inserted, 2);
        let writes = conn.writes();
        assert_eq!(writes.len(), 2);
        // The cycle is broken at the edge that closes it: Ann waits on Bob.
        assert_eq!(
            writes[0].params,
            vec![Value::BigInt(2), Value::from("Bob"), Value::BigInt(1)]
        );
        assert_eq!(
            writes[1].params,
            vec![Value::BigInt(1), Value::from("Ann"), Value::BigInt(2)]
        );
        assert!(flush(&mut unit, &ctx, &mut stack).unwrap().is_empty());
    }
}
