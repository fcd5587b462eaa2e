//! Change tracking and dirty detection.
//!
//! When an entity becomes managed (and again after each successful write) the
//! tracker stores an [`ObjectSnapshot`]: a copy of every mapped field value,
//! the resolved foreign key of each owning to-one association whose join
//! column is not also a scalar field, and the members of each owning
//! many-to-many collection. Flush recomputes the same snapshot and compares
//! by value.

use sqlentity_core::{
    Association, AssociationMapping, Entity, EntityMetadata, EntityRef, Error,
    MetadataRegistry, Result, Value,
};
use std::collections::{BTreeMap, HashMap};

/// Copied state of one entity at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    fields: BTreeMap<&'static str, Value>,
    foreign_keys: BTreeMap<&'static str, Value>,
    collections: BTreeMap<&'static str, Vec<EntityRef>>,
}

/// Raw association handles read under the entity lock; resolved afterwards
/// so no two entity locks are held at once.
struct Extracted {
    fields: BTreeMap<&'static str, Value>,
    to_one: Vec<(&'static str, Option<EntityRef>)>,
    collections: BTreeMap<&'static str, Vec<EntityRef>>,
}

fn extract(entity: &dyn Entity, meta: &EntityMetadata) -> Extracted {
    let fields = meta
        .fields
        .iter()
        .map(|f| (f.name, entity.get_field(f.name).unwrap_or(Value::Null)))
        .collect();
    let to_one = meta
        .unmapped_join_columns()
        .filter_map(|assoc| match entity.get_association(assoc.name) {
            Some(Association::One(target)) => Some((assoc.name, target)),
            _ => None,
        })
        .collect();
    let collections = meta
        .associations
        .iter()
        .filter(|assoc| assoc.writes_junction())
        .filter_map(|assoc| match entity.get_association(assoc.name) {
            Some(Association::Many(members)) => Some((assoc.name, members)),
            _ => None,
        })
        .collect();
    Extracted {
        fields,
        to_one,
        collections,
    }
}

impl Extracted {
    fn resolve(self, meta: &EntityMetadata, registry: &MetadataRegistry) -> Result<ObjectSnapshot> {
        let mut foreign_keys = BTreeMap::new();
        for (name, target) in self.to_one {
            let value = match (&target, meta.association_named(name)) {
                (Some(target), Some(assoc)) => reference_value(target, assoc, registry)?,
                _ => Value::Null,
            };
            foreign_keys.insert(name, value);
        }
        Ok(ObjectSnapshot {
            fields: self.fields,
            foreign_keys,
            collections: self.collections,
        })
    }
}

/// The value an owning association writes into its join column: the
/// target's identifier, or the field mapped to `referenced_column`.
pub(crate) fn reference_value(
    target: &EntityRef,
    assoc: &AssociationMapping,
    registry: &MetadataRegistry,
) -> Result<Value> {
    let target_meta = registry.get(target.entity_type())?;
    match assoc.referenced_column {
        Some(column) if column != target_meta.id_column() => {
            let field = target_meta.field_for_column(column).ok_or_else(|| {
                Error::mapping(
                    target_meta.entity_type,
                    format!("no field maps referenced column '{column}'"),
                )
            })?;
            target.get(field.name)
        }
        _ => Ok(target_meta.id_of(target)),
    }
}

impl ObjectSnapshot {
    /// Snapshot a managed handle without initializing it.
    pub fn capture(
        entity: &EntityRef,
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
    ) -> Result<Self> {
        entity
            .read_untracked(|e| extract(e, meta))
            .resolve(meta, registry)
    }

    /// Snapshot an entity that is not behind a handle yet (proxy loads).
    pub fn capture_detached(
        entity: &dyn Entity,
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
    ) -> Result<Self> {
        extract(entity, meta).resolve(meta, registry)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn foreign_key(&self, association: &str) -> Option<&Value> {
        self.foreign_keys.get(association)
    }

    /// Members of an owning many-to-many collection at snapshot time.
    pub fn collection(&self, association: &str) -> &[EntityRef] {
        self.collections
            .get(association)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Compare against a fresh snapshot of the same entity. The identifier
    /// field is never reported.
    pub fn diff(&self, current: &ObjectSnapshot, meta: &EntityMetadata) -> Changes {
        let id_field = meta.identifier().name;
        let fields = current
            .fields
            .iter()
            .filter(|(name, value)| **name != id_field && self.fields.get(*name) != Some(*value))
            .map(|(name, _)| *name)
            .collect();
        let foreign_keys = current
            .foreign_keys
            .iter()
            .filter(|(name, value)| self.foreign_keys.get(*name) != Some(*value))
            .map(|(name, _)| *name)
            .collect();
        let collections = current
            .collections
            .iter()
            .filter(|(name, members)| self.collection(name) != members.as_slice())
            .map(|(name, _)| *name)
            .collect();
        Changes {
            fields,
            foreign_keys,
            collections,
        }
    }
}

/// What changed between a snapshot and the current state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Changed scalar fields (by field name)
    pub fields: Vec<&'static str>,
    /// Owning to-one associations whose resolved foreign key changed
    pub foreign_keys: Vec<&'static str>,
    /// Owning many-to-many collections whose membership changed
    pub collections: Vec<&'static str>,
}

impl Changes {
    /// Whether the entity's own row needs an UPDATE.
    pub fn needs_update(&self) -> bool {
        !self.fields.is_empty() || !self.foreign_keys.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.needs_update() && self.collections.is_empty()
    }
}

/// Per-unit-of-work snapshot store, keyed by handle identity.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityRef, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take (or retake) the snapshot of `entity`.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = meta.entity_type))]
    pub fn snapshot(
        &mut self,
        entity: &EntityRef,
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
    ) -> Result<()> {
        let snapshot = ObjectSnapshot::capture(entity, meta, registry)?;
        tracing::trace!(
            fields = snapshot.fields.len(),
            foreign_keys = snapshot.foreign_keys.len(),
            "Taking object snapshot"
        );
        self.snapshots.insert(entity.clone(), snapshot);
        Ok(())
    }

    pub fn insert(&mut self, entity: &EntityRef, snapshot: ObjectSnapshot) {
        self.snapshots.insert(entity.clone(), snapshot);
    }

    pub fn get(&self, entity: &EntityRef) -> Option<&ObjectSnapshot> {
        self.snapshots.get(entity)
    }

    pub fn remove(&mut self, entity: &EntityRef) -> Option<ObjectSnapshot> {
        self.snapshots.remove(entity)
    }

    /// Record the members a collection was loaded with, so loading it does
    /// not read as a change. No-op for entities without a snapshot.
    pub fn set_collection(
        &mut self,
        entity: &EntityRef,
        association: &'static str,
        members: Vec<EntityRef>,
    ) {
        if let Some(snapshot) = self.snapshots.get_mut(entity) {
            snapshot.collections.insert(association, members);
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Compute what changed on `entity` since its snapshot.
    ///
    /// Returns `None` when there is nothing to compare against: an
    /// uninitialized proxy, or an entity seen for the first time. A proxy
    /// initialized since the last check adopts the baseline its loader
    /// captured; without one it is snapshotted as it is now.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = meta.entity_type))]
    pub fn changes(
        &mut self,
        entity: &EntityRef,
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
    ) -> Result<Option<Changes>> {
        if !entity.is_initialized() {
            return Ok(None);
        }
        if !self.snapshots.contains_key(entity) {
            if !entity.is_proxy() {
                return Ok(None);
            }
            let baseline = entity
                .take_loaded_baseline()
                .and_then(|b| b.downcast::<ObjectSnapshot>().ok());
            match baseline {
                Some(baseline) => {
                    tracing::trace!("Adopting proxy load baseline");
                    self.snapshots.insert(entity.clone(), *baseline);
                }
                None => {
                    self.snapshot(entity, meta, registry)?;
                    return Ok(None);
                }
            }
        }
        let current = ObjectSnapshot::capture(entity, meta, registry)?;
        let changes = self
            .snapshots
            .get(entity)
            .map(|snapshot| snapshot.diff(&current, meta))
            .unwrap_or_default();
        tracing::trace!(dirty = changes.needs_update(), "Dirty check result");
        Ok(Some(changes))
    }

    /// Shorthand for "needs an UPDATE".
    pub fn is_dirty(
        &mut self,
        entity: &EntityRef,
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
    ) -> Result<bool> {
        Ok(self
            .changes(entity, meta, registry)?
            .is_some_and(|changes| changes.needs_update()))
    }
}
