//! Turning rows into entities.
//!
//! The [`Hydrator`] is stateless: it resolves the concrete type from the
//! discriminator column, fills scalar fields through the type registry and
//! turns owning foreign keys into references through a caller-supplied
//! resolver. Registering the result (managed mode) is the unit of work's job.

use sqlentity_core::{
    Association, AssociationKind, Connection, Entity, EntityMetadata, EntityRef, JunctionTable,
    MetadataRegistry, Result, Row, TypeRegistry, Value,
};
use std::sync::Arc;

/// Whether hydrated entities are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HydrationMode {
    /// Register in the identity map and snapshot for dirty-checking.
    #[default]
    Managed,
    /// Build a plain instance nobody tracks.
    Detached,
}

/// Resolves `(entity type, identifier)` to a handle: an already-managed
/// instance or a fresh proxy.
pub type ReferenceResolver<'r> = dyn FnMut(&'static str, Value) -> Result<EntityRef> + 'r;

/// An entity built from a row, not yet behind a handle.
pub struct Hydrated {
    pub metadata: Arc<EntityMetadata>,
    pub id: Value,
    pub entity: Box<dyn Entity>,
}

pub struct Hydrator<'a> {
    metadata: &'a MetadataRegistry,
    types: &'a TypeRegistry,
}

impl<'a> Hydrator<'a> {
    pub fn new(metadata: &'a MetadataRegistry, types: &'a TypeRegistry) -> Self {
        Self { metadata, types }
    }

    /// Metadata of the concrete type a row describes: the subtype named by
    /// the discriminator, or `declared` when there is no match.
    pub fn resolve_type(&self, row: &Row, declared: &str) -> Result<Arc<EntityMetadata>> {
        let declared_meta = self.metadata.get(declared)?;
        match declared_meta.resolve_subtype(row) {
            Some(concrete) if concrete != declared_meta.entity_type => {
                tracing::trace!(declared, concrete, "Resolved subtype from discriminator");
                self.metadata.get(concrete)
            }
            _ => Ok(declared_meta),
        }
    }

    /// Raw row value for a field: the field name wins over the column name.
    fn raw<'r>(row: &'r Row, name: &str, column: &str) -> Option<&'r Value> {
        row.get_by_name(name).or_else(|| row.get_by_name(column))
    }

    /// The identifier a row carries for `meta`, converted from storage.
    pub fn identifier(&self, meta: &EntityMetadata, row: &Row) -> Result<Value> {
        let id = meta.identifier();
        match Self::raw(row, id.name, id.column) {
            Some(raw) => self.types.from_storage(&id.sql_type, raw.clone()),
            None => Ok(Value::Null),
        }
    }

    fn field_values(
        &self,
        meta: &EntityMetadata,
        row: &Row,
    ) -> Result<Vec<(&'static str, Value)>> {
        let mut values = Vec::with_capacity(meta.fields.len());
        for field in &meta.fields {
            if let Some(raw) = Self::raw(row, field.name, field.column) {
                values.push((field.name, self.types.from_storage(&field.sql_type, raw.clone())?));
            }
        }
        Ok(values)
    }

    /// Owning to-one associations present in the row. A null key becomes
    /// `One(None)`; references through a non-identifier column stay unloaded.
    fn association_values(
        &self,
        meta: &EntityMetadata,
        row: &Row,
        resolve: &mut ReferenceResolver<'_>,
    ) -> Result<Vec<(&'static str, Association)>> {
        let mut values = Vec::new();
        for assoc in &meta.associations {
            if assoc.kind != AssociationKind::ToOneOwning {
                continue;
            }
            let Some(raw) = assoc.join_column.and_then(|column| row.get_by_name(column)) else {
                continue;
            };
            if raw.is_null() {
                values.push((assoc.name, Association::One(None)));
                continue;
            }
            let target = self.metadata.get(assoc.target)?;
            if assoc
                .referenced_column
                .is_some_and(|column| column != target.id_column())
            {
                continue;
            }
            let id = self
                .types
                .from_storage(&target.identifier().sql_type, raw.clone())?;
            values.push((assoc.name, Association::One(Some(resolve(assoc.target, id)?))));
        }
        Ok(values)
    }

    /// Build a fresh instance of the row's concrete type.
    pub fn build(
        &self,
        row: &Row,
        declared: &str,
        resolve: &mut ReferenceResolver<'_>,
    ) -> Result<Hydrated> {
        let meta = self.resolve_type(row, declared)?;
        let mut entity = meta.instantiate();
        for (name, value) in self.field_values(&meta, row)? {
            entity.set_field(name, value)?;
        }
        for (name, association) in self.association_values(&meta, row, resolve)? {
            entity.set_association(name, association)?;
        }
        let id = entity
            .get_field(meta.identifier().name)
            .unwrap_or(Value::Null);
        Ok(Hydrated {
            metadata: meta,
            id,
            entity,
        })
    }

    /// Overwrite an existing handle's mapped state from a row.
    pub fn populate(
        &self,
        existing: &EntityRef,
        row: &Row,
        resolve: &mut ReferenceResolver<'_>,
    ) -> Result<()> {
        let meta = self.metadata.get(existing.entity_type())?;
        let fields = self.field_values(&meta, row)?;
        // Resolve references before taking the write lock.
        let associations = self.association_values(&meta, row, resolve)?;
        existing.write_untracked(|entity| {
            for (name, value) in fields {
                entity.set_field(name, value)?;
            }
            for (name, association) in associations {
                entity.set_association(name, association)?;
            }
            Ok(())
        })
    }
}

/// `SELECT * FROM <table> WHERE <id> = $1`.
pub(crate) fn fetch_by_id(
    conn: &dyn Connection,
    meta: &EntityMetadata,
    types: &TypeRegistry,
    id: &Value,
) -> Result<Option<Row>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {}",
        conn.quote_identifier(meta.table),
        conn.quote_identifier(meta.id_column()),
        conn.placeholder(1)
    );
    let param = types.to_storage(&meta.identifier().sql_type, id.clone())?;
    tracing::debug!(entity = meta.entity_type, sql = %sql, "Loading by identifier");
    conn.query_one(&sql, &[param])
}

/// Every row of `meta`'s table whose `column` equals `value`.
pub(crate) fn fetch_by_column(
    conn: &dyn Connection,
    meta: &EntityMetadata,
    column: &str,
    value: Value,
) -> Result<Vec<Row>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} = {}",
        conn.quote_identifier(meta.table),
        conn.quote_identifier(column),
        conn.placeholder(1)
    );
    tracing::debug!(entity = meta.entity_type, sql = %sql, "Loading collection");
    conn.query(&sql, &[value])
}

/// Target rows linked to one owner through a junction table.
pub(crate) fn fetch_linked(
    conn: &dyn Connection,
    target: &EntityMetadata,
    junction: &JunctionTable,
    owner_id: Value,
) -> Result<Vec<Row>> {
    let target_table = conn.quote_identifier(target.table);
    let junction_table = conn.quote_identifier(junction.table);
    let sql = format!(
        "SELECT {target_table}.* FROM {target_table} INNER JOIN {junction_table} ON {junction_table}.{} = {target_table}.{} WHERE {junction_table}.{} = {}",
        conn.quote_identifier(junction.inverse_column),
        conn.quote_identifier(target.id_column()),
        conn.quote_identifier(junction.owning_column),
        conn.placeholder(1)
    );
    tracing::debug!(entity = target.entity_type, sql = %sql, "Loading linked collection");
    conn.query(&sql, &[owner_id])
}
