//! Entity metadata and the metadata registry.
//!
//! Metadata is hand-declared per entity type and registered in a
//! [`MetadataRegistry`] at start-up:
//!
//! ```ignore
//! let mut registry = MetadataRegistry::new();
//! registry.register(
//!     EntityMetadata::new("Post", "posts", || Box::new(Post::default()))
//!         .id_strategy(IdStrategy::TimeOrdered)
//!         .field(FieldMapping::id("id", SqlType::Uuid))
//!         .field(FieldMapping::new("title", SqlType::Text))
//!         .association(AssociationMapping::to_one("author", "Author", "author_id")),
//! )?;
//! ```

use crate::entity::{Entity, EntityRef};
use crate::field::FieldMapping;
use crate::relationship::{AssociationKind, AssociationMapping};
use crate::row::Row;
use crate::{Error, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How an entity's identifier is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// The application sets the identifier before `persist`.
    #[default]
    Assigned,
    /// A time-ordered (v7) UUID is generated on first persist when the
    /// identifier is unset.
    TimeOrdered,
    /// The database generates the key; it is read back through
    /// `last_insert_id` after the INSERT.
    Database,
}

/// Single-table inheritance: the discriminator column and the value to type
/// map of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct InheritanceMapping {
    pub discriminator_column: &'static str,
    /// This type's own discriminator value, written on insert.
    pub discriminator_value: Option<Value>,
    /// Discriminator value to concrete entity type.
    pub subtypes: Vec<(Value, &'static str)>,
}

impl InheritanceMapping {
    pub fn new(discriminator_column: &'static str) -> Self {
        Self {
            discriminator_column,
            discriminator_value: None,
            subtypes: Vec::new(),
        }
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn subtype(mut self, value: impl Into<Value>, entity_type: &'static str) -> Self {
        self.subtypes.push((value.into(), entity_type));
        self
    }

    /// Concrete type for a discriminator value.
    pub fn resolve(&self, value: &Value) -> Option<&'static str> {
        self.subtypes
            .iter()
            .find(|(candidate, _)| candidate == value)
            .map(|(_, entity_type)| *entity_type)
    }
}

/// Everything the engine needs to know about one entity type.
#[derive(Clone)]
pub struct EntityMetadata {
    pub entity_type: &'static str,
    pub table: &'static str,
    pub id_strategy: IdStrategy,
    /// Scalar fields in column order
    pub fields: Vec<FieldMapping>,
    pub associations: Vec<AssociationMapping>,
    pub inheritance: Option<InheritanceMapping>,
    factory: fn() -> Box<dyn Entity>,
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("entity_type", &self.entity_type)
            .field("table", &self.table)
            .field("id_strategy", &self.id_strategy)
            .field("fields", &self.fields)
            .field("associations", &self.associations)
            .field("inheritance", &self.inheritance)
            .finish_non_exhaustive()
    }
}

impl EntityMetadata {
    /// `factory` returns a blank instance; the hydrator fills it from a row.
    pub fn new(
        entity_type: &'static str,
        table: &'static str,
        factory: fn() -> Box<dyn Entity>,
    ) -> Self {
        Self {
            entity_type,
            table,
            id_strategy: IdStrategy::Assigned,
            fields: Vec::new(),
            associations: Vec::new(),
            inheritance: None,
            factory,
        }
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    pub fn association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    pub fn inheritance(mut self, inheritance: InheritanceMapping) -> Self {
        self.inheritance = Some(inheritance);
        self
    }

    /// A blank instance of this type.
    pub fn instantiate(&self) -> Box<dyn Entity> {
        (self.factory)()
    }

    /// The identifier field. Registration guarantees there is exactly one.
    pub fn identifier(&self) -> &FieldMapping {
        self.fields
            .iter()
            .find(|f| f.identifier)
            .unwrap_or_else(|| &self.fields[0])
    }

    pub fn id_column(&self) -> &'static str {
        self.identifier().column
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_for_column(&self, column: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn association_named(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Owning to-one associations whose join column is not also mapped as a
    /// scalar field; their value is written straight from the association.
    pub fn unmapped_join_columns(&self) -> impl Iterator<Item = &AssociationMapping> {
        self.associations.iter().filter(|a| {
            a.writes_own_column()
                && a.join_column
                    .is_some_and(|column| self.field_for_column(column).is_none())
        })
    }

    /// Read the identifier of a handle without initializing a proxy.
    pub fn id_of(&self, entity: &EntityRef) -> Value {
        let field = self.identifier().name;
        entity
            .read_untracked(|e| e.get_field(field))
            .unwrap_or(Value::Null)
    }

    /// Concrete type named by a row's discriminator, if any.
    pub fn resolve_subtype(&self, row: &Row) -> Option<&'static str> {
        let inheritance = self.inheritance.as_ref()?;
        let value = row.get_by_name(inheritance.discriminator_column)?;
        inheritance.resolve(value)
    }
}

/// Queryable table of entity metadata keyed by entity type name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entries: HashMap<&'static str, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one entity type. Rejects duplicates and types without
    /// exactly one identifier field.
    pub fn register(&mut self, metadata: EntityMetadata) -> Result<()> {
        let identifiers = metadata.fields.iter().filter(|f| f.identifier).count();
        if identifiers != 1 {
            return Err(Error::mapping(
                metadata.entity_type,
                format!("expected exactly one identifier field, found {identifiers}"),
            ));
        }
        if self.entries.contains_key(metadata.entity_type) {
            return Err(Error::mapping(
                metadata.entity_type,
                "entity type registered twice",
            ));
        }
        tracing::debug!(
            entity = metadata.entity_type,
            table = metadata.table,
            fields = metadata.fields.len(),
            associations = metadata.associations.len(),
            "Registered entity metadata"
        );
        self.entries
            .insert(metadata.entity_type, Arc::new(metadata));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, metadata: EntityMetadata) -> Result<Self> {
        self.register(metadata)?;
        Ok(self)
    }

    pub fn get(&self, entity_type: &str) -> Result<Arc<EntityMetadata>> {
        self.entries
            .get(entity_type)
            .cloned()
            .ok_or_else(|| Error::mapping(entity_type, "no metadata registered for entity type"))
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.entries.contains_key(entity_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Concrete subtypes of `entity_type` (excluding itself) in declaration
    /// order.
    pub fn subtypes_of(&self, entity_type: &str) -> Vec<&'static str> {
        let Some(inheritance) = self
            .entries
            .get(entity_type)
            .and_then(|m| m.inheritance.as_ref())
        else {
            return Vec::new();
        };
        inheritance
            .subtypes
            .iter()
            .map(|(_, name)| *name)
            .filter(|name| *name != entity_type)
            .collect()
    }

    /// Check cross-type references: association targets, inverse fields,
    /// junction descriptors and subtypes must all resolve.
    pub fn validate(&self) -> Result<()> {
        for metadata in self.entries.values() {
            for assoc in &metadata.associations {
                let target = self.get(assoc.target).map_err(|_| {
                    Error::mapping(
                        metadata.entity_type,
                        format!(
                            "association '{}' targets unknown type {}",
                            assoc.name, assoc.target
                        ),
                    )
                })?;
                if let Some(inverse) = assoc.inverse {
                    if target.association_named(inverse).is_none() {
                        return Err(Error::mapping(
                            metadata.entity_type,
                            format!(
                                "association '{}' names missing inverse {}.{}",
                                assoc.name, assoc.target, inverse
                            ),
                        ));
                    }
                }
                let needs_join_column = matches!(
                    assoc.kind,
                    AssociationKind::ToOneOwning | AssociationKind::ToManyOwning
                );
                if needs_join_column && assoc.join_column.is_none() {
                    return Err(Error::mapping(
                        metadata.entity_type,
                        format!("association '{}' has no join column", assoc.name),
                    ));
                }
                if assoc.kind == AssociationKind::ToManyOwning {
                    let mapped = assoc
                        .join_column
                        .is_some_and(|column| target.field_for_column(column).is_some());
                    if !mapped {
                        return Err(Error::mapping(
                            metadata.entity_type,
                            format!(
                                "to-many '{}' join column must be a field of {}",
                                assoc.name, assoc.target
                            ),
                        ));
                    }
                }
                if assoc.kind == AssociationKind::ManyToMany
                    && assoc.junction.is_none()
                    && assoc.inverse.is_none()
                {
                    return Err(Error::mapping(
                        metadata.entity_type,
                        format!(
                            "many-to-many '{}' needs a junction table or a mapped-by side",
                            assoc.name
                        ),
                    ));
                }
            }
            if let Some(inheritance) = &metadata.inheritance {
                for (_, subtype) in &inheritance.subtypes {
                    self.get(subtype)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::unknown_field;
    use crate::types::SqlType;
    use std::any::Any;

    #[derive(Debug, Default)]
    struct Blank;

    impl Entity for Blank {
        fn entity_type(&self) -> &'static str {
            "Blank"
        }

        fn get_field(&self, field: &str) -> Option<Value> {
            (field == "id").then_some(Value::Null)
        }

        fn set_field(&mut self, field: &str, _value: Value) -> Result<()> {
            Err(unknown_field("Blank", field))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn blank() -> Box<dyn Entity> {
        Box::new(Blank)
    }

    #[test]
    fn test_register_requires_exactly_one_identifier() {
        let mut registry = MetadataRegistry::new();
        let none = EntityMetadata::new("Blank", "blanks", blank)
            .field(FieldMapping::new("name", SqlType::Text));
        assert!(matches!(registry.register(none), Err(Error::Mapping(_))));

        let two = EntityMetadata::new("Blank", "blanks", blank)
            .field(FieldMapping::id("id", SqlType::BigInt))
            .field(FieldMapping::id("other", SqlType::BigInt));
        assert!(registry.register(two).is_err());

        let ok = EntityMetadata::new("Blank", "blanks", blank)
            .field(FieldMapping::id("id", SqlType::BigInt).column("blank_id"));
        registry.register(ok).unwrap();
        let meta = registry.get("Blank").unwrap();
        assert_eq!(meta.id_column(), "blank_id");
        assert!(registry.get("Missing").is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_targets() {
        let registry = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Blank", "blanks", blank)
                    .field(FieldMapping::id("id", SqlType::BigInt))
                    .association(AssociationMapping::to_one("owner", "Owner", "owner_id")),
            )
            .unwrap();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_subtype_resolution_uses_discriminator() {
        let registry = MetadataRegistry::new()
            .with(
                EntityMetadata::new("Blank", "blanks", blank)
                    .field(FieldMapping::id("id", SqlType::BigInt))
                    .inheritance(
                        InheritanceMapping::new("kind")
                            .value("blank")
                            .subtype("blank", "Blank")
                            .subtype("special", "Special"),
                    ),
            )
            .unwrap()
            .with(
                EntityMetadata::new("Special", "blanks", blank)
                    .field(FieldMapping::id("id", SqlType::BigInt)),
            )
            .unwrap();
        registry.validate().unwrap();

        let meta = registry.get("Blank").unwrap();
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("kind", Value::from("special"))]);
        assert_eq!(meta.resolve_subtype(&row), Some("Special"));
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("kind", Value::from("other"))]);
        assert_eq!(meta.resolve_subtype(&row), None);
        assert_eq!(registry.subtypes_of("Blank"), vec!["Special"]);
    }
}
