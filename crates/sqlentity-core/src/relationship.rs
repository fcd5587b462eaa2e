//! Association metadata.
//!
//! Associations are declared per entity type as plain values (see
//! [`EntityMetadata`](crate::EntityMetadata)). The session layer reads them to
//! cascade persistence, propagate foreign keys, order inserts, and keep
//! junction tables in sync.

/// The kind of association a field represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// Many-to-one or owning one-to-one: the foreign key column lives on this
    /// entity's table (`Post.author`).
    ToOneOwning,
    /// Inverse one-to-one: the foreign key lives on the target's table and is
    /// written through the target's owning side.
    ToOneInverse,
    /// One-to-many where the collection owns the foreign key column on the
    /// element table (no owning to-one on the element is required).
    ToManyOwning,
    /// One-to-many mapped by an owning to-one on the element
    /// (`Author.posts` mapped by `Post.author`).
    ToManyInverse,
    /// Many-to-many through a junction table. Only the side that declares the
    /// junction writes junction rows.
    ManyToMany,
}

impl AssociationKind {
    pub const fn is_to_one(&self) -> bool {
        matches!(self, AssociationKind::ToOneOwning | AssociationKind::ToOneInverse)
    }

    pub const fn is_collection(&self) -> bool {
        !self.is_to_one()
    }
}

/// A junction (link) table backing a many-to-many association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JunctionTable {
    /// The junction table name (e.g., `"post_tags"`).
    pub table: &'static str,
    /// Column pointing at the declaring (owning) entity (e.g., `"post_id"`).
    pub owning_column: &'static str,
    /// Column pointing at the target entity (e.g., `"tag_id"`).
    pub inverse_column: &'static str,
}

impl JunctionTable {
    pub const fn new(
        table: &'static str,
        owning_column: &'static str,
        inverse_column: &'static str,
    ) -> Self {
        Self {
            table,
            owning_column,
            inverse_column,
        }
    }

    /// The same table seen from the other side of the association.
    pub const fn flipped(&self) -> Self {
        Self {
            table: self.table,
            owning_column: self.inverse_column,
            inverse_column: self.owning_column,
        }
    }
}

/// Mapping of one association field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationMapping {
    /// Field name as exposed by the entity's association accessors
    pub name: &'static str,
    pub kind: AssociationKind,
    /// Target entity type name
    pub target: &'static str,
    /// Foreign key column. For `ToOneOwning` it lives on this entity's table,
    /// for `ToManyOwning` on the element table.
    pub join_column: Option<&'static str>,
    /// Column on the referenced table the foreign key points at. `None` means
    /// the referenced entity's identifier column.
    pub referenced_column: Option<&'static str>,
    /// Name of the association field on the target pointing back here.
    pub inverse: Option<&'static str>,
    pub nullable: bool,
    pub junction: Option<JunctionTable>,
}

impl AssociationMapping {
    const fn base(name: &'static str, kind: AssociationKind, target: &'static str) -> Self {
        Self {
            name,
            kind,
            target,
            join_column: None,
            referenced_column: None,
            inverse: None,
            nullable: true,
            junction: None,
        }
    }

    /// Owning to-one association with its foreign key column.
    pub const fn to_one(
        name: &'static str,
        target: &'static str,
        join_column: &'static str,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ToOneOwning, target);
        mapping.join_column = Some(join_column);
        mapping
    }

    /// Inverse to-one association mapped by `mapped_by` on the target.
    pub const fn to_one_inverse(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ToOneInverse, target);
        mapping.inverse = Some(mapped_by);
        mapping
    }

    /// One-to-many mapped by the owning to-one `mapped_by` on the element.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ToManyInverse, target);
        mapping.inverse = Some(mapped_by);
        mapping
    }

    /// One-to-many owning the element table's `join_column`.
    pub const fn to_many_owning(
        name: &'static str,
        target: &'static str,
        join_column: &'static str,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ToManyOwning, target);
        mapping.join_column = Some(join_column);
        mapping
    }

    /// Owning side of a many-to-many association.
    pub const fn many_to_many(
        name: &'static str,
        target: &'static str,
        junction: JunctionTable,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ManyToMany, target);
        mapping.junction = Some(junction);
        mapping
    }

    /// Inverse side of a many-to-many association, mapped by the owning
    /// collection `mapped_by` on the target.
    pub const fn many_to_many_inverse(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        let mut mapping = Self::base(name, AssociationKind::ManyToMany, target);
        mapping.inverse = Some(mapped_by);
        mapping
    }

    /// Set the inverse (back-reference) field on the target.
    pub const fn inverse(mut self, field: &'static str) -> Self {
        self.inverse = Some(field);
        self
    }

    pub const fn referenced_column(mut self, column: &'static str) -> Self {
        self.referenced_column = Some(column);
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Whether flushing this side writes a foreign key column of this
    /// entity's own row.
    pub const fn writes_own_column(&self) -> bool {
        matches!(self.kind, AssociationKind::ToOneOwning) && self.join_column.is_some()
    }

    /// Whether flushing this side writes junction rows.
    pub const fn writes_junction(&self) -> bool {
        matches!(self.kind, AssociationKind::ManyToMany) && self.junction.is_some()
    }
}
