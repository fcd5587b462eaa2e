//! Field and column mappings.

use crate::types::SqlType;

/// Mapping of one scalar entity field to a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Field name as exposed by the entity accessors
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is the identifier field
    pub identifier: bool,
}

impl FieldMapping {
    /// Create a field whose column shares its name.
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column: name,
            sql_type,
            nullable: false,
            identifier: false,
        }
    }

    /// Create the identifier field.
    pub const fn id(name: &'static str, sql_type: SqlType) -> Self {
        Self::new(name, sql_type).identifier(true)
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column = name;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn identifier(mut self, value: bool) -> Self {
        self.identifier = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_column_and_flags() {
        let field = FieldMapping::new("author_id", SqlType::Uuid)
            .column("author")
            .nullable(true);
        assert_eq!(field.name, "author_id");
        assert_eq!(field.column, "author");
        assert!(field.nullable);
        assert!(!field.identifier);

        let id = FieldMapping::id("id", SqlType::BigInt);
        assert!(id.identifier);
        assert_eq!(id.column, "id");
    }
}
