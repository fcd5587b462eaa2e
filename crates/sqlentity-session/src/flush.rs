//! Flush statements, junction-table operations and insert ordering.
//!
//! Writing pending changes happens in a fixed order:
//! - DELETE dependents first (reverse dependency order)
//! - INSERT dependencies first (topological order)
//! - UPDATE changed columns only
//! - junction rows: deletes, then exists-checked inserts

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use sqlentity_core::{Connection, EntityRef, Error, Result, Value, WriteOperation};
use std::collections::HashMap;

/// A pending write for one entity row.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    /// Update changed columns of an existing row.
    Update {
        table: &'static str,
        id_column: &'static str,
        id: Value,
        set_columns: Vec<&'static str>,
        set_values: Vec<Value>,
    },
    /// Delete an existing row.
    Delete {
        table: &'static str,
        id_column: &'static str,
        id: Value,
    },
}

impl PendingOp {
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub fn operation(&self) -> WriteOperation {
        match self {
            PendingOp::Insert { .. } => WriteOperation::Insert,
            PendingOp::Update { .. } => WriteOperation::Update,
            PendingOp::Delete { .. } => WriteOperation::Delete,
        }
    }

    /// Render the statement with the connection's quoting and placeholders.
    pub fn to_sql(&self, conn: &dyn Connection) -> (String, Vec<Value>) {
        match self {
            PendingOp::Insert {
                table,
                columns,
                values,
            } => {
                let table = conn.quote_identifier(table);
                if columns.is_empty() {
                    return (format!("INSERT INTO {table} DEFAULT VALUES"), Vec::new());
                }
                let col_list = columns
                    .iter()
                    .map(|c| conn.quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let placeholders = (1..=columns.len())
                    .map(|i| conn.placeholder(i))
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    format!("INSERT INTO {table} ({col_list}) VALUES ({placeholders})"),
                    values.clone(),
                )
            }
            PendingOp::Update {
                table,
                id_column,
                id,
                set_columns,
                set_values,
            } => {
                let set_clause = set_columns
                    .iter()
                    .enumerate()
                    .map(|(i, col)| {
                        format!("{} = {}", conn.quote_identifier(col), conn.placeholder(i + 1))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    conn.quote_identifier(table),
                    set_clause,
                    conn.quote_identifier(id_column),
                    conn.placeholder(set_columns.len() + 1)
                );
                let mut params = set_values.clone();
                params.push(id.clone());
                (sql, params)
            }
            PendingOp::Delete {
                table,
                id_column,
                id,
            } => (
                format!(
                    "DELETE FROM {} WHERE {} = {}",
                    conn.quote_identifier(table),
                    conn.quote_identifier(id_column),
                    conn.placeholder(1)
                ),
                vec![id.clone()],
            ),
        }
    }

    /// Execute, attributing any failure to this operation and table.
    #[tracing::instrument(level = "debug", skip_all, fields(table = self.table()))]
    pub fn execute(&self, conn: &dyn Connection) -> Result<u64> {
        let (sql, params) = self.to_sql(conn);
        tracing::debug!(
            operation = self.operation().as_str(),
            sql = %sql,
            params = params.len(),
            "Executing write"
        );
        conn.execute(&sql, &params)
            .map_err(|e| Error::write(self.operation(), self.table(), e))
    }
}

/// A pending junction-table operation (many-to-many rows).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTableOp {
    /// Insert a link row unless it already exists.
    Link {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    /// Delete one link row.
    Unlink {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
        remote_column: &'static str,
        remote_value: Value,
    },
    /// Delete every link row of one owner (the owner is being deleted).
    UnlinkAll {
        table: &'static str,
        local_column: &'static str,
        local_value: Value,
    },
}

impl LinkTableOp {
    pub fn table(&self) -> &'static str {
        match self {
            LinkTableOp::Link { table, .. }
            | LinkTableOp::Unlink { table, .. }
            | LinkTableOp::UnlinkAll { table, .. } => table,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    fn operation(&self) -> WriteOperation {
        if self.is_link() {
            WriteOperation::JunctionInsert
        } else {
            WriteOperation::JunctionDelete
        }
    }

    /// Execute this operation. Returns whether a row was written; linking a
    /// pair that is already present is a no-op.
    #[tracing::instrument(level = "debug", skip_all, fields(table = self.table()))]
    pub fn execute(&self, conn: &dyn Connection) -> Result<bool> {
        self.run(conn)
            .map_err(|e| Error::write(self.operation(), self.table(), e))
    }

    fn run(&self, conn: &dyn Connection) -> Result<bool> {
        let q = |ident: &str| conn.quote_identifier(ident);
        match self {
            LinkTableOp::Link {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => {
                let params = [local_value.clone(), remote_value.clone()];
                let exists_sql = format!(
                    "SELECT 1 FROM {} WHERE {} = {} AND {} = {}",
                    q(table),
                    q(local_column),
                    conn.placeholder(1),
                    q(remote_column),
                    conn.placeholder(2)
                );
                if conn.query_one(&exists_sql, &params)?.is_some() {
                    tracing::trace!("Link row already present");
                    return Ok(false);
                }
                let sql = format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                    q(table),
                    q(local_column),
                    q(remote_column),
                    conn.placeholder(1),
                    conn.placeholder(2)
                );
                tracing::trace!(sql = %sql, "Executing link INSERT");
                conn.execute(&sql, &params).map(|_| true)
            }
            LinkTableOp::Unlink {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {} AND {} = {}",
                    q(table),
                    q(local_column),
                    conn.placeholder(1),
                    q(remote_column),
                    conn.placeholder(2)
                );
                tracing::trace!(sql = %sql, "Executing link DELETE");
                conn.execute(&sql, &[local_value.clone(), remote_value.clone()])
                    .map(|affected| affected > 0)
            }
            LinkTableOp::UnlinkAll {
                table,
                local_column,
                local_value,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    q(table),
                    q(local_column),
                    conn.placeholder(1)
                );
                tracing::trace!(sql = %sql, "Executing owner link DELETE");
                conn.execute(&sql, std::slice::from_ref(local_value))
                    .map(|affected| affected > 0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Orders entities so that every entity comes after the entities it
/// depends on.
///
/// Only dependencies between entities added to the orderer count. The sort
/// is a depth-first post-order starting from each entity in the order it was
/// added; a dependency cycle is broken at the edge that closes it, so cycle
/// participants come out in the order the traversal finishes them.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    nodes: IndexSet<EntityRef>,
    dependencies: HashMap<EntityRef, Vec<EntityRef>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entity: EntityRef) {
        self.nodes.insert(entity);
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.nodes.contains(entity)
    }

    /// Record that `entity` must be written after `dependency`. Ignored
    /// unless both were added and they differ.
    pub fn depends_on(&mut self, entity: &EntityRef, dependency: &EntityRef) {
        if entity == dependency || !self.contains(entity) || !self.contains(dependency) {
            return;
        }
        let deps = self.dependencies.entry(entity.clone()).or_default();
        if !deps.contains(dependency) {
            deps.push(dependency.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependencies first.
    pub fn insert_order(&self) -> Vec<EntityRef> {
        let mut marks: HashMap<EntityRef, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            self.visit(node, &mut marks, &mut order);
        }
        order
    }

    /// Dependents first.
    pub fn delete_order(&self) -> Vec<EntityRef> {
        let mut order = self.insert_order();
        order.reverse();
        order
    }

    fn visit(
        &self,
        node: &EntityRef,
        marks: &mut HashMap<EntityRef, Mark>,
        order: &mut Vec<EntityRef>,
    ) {
        if marks.contains_key(node) {
            if marks.get(node) == Some(&Mark::Visiting) {
                tracing::debug!(
                    entity = node.entity_type(),
                    "Dependency cycle among pending writes"
                );
            }
            return;
        }
        marks.insert(node.clone(), Mark::Visiting);
        if let Some(deps) = self.dependencies.get(node) {
            for dep in deps {
                self.visit(dep, marks, order);
            }
        }
        marks.insert(node.clone(), Mark::Done);
        order.push(node.clone());
    }
}

/// Counts of rows written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub junction_inserted: usize,
    pub junction_deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows written.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.junction_inserted + self.junction_deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
