//! Savepoints for units of work sharing one ambient transaction.
//!
//! Every unit of work that flushes inside the transaction gets its own named
//! savepoint, created lazily the first time it has something to write. A
//! flush failure rolls back to that savepoint only, so work flushed by sibling
//! units stays in place.
//!
//! The connection keeps savepoints as a stack: rolling back to a savepoint
//! discards everything above it, and releasing one releases everything above
//! it. A unit therefore reuses its savepoint only while it is the top of the
//! stack; otherwise it opens a new generation above the sibling's.

use crate::UnitOfWorkId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlentity_core::error::TransactionErrorKind;
use sqlentity_core::{Connection, Error, Result};
use std::sync::OnceLock;

const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

fn name_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(NAME_PATTERN).ok()).as_ref()
}

/// Whether `name` can be used as a savepoint identifier.
pub fn is_valid_savepoint_name(name: &str) -> bool {
    name_regex().is_some_and(|re| re.is_match(name))
}

/// Lifecycle of one unit of work's savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SavepointState {
    #[default]
    None,
    Created,
    Released,
    RolledBack,
}

/// The savepoints currently open on the connection, innermost last.
#[derive(Debug, Default)]
pub struct SavepointStack {
    names: Vec<String>,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn top(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    pub fn is_top(&self, name: &str) -> bool {
        self.top() == Some(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|open| open == name)
    }

    /// Reject names that are malformed or already open.
    pub fn validate(&self, name: &str) -> Result<()> {
        if !is_valid_savepoint_name(name) {
            return Err(Error::transaction(
                TransactionErrorKind::InvalidSavepointName,
                format!("'{name}' is not a valid savepoint name"),
            ));
        }
        if self.contains(name) {
            return Err(Error::transaction(
                TransactionErrorKind::InvalidSavepointName,
                format!("savepoint '{name}' is already open"),
            ));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub fn push(&mut self, conn: &dyn Connection, name: &str) -> Result<()> {
        if !conn.supports_savepoints() {
            return Err(Error::transaction(
                TransactionErrorKind::SavepointUnsupported,
                "the connection does not support savepoints",
            ));
        }
        self.validate(name)?;
        conn.create_savepoint(name)?;
        self.names.push(name.to_string());
        tracing::debug!(depth = self.names.len(), "Savepoint created");
        Ok(())
    }

    /// Roll back to `name`. The savepoint itself stays open; everything
    /// above it is discarded.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub fn rollback_to(&mut self, conn: &dyn Connection, name: &str) -> Result<()> {
        let position = self.position(name)?;
        conn.rollback_to_savepoint(name)?;
        self.names.truncate(position + 1);
        Ok(())
    }

    /// Release `name` and everything above it.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub fn release(&mut self, conn: &dyn Connection, name: &str) -> Result<()> {
        let position = self.position(name)?;
        conn.release_savepoint(name)?;
        self.names.truncate(position);
        Ok(())
    }

    /// Release every open savepoint, innermost first. Failures are logged
    /// and skipped; returns how many releases failed.
    pub fn release_all(&mut self, conn: &dyn Connection) -> usize {
        let mut failed = 0;
        while let Some(name) = self.names.pop() {
            if let Err(error) = conn.release_savepoint(&name) {
                failed += 1;
                tracing::warn!(savepoint = %name, %error, "Failed to release savepoint");
            }
        }
        failed
    }

    /// Forget every savepoint without touching the connection (the
    /// transaction ended).
    pub fn clear(&mut self) {
        self.names.clear();
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .rposition(|open| open == name)
            .ok_or_else(|| {
                Error::transaction(
                    TransactionErrorKind::SavepointNotFound,
                    format!("savepoint '{name}' is not open"),
                )
            })
    }
}

/// One unit of work's savepoint.
#[derive(Debug, Default)]
pub struct UnitSavepoint {
    state: SavepointState,
    name: Option<String>,
    generation: u32,
}

impl UnitSavepoint {
    pub fn state(&self) -> SavepointState {
        self.state
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Make sure this unit has a savepoint on top of the stack. Returns
    /// whether one was created.
    pub fn ensure(
        &mut self,
        stack: &mut SavepointStack,
        conn: &dyn Connection,
        prefix: &str,
        unit: UnitOfWorkId,
    ) -> Result<bool> {
        if !conn.in_transaction() {
            return Ok(false);
        }
        if let Some(name) = &self.name {
            let usable = matches!(
                self.state,
                SavepointState::Created | SavepointState::RolledBack
            );
            if usable && stack.is_top(name) {
                self.state = SavepointState::Created;
                return Ok(false);
            }
        }
        let generation = self.generation + 1;
        let name = format!("{prefix}_{unit}_{generation}");
        stack.push(conn, &name)?;
        self.generation = generation;
        self.name = Some(name);
        self.state = SavepointState::Created;
        Ok(true)
    }

    /// Roll back to this unit's savepoint, if it is still open.
    ///
    /// With `only_if_top` the rollback is skipped when a sibling's savepoint
    /// sits above this one.
    pub fn rollback(
        &mut self,
        stack: &mut SavepointStack,
        conn: &dyn Connection,
        only_if_top: bool,
    ) -> Result<bool> {
        let Some(name) = self.name.as_deref() else {
            return Ok(false);
        };
        if self.state != SavepointState::Created || !stack.contains(name) {
            return Ok(false);
        }
        if only_if_top && !stack.is_top(name) {
            tracing::debug!(savepoint = name, "Savepoint is not on top; skipping rollback");
            return Ok(false);
        }
        stack.rollback_to(conn, name)?;
        self.state = SavepointState::RolledBack;
        Ok(true)
    }

    /// The transaction committed and released every savepoint.
    pub fn mark_released(&mut self) {
        if self.name.is_some() {
            self.state = SavepointState::Released;
        }
    }

    /// The transaction ended; the next flush starts over.
    pub fn reset(&mut self) {
        self.state = SavepointState::None;
        self.name = None;
    }
}
