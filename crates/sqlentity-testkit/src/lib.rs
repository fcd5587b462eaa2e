//! Test support for SQLEntity Rust.
//!
//! [`RecordingConnection`] is an in-memory [`Connection`] that records every
//! statement, simulates a transaction journal with savepoints, serves canned
//! query results and injects failures. It runs no SQL: tests assert on the
//! statement log and on which writes are still live in the journal.

use parking_lot::Mutex;
use sqlentity_core::{Connection, Error, QueryError, QueryErrorKind, Result, Row, Value};
use std::sync::Arc;

/// One statement sent to the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn is_write(&self) -> bool {
        let head = self.sql.trim_start();
        ["INSERT", "UPDATE", "DELETE"]
            .iter()
            .any(|kw| head.starts_with(kw))
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.sql.trim_start().starts_with(prefix)
    }
}

#[derive(Debug, Clone)]
enum JournalEntry {
    Savepoint(String),
    Write(Statement),
}

#[derive(Debug, Clone)]
struct CannedResponse {
    pattern: String,
    rows: Vec<Row>,
    once: bool,
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    message: String,
    once: bool,
}

#[derive(Debug)]
struct State {
    log: Vec<Statement>,
    journal: Vec<JournalEntry>,
    committed: Vec<Statement>,
    savepoints: Vec<String>,
    in_transaction: bool,
    savepoints_supported: bool,
    responses: Vec<CannedResponse>,
    failures: Vec<FailureRule>,
    next_insert_id: i64,
    last_insert_id: Value,
}

impl Default for State {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            journal: Vec::new(),
            committed: Vec::new(),
            savepoints: Vec::new(),
            in_transaction: false,
            savepoints_supported: true,
            responses: Vec::new(),
            failures: Vec::new(),
            next_insert_id: 1,
            last_insert_id: Value::Null,
        }
    }
}

impl State {
    fn check_failure(&mut self, sql: &str) -> Result<()> {
        let Some(index) = self
            .failures
            .iter()
            .position(|rule| sql.contains(&rule.pattern))
        else {
            return Ok(());
        };
        let rule = if self.failures[index].once {
            self.failures.remove(index)
        } else {
            self.failures[index].clone()
        };
        tracing::debug!(sql = %sql, "Injected failure");
        Err(Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some(sql.to_string()),
            message: rule.message,
            source: None,
        }))
    }

    fn record(&mut self, sql: &str, params: &[Value]) -> Statement {
        let statement = Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        self.log.push(statement.clone());
        statement
    }

    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp == name)
            .ok_or_else(|| query_error(format!("savepoint \"{name}\" does not exist")))
    }
}

fn query_error(message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: None,
        message,
        source: None,
    })
}

/// In-memory connection that records statements and simulates transactions.
///
/// Clones share state, so a test can hand one clone to an entity manager and
/// inspect another.
#[derive(Debug, Clone, Default)]
pub struct RecordingConnection {
    state: Arc<Mutex<State>>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection whose backend rejects savepoints.
    pub fn without_savepoints() -> Self {
        let conn = Self::new();
        conn.state.lock().savepoints_supported = false;
        conn
    }

    /// Answer every query whose SQL contains `pattern` with `rows`.
    pub fn respond(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.state.lock().responses.push(CannedResponse {
            pattern: pattern.into(),
            rows,
            once: false,
        });
    }

    /// Answer the next query whose SQL contains `pattern` with `rows`.
    /// One-shot responses take precedence over persistent ones.
    pub fn respond_once(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.state.lock().responses.insert(
            0,
            CannedResponse {
                pattern: pattern.into(),
                rows,
                once: true,
            },
        );
    }

    /// Fail every statement whose SQL contains `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state.lock().failures.push(FailureRule {
            pattern: pattern.into(),
            message: message.into(),
            once: false,
        });
    }

    /// Fail only the next statement whose SQL contains `pattern`.
    pub fn fail_once(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state.lock().failures.push(FailureRule {
            pattern: pattern.into(),
            message: message.into(),
            once: true,
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every statement sent, in order, including transaction control.
    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().log.clone()
    }

    pub fn sql_log(&self) -> Vec<String> {
        self.state.lock().log.iter().map(|s| s.sql.clone()).collect()
    }

    /// INSERT/UPDATE/DELETE statements sent, in order (including ones that
    /// were later rolled back or failed).
    pub fn writes(&self) -> Vec<Statement> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|s| s.is_write())
            .cloned()
            .collect()
    }

    /// Statements whose SQL starts with `prefix`.
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<Statement> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Writes in effect in the open transaction, after savepoint rollbacks.
    pub fn live_writes(&self) -> Vec<Statement> {
        self.state
            .lock()
            .journal
            .iter()
            .filter_map(|entry| match entry {
                JournalEntry::Write(statement) => Some(statement.clone()),
                JournalEntry::Savepoint(_) => None,
            })
            .collect()
    }

    /// Writes made durable by COMMIT (or executed outside a transaction).
    pub fn committed_writes(&self) -> Vec<Statement> {
        self.state.lock().committed.clone()
    }

    /// Names of the open savepoints, outermost first.
    pub fn open_savepoints(&self) -> Vec<String> {
        self.state.lock().savepoints.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl Connection for RecordingConnection {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut state = self.state.lock();
        let statement = state.record(sql, params);
        state.check_failure(sql)?;
        if statement.starts_with("INSERT") {
            let id = state.next_insert_id;
            state.next_insert_id += 1;
            state.last_insert_id = Value::BigInt(id);
        }
        if statement.is_write() {
            if state.in_transaction {
                state.journal.push(JournalEntry::Write(statement));
            } else {
                state.committed.push(statement);
            }
        }
        Ok(1)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.record(sql, params);
        state.check_failure(sql)?;
        let Some(index) = state
            .responses
            .iter()
            .position(|response| sql.contains(&response.pattern))
        else {
            return Ok(Vec::new());
        };
        if state.responses[index].once {
            Ok(state.responses.remove(index).rows)
        } else {
            Ok(state.responses[index].rows.clone())
        }
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.record("BEGIN", &[]);
        if state.in_transaction {
            return Err(query_error("a transaction is already in progress".to_string()));
        }
        state.in_transaction = true;
        state.journal.clear();
        state.savepoints.clear();
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.record("COMMIT", &[]);
        state.check_failure("COMMIT")?;
        if !state.in_transaction {
            return Err(query_error("no transaction is in progress".to_string()));
        }
        let journal = std::mem::take(&mut state.journal);
        state.committed.extend(journal.into_iter().filter_map(|entry| match entry {
            JournalEntry::Write(statement) => Some(statement),
            JournalEntry::Savepoint(_) => None,
        }));
        state.savepoints.clear();
        state.in_transaction = false;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.record("ROLLBACK", &[]);
        state.journal.clear();
        state.savepoints.clear();
        state.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    fn supports_savepoints(&self) -> bool {
        self.state.lock().savepoints_supported
    }

    fn create_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {}", self.quote_identifier(name));
        let mut state = self.state.lock();
        state.record(&sql, &[]);
        state.check_failure(&sql)?;
        if !state.savepoints_supported {
            return Err(query_error("savepoints are not supported".to_string()));
        }
        if !state.in_transaction {
            return Err(query_error(
                "SAVEPOINT can only be used in transaction blocks".to_string(),
            ));
        }
        state.savepoints.push(name.to_string());
        state.journal.push(JournalEntry::Savepoint(name.to_string()));
        Ok(())
    }

    fn release_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", self.quote_identifier(name));
        let mut state = self.state.lock();
        state.record(&sql, &[]);
        state.check_failure(&sql)?;
        let position = state.savepoint_position(name)?;
        let released: Vec<String> = state.savepoints.drain(position..).collect();
        state.journal.retain(|entry| match entry {
            JournalEntry::Savepoint(sp) => !released.contains(sp),
            JournalEntry::Write(_) => true,
        });
        Ok(())
    }

    fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {}", self.quote_identifier(name));
        let mut state = self.state.lock();
        state.record(&sql, &[]);
        state.check_failure(&sql)?;
        let position = state.savepoint_position(name)?;
        state.savepoints.truncate(position + 1);
        let marker = state
            .journal
            .iter()
            .rposition(|entry| matches!(entry, JournalEntry::Savepoint(sp) if sp == name))
            .ok_or_else(|| query_error(format!("savepoint \"{name}\" has no journal marker")))?;
        state.journal.truncate(marker + 1);
        Ok(())
    }

    fn last_insert_id(&self) -> Result<Value> {
        Ok(self.state.lock().last_insert_id.clone())
    }
}
