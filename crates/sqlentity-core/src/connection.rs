//! Database connection trait and the driver registry.

use crate::error::ConfigError;
use crate::row::Row;
use crate::{Error, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A database connection the persistence engine drives.
///
/// The engine is synchronous: every call blocks until the backend answers.
/// Methods take `&self`; implementations keep their session state behind
/// interior mutability so one connection can be shared by every unit of work
/// of an entity manager and by lazy-proxy loaders.
///
/// Parameters are positional and referenced in SQL as `$1`, `$2`, ... (see
/// [`placeholder`](Connection::placeholder)).
///
/// # Savepoints
///
/// ```rust,ignore
/// conn.begin()?;
/// conn.execute("INSERT INTO t1 (a) VALUES ($1)", &[Value::Int(1)])?;
/// conn.create_savepoint("sp1")?;
/// conn.execute("INSERT INTO t1 (a) VALUES ($1)", &[Value::Int(2)])?;
/// conn.rollback_to_savepoint("sp1")?; // only the second insert is discarded
/// conn.commit()?;
/// ```
pub trait Connection: Send + Sync {
    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Quote a table or column name.
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    fn supports_savepoints(&self) -> bool {
        true
    }

    fn create_savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT {}", self.quote_identifier(name)), &[])
            .map(|_| ())
    }

    fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute(
            &format!("RELEASE SAVEPOINT {}", self.quote_identifier(name)),
            &[],
        )
        .map(|_| ())
    }

    fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute(
            &format!("ROLLBACK TO SAVEPOINT {}", self.quote_identifier(name)),
            &[],
        )
        .map(|_| ())
    }

    /// Key generated by the most recent INSERT on this connection.
    fn last_insert_id(&self) -> Result<Value>;
}

macro_rules! forward_connection {
    ($($wrapper:ident),*) => {$(
        impl<C: Connection + ?Sized> Connection for $wrapper<C> {
            fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
                (**self).execute(sql, params)
            }

            fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
                (**self).query(sql, params)
            }

            fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
                (**self).query_one(sql, params)
            }

            fn quote_identifier(&self, ident: &str) -> String {
                (**self).quote_identifier(ident)
            }

            fn placeholder(&self, index: usize) -> String {
                (**self).placeholder(index)
            }

            fn begin(&self) -> Result<()> {
                (**self).begin()
            }

            fn commit(&self) -> Result<()> {
                (**self).commit()
            }

            fn rollback(&self) -> Result<()> {
                (**self).rollback()
            }

            fn in_transaction(&self) -> bool {
                (**self).in_transaction()
            }

            fn supports_savepoints(&self) -> bool {
                (**self).supports_savepoints()
            }

            fn create_savepoint(&self, name: &str) -> Result<()> {
                (**self).create_savepoint(name)
            }

            fn release_savepoint(&self, name: &str) -> Result<()> {
                (**self).release_savepoint(name)
            }

            fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
                (**self).rollback_to_savepoint(name)
            }

            fn last_insert_id(&self) -> Result<Value> {
                (**self).last_insert_id()
            }
        }
    )*};
}

forward_connection!(Arc, Box);

/// Connection configuration handed to a driver factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Full connection URL (`driver://...`)
    pub url: String,
    /// Driver name parsed from the URL scheme
    pub driver: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name reported to the server, if supported
    pub application_name: Option<String>,
}

impl ConnectionConfig {
    /// Parse the driver name from `url`'s scheme.
    pub fn parse(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let Some((driver, rest)) = url.split_once("://") else {
            return Err(config_error(format!(
                "connection URL '{url}' has no driver scheme"
            )));
        };
        if driver.is_empty() || rest.is_empty() {
            return Err(config_error(format!("malformed connection URL '{url}'")));
        }
        Ok(Self {
            driver: driver.to_ascii_lowercase(),
            url,
            connect_timeout_ms: 30_000,
            application_name: None,
        })
    }

    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

/// Builds a connection for a parsed configuration.
pub type DriverFactory =
    Arc<dyn Fn(&ConnectionConfig) -> Result<Box<dyn Connection>> + Send + Sync>;

/// Maps driver names to connection constructors.
///
/// The registry is an ordinary value built at application start-up and
/// passed to whatever opens connections; there is no process-wide table.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverFactory>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_names())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ConnectionConfig) -> Result<Box<dyn Connection>> + Send + Sync + 'static,
    {
        let name = name.into().to_ascii_lowercase();
        tracing::debug!(driver = %name, "Registered connection driver");
        self.drivers.insert(name, Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered driver names, sorted.
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a connection for `url` with the driver named by its scheme.
    pub fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        self.connect_with(&ConnectionConfig::parse(url)?)
    }

    pub fn connect_with(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let factory = self.drivers.get(&config.driver).ok_or_else(|| {
            config_error(format!(
                "no driver registered for '{}' (known: {})",
                config.driver,
                self.driver_names().join(", ")
            ))
        })?;
        tracing::debug!(driver = %config.driver, "Opening connection");
        factory(config)
    }
}
