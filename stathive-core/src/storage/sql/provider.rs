/*!
Connection providers for the relational backends.

A connection string picks its vendor by prefix. Every vendor is a
[`ConnectionProvider`]; the [`ProviderRegistry`] asks them in registration
order and hands back the first pool that could be created. Provider failures
are logged and reported as "no provider", never as panics.
*/

use crate::config::PoolTuning;
use crate::{Result, StoreError};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Executor};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Database vendor behind a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Postgres,
    Sqlite,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Postgres => "postgres",
            Vendor::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection pool plus the runtime that drives it
///
/// The relational backends are blocking; each pool owns a tokio runtime and
/// blocks on it per operation. Do not call into a `SqlPool` from inside
/// another runtime's async context.
#[derive(Debug)]
pub struct SqlPool {
    pool: AnyPool,
    vendor: Vendor,
    runtime: Runtime,
}

impl SqlPool {
    /// Open a pool and check that one connection can be established
    ///
    /// `session` statements run on every new physical connection.
    pub fn connect(vendor: Vendor, url: &str, tuning: &PoolTuning, session: Vec<String>) -> Result<Self> {
        tuning.validate()?;
        sqlx::any::install_default_drivers();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stathive-sql")
            .enable_all()
            .build()
            .map_err(|e| StoreError::configuration(format!("Failed to create async runtime: {e}")))?;

        let session = Arc::new(session);
        let options = AnyPoolOptions::new()
            .max_connections(tuning.max_connections)
            .min_connections(tuning.min_connections)
            .idle_timeout(tuning.idle_timeout)
            .acquire_timeout(tuning.acquire_timeout)
            .test_before_acquire(tuning.test_before_acquire)
            .after_connect(move |conn, _meta| {
                let session = Arc::clone(&session);
                Box::pin(async move {
                    for statement in session.iter() {
                        (&mut *conn).execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            });

        let pool = runtime
            .block_on(options.connect(url))
            .map_err(|e| StoreError::configuration(format!("Failed to connect to {vendor}: {e}")))?;

        info!(
            vendor = %vendor,
            max_connections = tuning.max_connections,
            "opened connection pool"
        );
        Ok(Self { pool, vendor, runtime })
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Drive a future to completion on the pool's runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Close every connection; later acquires fail
    pub fn close(&self) {
        if !self.pool.is_closed() {
            self.runtime.block_on(self.pool.close());
            debug!(vendor = %self.vendor, "closed connection pool");
        }
    }
}

impl Drop for SqlPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pluggable source of connection pools for one database vendor
pub trait ConnectionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider handles the connection string
    fn accepts(&self, init: &str) -> bool;

    /// Build a pool, or `None` when the database cannot be reached
    fn create(&self, init: &str, tuning: &PoolTuning) -> Option<SqlPool>;
}

fn redact(url: &str) -> String {
    // hide credentials between "://" and "@"
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// PostgreSQL via `postgres://`, `postgresql://` or `jdbc:postgresql://`
#[derive(Debug, Clone, Default)]
pub struct PostgresProvider;

impl PostgresProvider {
    const PREFIXES: [&'static str; 3] = ["postgres://", "postgresql://", "jdbc:postgresql://"];

    pub fn normalize(init: &str) -> String {
        init.trim().strip_prefix("jdbc:").unwrap_or(init.trim()).to_string()
    }

    pub fn session_statements(tuning: &PoolTuning) -> Vec<String> {
        vec![format!(
            "SET statement_timeout = {}",
            tuning.statement_timeout.as_millis()
        )]
    }
}

impl ConnectionProvider for PostgresProvider {
    fn name(&self) -> &str {
        "postgres"
    }

    fn accepts(&self, init: &str) -> bool {
        let init = init.trim();
        Self::PREFIXES.iter().any(|prefix| init.starts_with(prefix))
    }

    fn create(&self, init: &str, tuning: &PoolTuning) -> Option<SqlPool> {
        let url = Self::normalize(init);
        SqlPool::connect(Vendor::Postgres, &url, tuning, Self::session_statements(tuning))
            .map_err(|e| warn!(url = %redact(&url), error = %e, "postgres provider failed"))
            .ok()
    }
}

/// SQLite via `sqlite:` or `jdbc:sqlite:` URLs
#[derive(Debug, Clone, Default)]
pub struct SqliteProvider;

impl SqliteProvider {
    /// Strip `jdbc:` and default to `mode=rwc` so missing files are created
    pub fn normalize(init: &str) -> String {
        let url = init.trim().strip_prefix("jdbc:").unwrap_or(init.trim());
        match url.split_once('?') {
            Some((_, query)) if query.split('&').any(|p| p.starts_with("mode=")) => url.to_string(),
            Some(_) => format!("{url}&mode=rwc"),
            None => format!("{url}?mode=rwc"),
        }
    }

    pub fn session_statements(tuning: &PoolTuning) -> Vec<String> {
        vec![
            format!("PRAGMA busy_timeout = {}", tuning.statement_timeout.as_millis()),
            "PRAGMA foreign_keys = ON".to_string(),
            "PRAGMA journal_mode = WAL".to_string(),
        ]
    }
}

impl ConnectionProvider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn accepts(&self, init: &str) -> bool {
        let init = init.trim();
        init.starts_with("sqlite:") || init.starts_with("jdbc:sqlite:")
    }

    fn create(&self, init: &str, tuning: &PoolTuning) -> Option<SqlPool> {
        let url = Self::normalize(init);
        SqlPool::connect(Vendor::Sqlite, &url, tuning, Self::session_statements(tuning))
            .map_err(|e| warn!(url = %url, error = %e, "sqlite provider failed"))
            .ok()
    }
}

/// Ordered list of connection providers
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ConnectionProvider>>,
}

impl ProviderRegistry {
    /// Registry without any provider
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Append a provider; earlier registrations win
    pub fn register(&mut self, provider: impl ConnectionProvider + 'static) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// First pool produced by a provider accepting `init`
    pub fn resolve(&self, init: &str, tuning: &PoolTuning) -> Option<SqlPool> {
        let mut accepted = false;
        for provider in self.providers.iter().filter(|p| p.accepts(init)) {
            accepted = true;
            debug!(provider = provider.name(), "trying connection provider");
            if let Some(pool) = provider.create(init, tuning) {
                return Some(pool);
            }
        }
        if !accepted {
            warn!(init = %redact(init), "no connection provider accepts this connection string");
        }
        None
    }
}

impl Default for ProviderRegistry {
    /// Postgres and SQLite providers
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(PostgresProvider).register(SqliteProvider);
        registry
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
