//! PostgreSQL store implementation.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use tracing::info;

use super::{LedgerTransaction, OutputRecord, TxStore};
use crate::config::DataSourceConfig;
use crate::error::{Error, Result};
use crate::execution::ExecutionKey;
use crate::isolation::IsolationLevel;

/// Ledger DDL, shared with the sqlx migrations.
const SCHEMA_SQL: &str = include_str!("../../migrations/20250101000000_transaction_outputs.sql");

/// SQLSTATE raised by `CREATE DATABASE` when the database already exists.
const DUPLICATE_DATABASE: &str = "42P04";

/// The transaction handed to step functions by a [`PgStore`].
///
/// Run queries against it with `&mut **guard` after locking the handle.
pub type PgTransaction = Transaction<'static, Postgres>;

/// PostgreSQL-backed store for production use.
///
/// Step outputs live in `ironstep.transaction_outputs`, keyed by
/// `(workflow_id, function_num)`. The primary key is what settles races:
/// when two attempts for the same step insert concurrently, the second insert
/// waits for the first transaction and fails with a unique violation once it
/// commits. That violation surfaces as [`Error::Conflict`].
///
/// # Database Schema
///
/// | Column         | Type     | Notes                                        |
/// |----------------|----------|----------------------------------------------|
/// | `workflow_id`  | `TEXT`   | not null                                     |
/// | `function_num` | `INT`    | not null                                     |
/// | `output`       | `TEXT`   | JSON-encoded return value                    |
/// | `created_at`   | `BIGINT` | epoch milliseconds, defaults to `now()`      |
///
/// Create it with [`PgStore::configure_schema`] or by running the crate's
/// migrations.
///
/// # Example
///
/// ```ignore
/// use ironstep::{DataSource, PgStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let source = DataSource::new("app-db", PgStore::new(pool));
/// source.initialize().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store whose pool connects on first use.
    pub fn connect_lazy(options: PgConnectOptions, config: &DataSourceConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `ironstep` schema and ledger table if they don't exist.
    pub async fn configure_schema(options: &PgConnectOptions) -> Result<()> {
        let mut conn = PgConnection::connect_with(options).await?;
        conn.execute(SCHEMA_SQL).await?;
        conn.close().await?;

        info!(database = ?options.get_database(), "Ledger schema configured");
        Ok(())
    }

    /// Create database `name` if it doesn't exist.
    ///
    /// Connects to the `postgres` maintenance database with `options`.
    /// Returns `true` if the database was created by this call.
    pub async fn ensure_database(options: &PgConnectOptions, name: &str) -> Result<bool> {
        let mut conn = PgConnection::connect_with(&options.clone().database("postgres")).await?;

        let created = if exists_on(&mut conn, name).await? {
            false
        } else {
            let statement = format!("CREATE DATABASE {}", quote_ident(name));
            match conn.execute(statement.as_str()).await {
                Ok(_) => true,
                // Lost a race with another process creating the same database.
                Err(sqlx::Error::Database(err))
                    if err.code().as_deref() == Some(DUPLICATE_DATABASE) =>
                {
                    false
                }
                Err(err) => return Err(err.into()),
            }
        };
        conn.close().await?;

        if created {
            info!(database = name, "Database created");
        }
        Ok(created)
    }

    /// Returns `true` if database `name` exists.
    pub async fn database_exists(options: &PgConnectOptions, name: &str) -> Result<bool> {
        let mut conn = PgConnection::connect_with(&options.clone().database("postgres")).await?;
        let exists = exists_on(&mut conn, name).await?;
        conn.close().await?;
        Ok(exists)
    }

    /// Drop database `name` if it exists.
    ///
    /// Returns `true` if the database was dropped by this call.
    pub async fn drop_database(options: &PgConnectOptions, name: &str) -> Result<bool> {
        let mut conn = PgConnection::connect_with(&options.clone().database("postgres")).await?;

        let exists = exists_on(&mut conn, name).await?;
        if exists {
            let statement = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
            conn.execute(statement.as_str()).await?;
        }
        conn.close().await?;

        if exists {
            info!(database = name, "Database dropped");
        }
        Ok(exists)
    }
}

/// Returns `true` if `name` is listed in `pg_database`.
async fn exists_on(conn: &mut PgConnection, name: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn created_at_from_millis(key: &ExecutionKey, millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).map_err(|err| {
        Error::InvalidRecord {
            key: key.clone(),
            reason: format!("created_at {millis} out of range: {err}"),
        }
    })
}

impl TxStore for PgStore {
    type Transaction = PgTransaction;

    const KIND: &'static str = "postgres";

    async fn initialize(&self) -> Result<()> {
        // Fail at startup rather than on the first step when the database
        // is unreachable.
        self.pool.acquire().await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn get_output(&self, key: &ExecutionKey) -> Result<Option<OutputRecord>> {
        let row: Option<(Option<String>, i64)> = sqlx::query_as(
            r#"SELECT output, created_at FROM ironstep.transaction_outputs
               WHERE workflow_id = $1 AND function_num = $2"#,
        )
        .bind(key.workflow_id().as_str())
        .bind(key.function_num())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(output, created_at)| {
            Ok(OutputRecord {
                key: key.clone(),
                output,
                created_at: created_at_from_millis(key, created_at)?,
            })
        })
        .transpose()
    }

    async fn begin(&self, isolation_level: Option<IsolationLevel>) -> Result<PgTransaction> {
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction.
        if let Some(level) = isolation_level {
            let statement = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            (&mut *tx).execute(statement.as_str()).await?;
        }

        Ok(tx)
    }
}

impl LedgerTransaction for PgTransaction {
    async fn insert_output(&mut self, key: &ExecutionKey, output: &str) -> Result<()> {
        let result = sqlx::query(
            r#"INSERT INTO ironstep.transaction_outputs (workflow_id, function_num, output)
               VALUES ($1, $2, $3)"#,
        )
        .bind(key.workflow_id().as_str())
        .bind(key.function_num())
        .bind(output)
        .execute(&mut **self)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(Error::Conflict(key.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(self) -> Result<()> {
        Transaction::commit(self).await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Transaction::rollback(self).await?;
        Ok(())
    }
}
