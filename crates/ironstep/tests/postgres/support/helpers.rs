use std::sync::Arc;

use ironstep::{DataSourceConfig, ExecutionKey, PgDataSource, PgStore};
use sqlx::PgPool;

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ironstep=debug")
        .try_init();
}

/// An initialized data source over the test database.
pub async fn ready_source(pool: &PgPool) -> anyhow::Result<Arc<PgDataSource>> {
    let source = Arc::new(PgDataSource::with_config(
        "test-db",
        PgStore::new(pool.clone()),
        DataSourceConfig::default(),
    ));
    source.initialize().await?;
    Ok(source)
}

pub async fn count_outputs(pool: &PgPool, workflow_id: &str) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ironstep.transaction_outputs WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// The raw `output` column for `key`; `None` when there is no row.
pub async fn fetch_output(pool: &PgPool, key: &ExecutionKey) -> anyhow::Result<Option<Option<String>>> {
    let output = sqlx::query_scalar(
        r#"SELECT output FROM ironstep.transaction_outputs
           WHERE workflow_id = $1 AND function_num = $2"#,
    )
    .bind(key.workflow_id().as_str())
    .bind(key.function_num())
    .fetch_optional(pool)
    .await?;
    Ok(output)
}

/// Create a single-row counter table for side-effect checks.
pub async fn create_counter(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE counters (id INT PRIMARY KEY, n INT NOT NULL)")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO counters (id, n) VALUES (1, 0)")
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn counter_value(pool: &PgPool) -> anyhow::Result<i32> {
    let n = sqlx::query_scalar("SELECT n FROM counters WHERE id = 1")
        .fetch_one(pool)
        .await?;
    Ok(n)
}
