//! Integration tests for PgDataSource: replay, races, rollback, isolation and
//! connection failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ironstep::execution::with_key;
use ironstep::{
    DataSourceConfig, Error, ExecutionKey, IsolationLevel, PgDataSource, PgStore,
    TransactionConfig, WorkflowContext,
};
use sqlx::postgres::PgPoolOptions;
use test_utils::db_test;

use crate::support::helpers::{
    count_outputs, counter_value, create_counter, fetch_output, init_test_tracing, ready_source,
};

#[derive(Debug)]
enum StepError {
    OutOfStock,
    Ironstep(Error),
}

impl From<Error> for StepError {
    fn from(err: Error) -> Self {
        StepError::Ironstep(err)
    }
}

impl From<sqlx::Error> for StepError {
    fn from(err: sqlx::Error) -> Self {
        StepError::Ironstep(err.into())
    }
}

/// Increment the test counter in the active transaction.
async fn increment_counter() -> Result<i32, Error> {
    let handle = PgDataSource::client()?;
    let mut tx = handle.lock().await?;
    let n = sqlx::query_scalar("UPDATE counters SET n = n + 1 WHERE id = 1 RETURNING n")
        .fetch_one(&mut **tx)
        .await?;
    Ok(n)
}

db_test!(step_output_is_recorded_and_replayed, |pool| {
    init_test_tracing();
    let source = ready_source(pool).await?;
    let key = ExecutionKey::new("wf-1", 3);
    let runs = AtomicUsize::new(0);

    for x in [5, 7] {
        let value = with_key(
            key.clone(),
            source.invoke_transaction_function(&TransactionConfig::default(), || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(x * 2)
            }),
        )
        .await?;
        assert_eq!(value, 10);
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(fetch_output(pool, &key).await?, Some(Some("10".to_owned())));
    Ok(())
});

db_test!(step_writes_commit_with_the_output, |pool| {
    create_counter(pool).await?;
    let source = ready_source(pool).await?;
    let step = source.register("increment", TransactionConfig::default(), |_: ()| {
        increment_counter()
    });

    let workflow = WorkflowContext::new("wf-1");
    let first = workflow.clone().scope(step.call(())).await?;
    let second = workflow.scope(step.call(())).await?;

    assert_eq!((first, second), (1, 2));
    assert_eq!(counter_value(pool).await?, 2);
    assert_eq!(count_outputs(pool, "wf-1").await?, 2);

    // Replaying the workflow from the start changes nothing.
    let replay = WorkflowContext::new("wf-1")
        .scope(async {
            let a = step.call(()).await?;
            let b = step.call(()).await?;
            Ok::<_, Error>((a, b))
        })
        .await?;
    assert_eq!(replay, (1, 2));
    assert_eq!(counter_value(pool).await?, 2);
    Ok(())
});

db_test!(concurrent_attempts_commit_once, |pool| {
    init_test_tracing();
    create_counter(pool).await?;
    let source = ready_source(pool).await?;
    let key = ExecutionKey::new("wf-race", 0);

    let mut handles = vec![];
    for _ in 0..6 {
        let source = Arc::clone(&source);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            with_key(
                key,
                source.invoke_transaction_function(&TransactionConfig::default(), increment_counter),
            )
            .await
        }));
    }

    let mut values = vec![];
    for handle in handles {
        values.push(handle.await??);
    }

    assert!(values.iter().all(|v| *v == values[0]), "values: {values:?}");
    assert_eq!(counter_value(pool).await?, 1);
    assert_eq!(count_outputs(pool, "wf-race").await?, 1);
    assert_eq!(
        fetch_output(pool, &key).await?,
        Some(Some(values[0].to_string()))
    );
    Ok(())
});

db_test!(step_error_rolls_back_and_passes_through, |pool| {
    create_counter(pool).await?;
    let source = ready_source(pool).await?;
    let key = ExecutionKey::new("wf-1", 0);

    let result: Result<i32, StepError> = with_key(
        key.clone(),
        source.invoke_transaction_function(&TransactionConfig::default(), || async {
            increment_counter().await?;
            Err(StepError::OutOfStock)
        }),
    )
    .await;

    assert!(matches!(result, Err(StepError::OutOfStock)));
    assert_eq!(counter_value(pool).await?, 0);
    assert_eq!(fetch_output(pool, &key).await?, None);
    Ok(())
});

db_test!(database_error_in_step_rolls_back, |pool| {
    let source = ready_source(pool).await?;
    let key = ExecutionKey::new("wf-1", 0);

    let result: Result<i32, StepError> = with_key(
        key.clone(),
        source.invoke_transaction_function(&TransactionConfig::default(), || async {
            let handle = PgDataSource::client()?;
            let mut tx = handle.lock().await?;
            let n = sqlx::query_scalar("SELECT n FROM missing_table")
                .fetch_one(&mut **tx)
                .await?;
            Ok(n)
        }),
    )
    .await;

    assert!(matches!(
        result,
        Err(StepError::Ironstep(Error::Postgres(_)))
    ));
    assert_eq!(fetch_output(pool, &key).await?, None);
    Ok(())
});

db_test!(step_runs_at_configured_isolation, |pool| {
    let source = ready_source(pool).await?;
    let step = source.register(
        "read_isolation",
        TransactionConfig::with_isolation(IsolationLevel::Serializable),
        |_: ()| async {
            let handle = PgDataSource::client()?;
            let mut tx = handle.lock().await?;
            let level: String =
                sqlx::query_scalar("SELECT current_setting('transaction_isolation')")
                    .fetch_one(&mut **tx)
                    .await?;
            Ok::<_, Error>(level)
        },
    );

    let level = WorkflowContext::new("wf-1").scope(step.call(())).await?;

    assert_eq!(level, "serializable");
    Ok(())
});

db_test!(nested_step_runs_in_the_outer_transaction, |pool| {
    create_counter(pool).await?;
    let source = ready_source(pool).await?;
    let inner = source.register("inner", TransactionConfig::default(), |_: ()| {
        increment_counter()
    });
    let outer = source.register("outer", TransactionConfig::default(), |_: ()| async {
        let outer_key = PgDataSource::client()?.key().clone();
        let n = inner.call(()).await?;
        let inner_key = PgDataSource::client()?.key().clone();
        assert_eq!(outer_key, inner_key);
        Ok::<_, Error>(n)
    });

    let result: Result<i32, StepError> = WorkflowContext::new("wf-1")
        .scope(async {
            outer.call(()).await?;
            Err(StepError::OutOfStock)
        })
        .await;

    assert!(matches!(result, Err(StepError::OutOfStock)));
    assert_eq!(counter_value(pool).await?, 1);
    // Only the outer step is recorded.
    assert_eq!(count_outputs(pool, "wf-1").await?, 1);
    assert_eq!(
        fetch_output(pool, &ExecutionKey::new("wf-1", 0)).await?,
        Some(Some("1".to_owned()))
    );
    Ok(())
});

db_test!(client_outside_a_step_is_missing_context, |pool| {
    let _source = ready_source(pool).await?;

    assert!(matches!(PgDataSource::client(), Err(Error::MissingContext)));
    Ok(())
});

db_test!(lazy_source_initializes_and_destroys, |pool| {
    let options = (*pool.connect_options()).clone();
    let source = PgDataSource::connect_lazy("lazy-db", options, Default::default());

    assert_eq!(source.ds_type(), "postgres");
    source.initialize().await?;

    let value = with_key(
        ExecutionKey::new("wf-lazy", 0),
        source.invoke_transaction_function(&TransactionConfig::default(), || async {
            Ok::<_, Error>("done".to_owned())
        }),
    )
    .await?;
    assert_eq!(value, "done");

    source.destroy().await?;
    assert!(source.store().pool().is_closed());

    let err = with_key(
        ExecutionKey::new("wf-lazy", 1),
        source.invoke_transaction_function(&TransactionConfig::default(), || async {
            Ok::<_, Error>(())
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));
    Ok(())
});

db_test!(unreachable_database_fails_initialize, |pool| {
    // Nothing listens on port 1.
    let options = (*pool.connect_options()).clone().host("127.0.0.1").port(1);
    let config = DataSourceConfig {
        acquire_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let source = PgDataSource::connect_lazy("unreachable-db", options, config);

    let err = source.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Postgres(_)), "unexpected error: {err}");
    Ok(())
});

db_test!(closed_pool_fails_before_running_the_step, |pool| {
    let own_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with((*pool.connect_options()).clone())
        .await?;
    let source = PgDataSource::new("closing-db", PgStore::new(own_pool));
    source.initialize().await?;
    source.store().pool().close().await;

    let key = ExecutionKey::new("wf-closed", 0);
    let runs = AtomicUsize::new(0);
    let result = with_key(
        key.clone(),
        source.invoke_transaction_function(&TransactionConfig::default(), || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(1)
        }),
    )
    .await;

    assert!(matches!(result, Err(Error::Postgres(_))));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(fetch_output(pool, &key).await?, None);
    Ok(())
});
