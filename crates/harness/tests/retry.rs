use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetsync_core::{CancelToken, RetryConfig, RetryCounters};
use fleetsync_engine::{EngineError, RetryController, RetryError};
use fleetsync_harness::{RecordingPause, ScriptedBatch, TestInventory, device, permanent, sqlite_busy, transient};
use fleetsync_storage::StoreConfig;

fn config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        lock_backoff: Duration::from_millis(500),
        transient_backoff: Duration::from_millis(150),
    }
}

fn controller(max_attempts: u32, pause: &Arc<RecordingPause>) -> (RetryController, Arc<RetryCounters>) {
    let counters = Arc::new(RetryCounters::new());
    let controller = RetryController::new(&config(max_attempts))
        .with_metrics(counters.clone())
        .with_pause(pause.clone());
    (controller, counters)
}

// ============================================================================
// Scripted failures
// ============================================================================

#[test]
fn two_deadlocks_then_success() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::new());
    let (controller, counters) = controller(3, &pause);
    let batch = ScriptedBatch::new([transient("40P01"), transient("40P01")]);

    let result = controller.submit("devices", &CancelToken::new(), || batch.run())?;
    assert_eq!(result, 3);
    assert_eq!(batch.calls(), 3);

    let snap = counters.snapshot();
    assert_eq!(snap.deadlocks, 2);
    assert_eq!(snap.serialization_failures, 0);
    assert_eq!(snap.retries, 2);
    assert_eq!(snap.retry_successes, 1);

    // Lock contention uses the 500ms base: [500, 1000) then [1000, 1500).
    let delays = pause.delays();
    assert_eq!(delays.len(), 2);
    assert!(delays[0] >= Duration::from_millis(500) && delays[0] < Duration::from_millis(1000));
    assert!(delays[1] >= Duration::from_millis(1000) && delays[1] < Duration::from_millis(1500));
    Ok(())
}

#[test]
fn serialization_failures_are_counted_separately() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::new());
    let (controller, counters) = controller(3, &pause);
    let batch = ScriptedBatch::new([transient("40001")]);

    controller.submit("devices", &CancelToken::new(), || batch.run())?;
    let snap = counters.snapshot();
    assert_eq!(snap.serialization_failures, 1);
    assert_eq!(snap.deadlocks, 0);
    assert_eq!(snap.retry_successes, 1);
    Ok(())
}

#[test]
fn non_lock_transient_uses_short_base() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::new());
    let (controller, counters) = controller(3, &pause);
    let batch = ScriptedBatch::new([transient("57014")]);

    controller.submit("devices", &CancelToken::new(), || batch.run())?;
    let delays = pause.delays();
    assert_eq!(delays.len(), 1);
    assert!(delays[0] >= Duration::from_millis(150) && delays[0] < Duration::from_millis(300));
    assert_eq!(counters.snapshot().deadlocks, 0);
    assert_eq!(counters.snapshot().retries, 1);
    Ok(())
}

#[test]
fn permanent_failure_makes_one_attempt() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::new());
    let (controller, counters) = controller(3, &pause);
    let batch = ScriptedBatch::new([permanent("foreign key mismatch")]);

    let err = controller
        .submit("devices", &CancelToken::new(), || batch.run())
        .unwrap_err();
    assert_eq!(batch.calls(), 1);
    assert!(pause.delays().is_empty());
    assert_eq!(counters.snapshot().retries, 0);
    match err {
        RetryError::Failed {
            attempts,
            transient,
            code,
            ..
        } => {
            assert_eq!(attempts, 1);
            assert!(!transient);
            assert_eq!(code, "");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    Ok(())
}

#[test]
fn exhaustion_reports_transient_failure() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::new());
    let (controller, counters) = controller(3, &pause);
    let batch = ScriptedBatch::new([sqlite_busy(), sqlite_busy(), sqlite_busy(), sqlite_busy()]);

    let err = controller
        .submit("devices", &CancelToken::new(), || batch.run())
        .unwrap_err();
    assert_eq!(batch.calls(), 3);
    assert_eq!(err.attempts(), 3);
    assert_eq!(err.failed_index(), Some(0));
    assert!(matches!(err, RetryError::Failed { transient: true, .. }));
    assert_eq!(pause.delays().len(), 2);
    assert_eq!(counters.snapshot().deadlocks, 3);
    assert_eq!(counters.snapshot().retries, 2);
    Ok(())
}

#[test]
fn cancel_during_pause_stops_retrying() -> Result<(), Box<dyn std::error::Error>> {
    let pause = Arc::new(RecordingPause::with_hook(|_, cancel| cancel.cancel()));
    let (controller, counters) = controller(5, &pause);
    let batch = ScriptedBatch::new([transient("40P01"), transient("40P01")]);

    let err = controller
        .submit("devices", &CancelToken::new(), || batch.run())
        .unwrap_err();
    assert!(matches!(err, RetryError::Cancelled { attempts: 1, .. }));
    assert_eq!(batch.calls(), 1);
    assert_eq!(counters.snapshot().retry_successes, 0);
    Ok(())
}

#[test]
fn thread_pause_wakes_on_cancel() -> Result<(), Box<dyn std::error::Error>> {
    let controller = RetryController::new(&RetryConfig {
        max_attempts: 3,
        lock_backoff: Duration::from_secs(60),
        transient_backoff: Duration::from_secs(60),
    });
    let cancel = CancelToken::new();
    let batch = ScriptedBatch::new([transient("40P01")]);

    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };
    let started = std::time::Instant::now();
    let err = controller.submit("devices", &cancel, || batch.run()).unwrap_err();
    canceller.join().map_err(|_| "canceller panicked")?;

    assert!(matches!(err, RetryError::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(30));
    Ok(())
}

// ============================================================================
// Real SQLite contention
// ============================================================================

#[test]
fn busy_database_is_retried_until_the_lock_clears() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let store = inventory.store_with(StoreConfig {
        busy_timeout: Duration::ZERO,
        ..StoreConfig::default()
    })?;

    let holder = rusqlite::Connection::open(inventory.path())?;
    holder.execute_batch("BEGIN IMMEDIATE")?;
    let holder = Mutex::new(Some(holder));

    // The first pause releases the competing transaction.
    let pause = Arc::new(RecordingPause::with_hook(move |n, _| {
        if n == 0 {
            if let Some(conn) = holder.lock().unwrap().take() {
                conn.execute_batch("ROLLBACK").unwrap();
            }
        }
    }));
    let counters = Arc::new(RetryCounters::new());
    let retry = RetryController::new(&config(3))
        .with_metrics(counters.clone())
        .with_pause(pause.clone());
    let writer = inventory.writer_with(store, retry);

    let mut d = device("sr:busy");
    d.hostname = Some("host-1".into());
    let report = writer.upsert_devices(vec![d])?;
    assert_eq!(report.written, 1);

    let snap = counters.snapshot();
    assert_eq!(snap.deadlocks, 1);
    assert_eq!(snap.retries, 1);
    assert_eq!(snap.retry_successes, 1);
    assert_eq!(pause.delays().len(), 1);

    let stored = writer.store().get_device("sr:busy")?.ok_or("device missing")?;
    assert_eq!(stored.hostname.as_deref(), Some("host-1"));
    Ok(())
}

#[test]
fn writer_surfaces_cancellation() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    writer.cancel_token().cancel();

    let err = writer.upsert_devices(vec![device("sr:1")]).unwrap_err();
    assert!(matches!(err, EngineError::Retry(RetryError::Cancelled { attempts: 0, .. })));
    assert!(writer.store().get_device("sr:1")?.is_none());
    Ok(())
}
