use std::sync::Arc;
use std::thread;

use fleetsync_core::{DeviceIdentifier, RetryCounters};
use fleetsync_engine::RetryController;
use fleetsync_harness::inventory::fast_retry;
use fleetsync_harness::{TestInventory, device, observation};

const WRITERS: usize = 4;
const ROUNDS: usize = 25;

#[test]
fn concurrent_writers_converge() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = Arc::new(TestInventory::new()?);
    let counters = Arc::new(RetryCounters::new());

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let inventory = Arc::clone(&inventory);
            let counters = Arc::clone(&counters);
            thread::spawn(move || -> Result<(), String> {
                let retry = RetryController::new(&fast_retry()).with_metrics(counters);
                let store = inventory.store().map_err(|e| e.to_string())?;
                let writer = inventory.writer_with(store, retry);
                for round in 0..ROUNDS {
                    let mut shared = device("sr:shared");
                    shared.discovery_sources = vec![format!("collector-{w}")];
                    let mut own = device(&format!("sr:{w}:{round}"));
                    own.hostname = Some(format!("host-{w}-{round}"));
                    writer.upsert_devices(vec![shared, own]).map_err(|e| e.to_string())?;

                    let ip = format!("10.1.{w}.{round}");
                    writer
                        .sightings()
                        .observe(vec![observation("p", &ip, 1_000), observation("p", "10.9.9.9", 1_000)])
                        .map_err(|e| e.to_string())?;
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().map_err(|_| "writer panicked")??;
    }

    let store = inventory.store()?;
    assert_eq!(store.count_devices()? as usize, WRITERS * ROUNDS + 1);

    let shared = store.get_device("sr:shared")?.ok_or("shared device missing")?;
    let mut sources = shared.discovery_sources.clone();
    sources.sort();
    assert_eq!(sources, (0..WRITERS).map(|w| format!("collector-{w}")).collect::<Vec<_>>());

    // One active row per (partition, ip), including the address every writer saw.
    assert_eq!(store.count_active(Some("p"))? as usize, WRITERS * ROUNDS + 1);

    let snap = counters.snapshot();
    assert!(snap.retry_successes <= snap.retries);
    Ok(())
}

#[test]
fn racing_identifier_claims_have_one_winner() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = Arc::new(TestInventory::new()?);

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let inventory = Arc::clone(&inventory);
            thread::spawn(move || -> Result<usize, String> {
                let writer = inventory.writer().map_err(|e| e.to_string())?;
                let claim = DeviceIdentifier::new(format!("D{w}"), "mac", "aa:bb:cc:dd:ee:ff", "p", 1);
                let report = writer.upsert_identifiers(vec![claim]).map_err(|e| e.to_string())?;
                Ok(report.written)
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        winners += handle.join().map_err(|_| "writer panicked")??;
    }
    assert_eq!(winners, 1);

    let owner = inventory
        .writer()?
        .identity()
        .lookup("mac", "aa:bb:cc:dd:ee:ff", "p")?
        .ok_or("identifier missing")?;
    assert!(owner.starts_with('D'));
    Ok(())
}
