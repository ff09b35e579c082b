use fleetsync_core::identifier::{ID_TYPE_ARMIS, ID_TYPE_MAC, ID_TYPE_NETBOX};
use fleetsync_core::{DeviceIdentifier, StrongIdentifiers};
use fleetsync_engine::{EngineError, IdentityConflict};
use fleetsync_harness::TestInventory;

// ============================================================================
// Single upserts
// ============================================================================

#[test]
fn same_device_twice_then_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();

    identity.upsert("D1", ID_TYPE_MAC, "aa:bb:cc:dd:ee:ff", "p1")?;
    identity.upsert("D1", ID_TYPE_MAC, "aa:bb:cc:dd:ee:ff", "p1")?;

    let err = identity
        .upsert("D2", ID_TYPE_MAC, "aa:bb:cc:dd:ee:ff", "p1")
        .unwrap_err();
    match err {
        EngineError::IdentityConflict {
            id_type,
            id_value,
            partition,
            existing,
            incoming,
        } => {
            assert_eq!(id_type, ID_TYPE_MAC);
            assert_eq!(id_value, "AABBCCDDEEFF");
            assert_eq!(partition, "p1");
            assert_eq!(existing, "D1");
            assert_eq!(incoming, "D2");
        }
        other => panic!("expected IdentityConflict, got {other:?}"),
    }

    assert_eq!(
        identity.lookup(ID_TYPE_MAC, "aa:bb:cc:dd:ee:ff", "p1")?.as_deref(),
        Some("D1")
    );
    Ok(())
}

#[test]
fn mac_spellings_share_one_owner() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();

    identity.upsert("D1", ID_TYPE_MAC, "AA:BB:CC:DD:EE:FF", "p1")?;
    identity.upsert("D1", ID_TYPE_MAC, "aabb.ccdd.eeff", "p1")?;

    let err = identity
        .upsert("D2", ID_TYPE_MAC, "aa-bb-cc-dd-ee-ff", "p1")
        .unwrap_err();
    assert!(
        matches!(&err, EngineError::IdentityConflict { existing, incoming, .. } if existing == "D1" && incoming == "D2"),
        "{err:?}"
    );

    for spelling in ["aa:bb:cc:dd:ee:ff", "aa-bb-cc-dd-ee-ff", "AABBCCDDEEFF"] {
        assert_eq!(identity.lookup(ID_TYPE_MAC, spelling, "p1")?.as_deref(), Some("D1"));
    }
    assert_eq!(writer.store().identifiers_for_device("D1")?.len(), 1);
    assert!(writer.store().identifiers_for_device("D2")?.is_empty());
    Ok(())
}

#[test]
fn batch_mac_spellings_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;

    let report = writer.upsert_identifiers(vec![
        DeviceIdentifier::new("D1", ID_TYPE_MAC, "AA:BB:CC:DD:EE:FF", "p", 10),
        DeviceIdentifier::new("D2", ID_TYPE_MAC, "aa-bb-cc-dd-ee-ff", "p", 20),
    ])?;
    assert_eq!(report.written, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].id_value, "AABBCCDDEEFF");
    assert_eq!(report.conflicts[0].existing.as_deref(), Some("D1"));
    Ok(())
}

#[test]
fn partitions_are_independent() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();

    identity.upsert("D1", ID_TYPE_ARMIS, "42", "site-a")?;
    identity.upsert("D2", ID_TYPE_ARMIS, "42", "site-b")?;

    assert_eq!(identity.lookup(ID_TYPE_ARMIS, "42", "site-a")?.as_deref(), Some("D1"));
    assert_eq!(identity.lookup(ID_TYPE_ARMIS, "42", "site-b")?.as_deref(), Some("D2"));
    assert_eq!(identity.lookup(ID_TYPE_ARMIS, "42", "site-c")?, None);
    Ok(())
}

#[test]
fn blank_partition_is_default() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();

    identity.upsert("D1", ID_TYPE_NETBOX, "nb-7", "  ")?;
    assert_eq!(identity.lookup(ID_TYPE_NETBOX, "nb-7", "default")?.as_deref(), Some("D1"));
    assert_eq!(identity.lookup(ID_TYPE_NETBOX, "nb-7", "")?.as_deref(), Some("D1"));
    Ok(())
}

#[test]
fn repeat_upsert_merges_metadata() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();

    let mut first = DeviceIdentifier::new("D1", ID_TYPE_MAC, "aa", "p", 100);
    first.source = "armis".into();
    first.verified = true;
    identity.upsert_identifier(first)?;

    let mut second = DeviceIdentifier::new("D1", ID_TYPE_MAC, "aa", "p", 50);
    second.last_seen = 300;
    identity.upsert_identifier(second)?;

    let stored = writer
        .store()
        .get_identifier(ID_TYPE_MAC, "AA", "p")?
        .ok_or("identifier missing")?;
    assert_eq!(stored.source, "armis");
    assert_eq!(stored.first_seen, 50);
    assert_eq!(stored.last_seen, 300);
    assert!(stored.verified, "verified never flips back");
    Ok(())
}

#[test]
fn missing_fields_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let err = writer.identity().upsert("", ID_TYPE_MAC, "aa", "p").unwrap_err();
    assert!(matches!(err, EngineError::Core(_)));
    Ok(())
}

// ============================================================================
// Batches
// ============================================================================

#[test]
fn batch_reports_conflicts_without_aborting() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    writer.identity().upsert("D1", ID_TYPE_MAC, "aa", "p")?;

    let report = writer.upsert_identifiers(vec![
        DeviceIdentifier::new("D2", ID_TYPE_MAC, "aa", "p", 10),
        DeviceIdentifier::new("D2", ID_TYPE_MAC, "bb", "p", 10),
        DeviceIdentifier::new("D2", "", "cc", "p", 10),
    ])?;

    assert_eq!(report.written, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(
        report.conflicts,
        vec![IdentityConflict {
            id_type: ID_TYPE_MAC.into(),
            id_value: "AA".into(),
            partition: "p".into(),
            existing: Some("D1".into()),
            incoming: "D2".into(),
        }]
    );

    let identity = writer.identity();
    assert_eq!(identity.lookup(ID_TYPE_MAC, "aa", "p")?.as_deref(), Some("D1"));
    assert_eq!(identity.lookup(ID_TYPE_MAC, "bb", "p")?.as_deref(), Some("D2"));
    Ok(())
}

#[test]
fn conflict_inside_one_batch() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;

    let report = writer.upsert_identifiers(vec![
        DeviceIdentifier::new("D1", ID_TYPE_MAC, "aa", "p", 10),
        DeviceIdentifier::new("D2", ID_TYPE_MAC, "aa", "p", 20),
    ])?;
    assert_eq!(report.written, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].existing.as_deref(), Some("D1"));
    Ok(())
}

#[test]
fn batch_lookup_resolves_known_values() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    writer.upsert_identifiers(
        (0..20)
            .map(|i| DeviceIdentifier::new(format!("D{i}"), ID_TYPE_ARMIS, i.to_string(), "p", 1))
            .collect(),
    )?;

    let wanted: Vec<String> = ["3", "7", "19", "404"].into_iter().map(String::from).collect();
    let found = writer.identity().batch_lookup(ID_TYPE_ARMIS, &wanted, "p")?;
    assert_eq!(found.len(), 3);
    assert_eq!(found["3"], "D3");
    assert_eq!(found["7"], "D7");
    assert_eq!(found["19"], "D19");
    assert!(!found.contains_key("404"));
    Ok(())
}

#[test]
fn batch_lookup_canonicalises_like_lookup() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;
    let identity = writer.identity();
    identity.upsert("D1", ID_TYPE_ARMIS, "123", "p")?;
    identity.upsert("D2", ID_TYPE_MAC, "aa:bb:cc:00:11:22", "p")?;

    assert_eq!(identity.lookup(ID_TYPE_ARMIS, " 123 ", "p")?.as_deref(), Some("D1"));
    let found = identity.batch_lookup(ID_TYPE_ARMIS, &[" 123 ".to_string(), "  ".to_string()], "p")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[" 123 "], "D1");

    let spellings: Vec<String> = ["AA:BB:CC:00:11:22", "aa-bb-cc-00-11-22", "aa:bb:cc:00:11:23"]
        .into_iter()
        .map(String::from)
        .collect();
    let found = identity.batch_lookup(ID_TYPE_MAC, &spellings, "p")?;
    assert_eq!(found.len(), 2);
    assert_eq!(found["AA:BB:CC:00:11:22"], "D2");
    assert_eq!(found["aa-bb-cc-00-11-22"], "D2");
    Ok(())
}

#[test]
fn register_strong_identifiers() -> Result<(), Box<dyn std::error::Error>> {
    let inventory = TestInventory::new()?;
    let writer = inventory.writer()?;

    let strong = StrongIdentifiers {
        armis_id: Some("1001".into()),
        netbox_id: Some("nb-1".into()),
        mac: Some("AA:BB:CC:00:11:22".into()),
        partition: "site-a".into(),
        ..Default::default()
    };
    let report = writer
        .identity()
        .register_device_identifiers("D1", &strong, "armis", 1_000)?;
    assert_eq!(report.written, 3);
    assert!(report.conflicts.is_empty());

    let identity = writer.identity();
    assert_eq!(identity.lookup(ID_TYPE_MAC, "aa:bb:cc:00:11:22", "site-a")?.as_deref(), Some("D1"));

    let stored = writer
        .store()
        .get_identifier(ID_TYPE_ARMIS, "1001", "site-a")?
        .ok_or("identifier missing")?;
    assert_eq!(stored.confidence, "strong");
    assert_eq!(stored.source, "armis");

    let ids = writer.store().identifiers_for_device("D1")?;
    assert_eq!(ids.len(), 3);
    Ok(())
}
