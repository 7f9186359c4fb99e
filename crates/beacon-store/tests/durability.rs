//! Durability round-trips through the copy-out/copy-in persistence cycle.

use beacon_store::{Store, CURRENT_VERSION};
use tempfile::tempdir;

#[test]
fn unacknowledged_samples_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("beacon.db");

    {
        let store = Store::open(&db_path).unwrap();
        store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();
        store.insert_sample("t.a", 1_700_000_000_100, 2.0).unwrap();
        store.insert_sample("t.b", 1_700_000_000_200, 3.0).unwrap();

        // One sample goes in flight but never gets acknowledged
        let unsent = store.read_unsent(1).unwrap();
        store.mark_in_flight(unsent[0].id, 42).unwrap();

        store.persist().unwrap();
    }

    let store = Store::open(&db_path).unwrap();

    // The unclaimed rows come straight back
    let unsent = store.read_unsent(10).unwrap();
    assert_eq!(unsent.len(), 2);

    // The orphaned claim survives the restart and is recoverable through
    // the reclaim window
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert_eq!(store.reclaim_stale(std::time::Duration::ZERO).unwrap(), 1);
    assert_eq!(store.read_unsent(10).unwrap().len(), 3);
}

#[test]
fn confirmed_samples_do_not_reappear() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("beacon.db");

    {
        let store = Store::open(&db_path).unwrap();
        let id = store.insert_sample("t.a", 1_700_000_000_000, 1.0).unwrap();
        store.insert_sample("t.a", 1_700_000_000_100, 2.0).unwrap();

        store.mark_in_flight(id, 7).unwrap();
        store.confirm_sent(7, true).unwrap();
        store.persist().unwrap();
    }

    let store = Store::open(&db_path).unwrap();
    let unsent = store.read_unsent(10).unwrap();
    assert_eq!(unsent.len(), 1);
    assert_eq!(unsent[0].value, 2.0);
}

#[test]
fn config_and_schema_version_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("beacon.db");

    {
        let store = Store::open(&db_path).unwrap();
        store.set_string("site.name", "north-field").unwrap();
        store.set_int64("next_run", 1_700_000_000_000).unwrap();
        store.persist().unwrap();
    }

    let store = Store::open(&db_path).unwrap();
    assert_eq!(
        store.get_string("site.name").unwrap().as_deref(),
        Some("north-field")
    );
    assert_eq!(
        store.get_int64("next_run").unwrap(),
        Some(1_700_000_000_000)
    );
    assert_eq!(
        store.get_int64("schema_version").unwrap(),
        Some(CURRENT_VERSION)
    );
}
