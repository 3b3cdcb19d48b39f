// Recovery behavior: fresh-database layout, reopen after unsynced and
// synced writes, and log replay ordering.

use siltdb::{Options, WriteOptions, DB};
use tempfile::TempDir;

fn list_names(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_open_empty_then_write() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();

        let names = list_names(&dir);
        for expected in ["LOCK", "CURRENT", "MANIFEST-000001", "000003.log"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected} in {names:?}");
        }

        db.put(b"a", b"1").unwrap();
    }

    let db = DB::open(dir.path(), Options::default()).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_open_without_create_if_missing_fails() {
    let dir = TempDir::new().unwrap();
    assert!(DB::open(dir.path(), Options::default()).is_err());
    // The failed open must not leave files that break a later create.
    let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();
    db.put(b"x", b"y").unwrap();
}

#[test]
fn test_unsynced_write_reopens_cleanly() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();
        db.put_opt(&WriteOptions::default(), b"a", b"unsynced").unwrap();
        // Dropped without any explicit sync.
    }

    // The write may or may not have reached disk; the database must
    // open either way.
    let db = DB::open(dir.path(), Options::default()).unwrap();
    match db.get(b"a").unwrap() {
        Some(value) => assert_eq!(value, b"unsynced".to_vec()),
        None => {}
    }
    // And remain writable.
    db.put(b"b", b"2").unwrap();
    assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_synced_write_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();
        db.put_opt(&WriteOptions::sync(), b"a", b"synced").unwrap();
    }

    let db = DB::open(dir.path(), Options::default()).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"synced".to_vec()));
}

#[test]
fn test_recovery_applies_logs_in_order() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(
            dir.path(),
            Options::default()
                .create_if_missing(true)
                // Tiny buffer: several log rotations happen, so recovery
                // has to respect file-number order.
                .write_buffer_size(16 * 1024),
        )
        .unwrap();
        for round in 0..5 {
            for i in 0..500 {
                let key = format!("k{:04}", i);
                let value = format!("round{}", round);
                db.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
    }

    let db = DB::open(dir.path(), Options::default()).unwrap();
    for i in (0..500).step_by(23) {
        let key = format!("k{:04}", i);
        assert_eq!(
            db.get(key.as_bytes()).unwrap(),
            Some(b"round4".to_vec()),
            "latest round wins for {}",
            key
        );
    }
}

#[test]
fn test_sequences_continue_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();
        db.put(b"k", b"v1").unwrap();
    }
    {
        let db = DB::open(dir.path(), Options::default()).unwrap();
        // A write after reopen must shadow the recovered one.
        db.put(b"k", b"v2").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }
    let db = DB::open(dir.path(), Options::default()).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_reopen_with_tables_and_logs() {
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), Options::default().create_if_missing(true)).unwrap();
        for i in 0..100 {
            db.put(format!("t{:03}", i).as_bytes(), b"in-table").unwrap();
        }
        db.flush_memtable().unwrap();
        for i in 100..200 {
            db.put(format!("t{:03}", i).as_bytes(), b"in-log").unwrap();
        }
    }

    let db = DB::open(dir.path(), Options::default()).unwrap();
    assert_eq!(db.get(b"t050").unwrap(), Some(b"in-table".to_vec()));
    assert_eq!(db.get(b"t150").unwrap(), Some(b"in-log".to_vec()));
}
