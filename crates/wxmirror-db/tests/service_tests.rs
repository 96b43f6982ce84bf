//! Integration tests for the decrypt service pipeline: debounce behavior,
//! mirror hygiene, and the swap protocol under an active reader.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;

use wxmirror_core::account::Platform;
use wxmirror_db::dbm::{DbControl, DbManager};
use wxmirror_db::service::{DecryptConfig, DecryptService};

fn make_sqlite(path: &Path, marker: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
    conn.execute("INSERT INTO t (v) VALUES (?1)", [marker]).unwrap();
}

/// A byte blob carrying the SQLite magic so the service takes the
/// copy-verbatim path without needing an encrypted fixture.
fn magic_blob(tag: u8) -> Vec<u8> {
    let mut data = b"SQLite format 3\0".to_vec();
    data.extend(std::iter::repeat(tag).take(64));
    data
}

fn service_for(data_dir: &Path, work_dir: &Path) -> Arc<DecryptService> {
    Arc::new(
        DecryptService::new(DecryptConfig {
            data_key: "00".repeat(32),
            data_dir: data_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            platform: Platform::Windows,
            version: 4,
        })
        .unwrap(),
    )
}

#[test]
fn burst_of_writes_coalesces_into_one_decryption() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&data).unwrap();

    let service = service_for(&data, &work);
    service.start_auto_decrypt().unwrap();
    // Let the watcher settle before generating events.
    std::thread::sleep(Duration::from_millis(300));

    let target = data.join("main.db");
    let start = Instant::now();
    for i in 0..5u8 {
        std::fs::write(&target, magic_blob(i)).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    }
    // Burst ends at ~800 ms; the debouncer needs one quiet second, so the
    // single run lands around the 1.8-2.0 s mark.
    while start.elapsed() < Duration::from_millis(1500) {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(service.runs(), 0, "decryption fired before the quiet window");

    let deadline = Instant::now() + Duration::from_secs(5);
    while service.runs() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(service.runs(), 1, "burst must coalesce into one run");

    // Quiet period: no further runs.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(service.runs(), 1);

    // The mirror reflects the last write.
    let mirror = work.join("main.db");
    assert_eq!(std::fs::read(&mirror).unwrap(), magic_blob(4));

    // A fresh event after the quiet interval triggers a second run.
    std::fs::write(&target, magic_blob(9)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while service.runs() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(service.runs(), 2);
    service.stop_auto_decrypt();
}

#[test]
fn wal_events_target_the_main_database() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&data).unwrap();

    std::fs::write(data.join("chat.db"), magic_blob(1)).unwrap();

    let service = service_for(&data, &work);
    service.start_auto_decrypt().unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Only WAL activity; the debouncer must still mirror chat.db itself.
    std::fs::write(data.join("chat.db-wal"), b"wal bytes").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while service.runs() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(service.runs(), 1);
    assert!(work.join("chat.db").exists());
    assert!(!work.join("chat.db-wal").exists());
    service.stop_auto_decrypt();
}

#[test]
fn mirror_is_valid_sqlite_with_no_wal_residuals() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::create_dir_all(&work).unwrap();

    make_sqlite(&data.join("main.db"), 7);
    // Stale residuals that would corrupt reads if left behind.
    std::fs::write(work.join("main.db-wal"), b"stale").unwrap();
    std::fs::write(work.join("main.db-shm"), b"stale").unwrap();

    let service = service_for(&data, &work);
    service.decrypt_db_file(&data.join("main.db")).unwrap();

    assert!(!work.join("main.db-wal").exists());
    assert!(!work.join("main.db-shm").exists());

    let conn = Connection::open_with_flags(
        work.join("main.db"),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .unwrap();
    let tables: i64 = conn
        .query_row("SELECT COUNT(*) FROM sqlite_master", [], |r| r.get(0))
        .unwrap();
    assert!(tables > 0);
    let v: i64 = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
    assert_eq!(v, 7);
}

#[test]
fn swap_replaces_mirror_under_an_active_reader() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&data).unwrap();

    let src = data.join("m.db");
    make_sqlite(&src, 1);

    let service = service_for(&data, &work);
    let mgr = Arc::new(DbManager::new(&work));
    let control: Arc<dyn DbControl> = mgr.clone();
    service.set_db_control(control);

    // First decryption produces the initial mirror.
    service.decrypt_db_file(&src).unwrap();
    let mirror = work.join("m.db");

    // Reader holds a pooled connection and has already queried.
    let reader = mgr.open_db(&mirror).unwrap();
    let v: i64 = reader
        .with(|c| c.query_row("SELECT v FROM t", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(v, 1);

    // Source advances; the swap must close the pooled handle, rename within
    // the retry window, and let the reader observe the new bytes.
    std::fs::remove_file(&src).unwrap();
    make_sqlite(&src, 2);
    service.decrypt_db_file(&src).unwrap();

    let v: i64 = reader
        .with(|c| c.query_row("SELECT v FROM t", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(v, 2, "reader must observe the post-swap file");

    // And a fresh open agrees.
    let fresh = mgr.open_db(&mirror).unwrap();
    let v: i64 = fresh
        .with(|c| c.query_row("SELECT v FROM t", [], |r| r.get(0)))
        .unwrap();
    assert_eq!(v, 2);
}

#[test]
fn bulk_mode_skips_failures_and_blacklisted_paths() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(data.join("sub")).unwrap();
    std::fs::create_dir_all(data.join("ftsindex")).unwrap();

    make_sqlite(&data.join("a.db"), 1);
    make_sqlite(&data.join("sub").join("b.db"), 2);
    make_sqlite(&data.join("ftsindex").join("c.db"), 3);
    // Garbage without the magic and without full pages: decrypt fails, bulk
    // continues.
    std::fs::write(data.join("broken.db"), b"not a database").unwrap();

    let service = service_for(&data, &work);
    let ok = service.decrypt_db_files().unwrap();
    assert_eq!(ok, 2);

    assert!(work.join("a.db").exists());
    assert!(work.join("sub").join("b.db").exists());
    assert!(!work.join("ftsindex").join("c.db").exists());
    assert!(!work.join("broken.db").exists());
}

#[test]
fn source_outside_data_dir_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&data).unwrap();

    let elsewhere = dir.path().join("outside.db");
    std::fs::write(&elsewhere, magic_blob(0)).unwrap();

    let service = service_for(&data, &work);
    assert!(service.decrypt_db_file(&elsewhere).is_err());
}
