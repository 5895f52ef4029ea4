mod common;

use common::TestSite;
use serde_json::json;
use transfer_engine::archive::BackendPreference;
use transfer_engine::database::replay_sql;
use transfer_engine::TransferError;

#[test]
fn test_snapshot_restore_on_both_backends() {
    for backend in [BackendPreference::Zip, BackendPreference::Tar] {
        let site = TestSite::with_backend("http://site.test", backend);
        let uploads = site.ctx.site.info.paths.uploads.clone();
        let id = site.page(None, "Original", "page", "before");
        site.write_file(&uploads.join("logo.png"), b"png");

        let snapshot = site.ctx.snapshots.create("before change", false, false).unwrap();
        assert_eq!(snapshot.includes, vec!["uploads"]);

        site.page(Some(id), "Changed", "page", "after");
        std::fs::write(uploads.join("logo.png"), b"overwritten").unwrap();

        let outcome = site.ctx.snapshots.restore(&snapshot.id, &site.ctx.lock).unwrap();
        assert_eq!(outcome.snapshot_id, snapshot.id);
        assert!(outcome.files >= 1);

        let post = site.ctx.site.content.get_post_by_id(id).unwrap().unwrap();
        assert_eq!(post.title, "Original");
        assert_eq!(std::fs::read(uploads.join("logo.png")).unwrap(), b"png");
        assert!(site.ctx.lock.current().unwrap().is_none());
    }
}

#[test]
fn test_snapshot_retention_prunes_oldest() {
    // The fixture keeps two snapshots
    let site = TestSite::new("http://site.test");
    let first = site.ctx.snapshots.create("one", false, false).unwrap();
    let second = site.ctx.snapshots.create("two", false, false).unwrap();
    let third = site.ctx.snapshots.create("three", false, false).unwrap();

    let ids: Vec<String> = site.ctx.snapshots.all().unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![third.id.clone(), second.id.clone()]);
    assert!(!first.path.exists());
    assert!(site.ctx.snapshots.get(&first.id).unwrap().is_none());

    assert!(site.ctx.snapshots.delete(&second.id).unwrap());
    assert!(!site.ctx.snapshots.delete(&second.id).unwrap());
    assert_eq!(site.ctx.snapshots.all().unwrap().len(), 1);
}

#[test]
fn test_restore_waits_for_lock() {
    let site = TestSite::new("http://site.test");
    let snapshot = site.ctx.snapshots.create("", false, false).unwrap();
    let held = site.ctx.lock.acquire("import", None, None).unwrap();

    let err = site.ctx.snapshots.restore(&snapshot.id, &site.ctx.lock).unwrap_err();
    assert!(matches!(err, TransferError::Conflict(ref m) if m.contains("import")));
    assert!(site.ctx.lock.release(&held).unwrap());

    let missing = site.ctx.snapshots.restore("20200101T000000Z-nope", &site.ctx.lock);
    assert!(matches!(missing, Err(TransferError::NotFound(_))));
}

#[test]
fn test_dangerous_statements_are_skipped() {
    let site = TestSite::new("http://site.test");
    let store = site.ctx.site.store.as_ref();
    store.execute("CREATE TABLE x (id INTEGER, name TEXT)").unwrap();

    let report = replay_sql(
        store,
        "DROP TABLE x; INSERT INTO x VALUES (1, 'a;b'); DELETE FROM x;",
    )
    .unwrap();
    assert_eq!(report.executed, 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.skipped[0].starts_with("DROP TABLE"));

    let rows = store.query("SELECT name FROM x").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("a;b"));
}

#[test]
fn test_replay_stops_at_first_failure() {
    let site = TestSite::new("http://site.test");
    let store = site.ctx.site.store.as_ref();

    let err = replay_sql(
        store,
        "CREATE TABLE y (id INTEGER); INSERT INTO missing VALUES (1); INSERT INTO y VALUES (1);",
    )
    .unwrap_err();
    assert!(matches!(err, TransferError::PartialWrite(_)));
    assert!(store.query("SELECT * FROM y").unwrap().is_empty());
}

#[test]
fn test_sweep_removes_nothing_fresh() {
    let site = TestSite::new("http://site.test");
    std::fs::create_dir_all(site.ctx.layout.scratch_dir("fresh")).unwrap();
    site.ctx.chunks.init_upload(1, None, None).unwrap();

    let summary = site.ctx.sweep().unwrap();
    assert_eq!(summary.expired_jobs, 0);
    assert_eq!(summary.scratch_dirs, 0);
    assert!(site.ctx.layout.scratch_dir("fresh").exists());
}
