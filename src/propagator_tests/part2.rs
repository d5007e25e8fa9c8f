#[tokio::test]
async fn repeated_failure_is_suppressed_once_blacklisted() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("bad.txt", b"data");
    h.remote.fail_with("put bad.txt", StatusCode::BAD_REQUEST);

    // two earlier syncs already failed on this path
    h.journal
        .update_blacklist_entry(&BlacklistRecord {
            path: "bad.txt".into(),
            last_try_etag: None,
            last_try_modtime: 0,
            retry_count: 2,
            error_string: "server returned 400".into(),
            last_try_time: 1_700_000_000,
            ignore_duration: 50,
        })
        .await
        .unwrap();

    let mut item = file_item("bad.txt", SyncInstruction::New, Up);
    item.size = 4;
    item.has_blacklist_entry = true;

    let status = h.propagator.run(vec![item]).await;
    // a suppressed error does not fail the sync
    assert_eq!(status, SyncStatus::Success);

    let completed = h.completed_items();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, SyncStatus::FileIgnored);
    assert!(completed[0].error_string.starts_with("Continue blacklisting: "));

    let entry = h.journal.blacklist_entry("bad.txt").await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 3);
    assert!(entry.ignore_duration > 50);
}

#[tokio::test]
async fn first_failure_is_reported_before_suppression_kicks_in() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("bad.txt", b"data");
    h.remote.fail_with("put bad.txt", StatusCode::BAD_REQUEST);

    let mut item = file_item("bad.txt", SyncInstruction::New, Up);
    item.size = 4;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::NormalError);

    let completed = h.completed_items();
    assert_eq!(completed[0].status, SyncStatus::NormalError);

    // tracked for the next sync nonetheless
    let entry = h.journal.blacklist_entry("bad.txt").await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert!(entry.ignore_duration > 0);
}

#[tokio::test]
async fn success_wipes_the_blacklist_entry() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("good.txt", b"data");
    h.journal
        .update_blacklist_entry(&BlacklistRecord {
            path: "good.txt".into(),
            last_try_etag: None,
            last_try_modtime: 0,
            retry_count: 4,
            error_string: "old failure".into(),
            last_try_time: 1_700_000_000,
            ignore_duration: 400,
        })
        .await
        .unwrap();

    let mut item = file_item("good.txt", SyncInstruction::New, Up);
    item.size = 4;
    item.has_blacklist_entry = true;

    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::Success);
    assert!(h.journal.blacklist_entry("good.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn fatal_error_aborts_and_softens_in_flight_failures() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("fatal.txt", b"data");
    h.write_local("slow.txt", b"data");
    h.remote.fail_with("put fatal.txt", StatusCode::UNAUTHORIZED);
    h.remote.fail_with("put slow.txt", StatusCode::BAD_REQUEST);
    h.remote
        .delay_op("put slow.txt", Duration::from_millis(150));

    let mut fatal = file_item("fatal.txt", SyncInstruction::New, Up);
    fatal.size = 4;
    let mut slow = file_item("slow.txt", SyncInstruction::New, Up);
    slow.size = 4;

    let status = h.propagator.run(vec![fatal, slow]).await;
    assert!(status.is_error());

    let completed = h.completed_items();
    let fatal_item = completed.iter().find(|i| i.path == "fatal.txt").unwrap();
    assert_eq!(fatal_item.status, SyncStatus::FatalError);
    // the slow failure landed after the abort and was softened
    let slow_item = completed.iter().find(|i| i.path == "slow.txt").unwrap();
    assert_eq!(slow_item.status, SyncStatus::SoftError);
}

#[tokio::test]
async fn critical_disk_space_skips_downloads() {
    let local = TestLocal {
        free: Some(20_000_000),
        ..TestLocal::default()
    };
    let mut h = make_harness_with_local(PropagateConfig::default(), local);
    h.remote.set_body("file.txt", b"hello");

    let mut item = file_item("file.txt", SyncInstruction::New, Down);
    item.size = 5;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::SoftError);

    assert_eq!(h.remote.count("get file.txt"), 0);
    assert!(!h.local_exists("file.txt"));
    let completed = h.completed_items();
    assert_eq!(completed[0].status, SyncStatus::SoftError);
    assert!(completed[0].error_string.contains("disk space"));
}

#[tokio::test]
async fn low_free_space_between_soft_and_critical_also_skips() {
    let local = TestLocal {
        free: Some(100_000_000),
        ..TestLocal::default()
    };
    let mut h = make_harness_with_local(PropagateConfig::default(), local);
    assert_eq!(h.propagator.disk_space_check(), DiskSpaceResult::Failure);

    h.remote.set_body("file.txt", b"hello");
    let mut item = file_item("file.txt", SyncInstruction::New, Down);
    item.size = 5;
    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::SoftError);
    assert_eq!(h.remote.count("get file.txt"), 0);
}

#[tokio::test]
async fn download_writes_target_and_journal_row() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.set_body("d.txt", b"hello");

    let mut item = file_item("d.txt", SyncInstruction::New, Down);
    item.size = 5;
    item.etag = Some("e-1".into());
    item.modtime = 1_700_000_100;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    assert_eq!(h.read_local("d.txt"), b"hello");
    assert!(!h.local_exists("d.txt.partial"));
    let record = h.journal.get_file_record("d.txt").await.unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("e-1"));
    assert!(h.journal.get_download_info("d.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn conflict_download_keeps_the_local_version() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.set_body("c.txt", b"server");
    h.write_local("c.txt", b"local");

    let mut item = file_item("c.txt", SyncInstruction::Conflict, Down);
    item.size = 6;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    let completed = h.completed_items();
    assert_eq!(completed[0].status, SyncStatus::Conflict);
    assert_eq!(h.read_local("c.txt"), b"server");

    let conflict_copy = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|name| name.contains("conflict"))
        .expect("a conflict copy must exist");
    assert_eq!(
        h.read_local(&conflict_copy),
        b"local",
        "the conflict copy keeps the local bytes"
    );
}

#[tokio::test]
async fn local_rename_moves_file_and_rewrites_journal() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("a.txt", b"content");
    h.journal
        .set_file_record(&journal_record("a.txt", ItemType::File))
        .await
        .unwrap();

    let mut item = file_item("a.txt", SyncInstruction::Rename, Down);
    item.rename_target = Some("b.txt".into());

    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::Success);

    assert!(!h.local_exists("a.txt"));
    assert_eq!(h.read_local("b.txt"), b"content");
    assert!(h.journal.get_file_record("a.txt").await.unwrap().is_none());
    assert!(h.journal.get_file_record("b.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn local_remove_deletes_file_and_journal_row() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("gone.txt", b"x");
    h.journal
        .set_file_record(&journal_record("gone.txt", ItemType::File))
        .await
        .unwrap();

    let item = file_item("gone.txt", SyncInstruction::Remove, Down);
    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::Success);

    assert!(!h.local_exists("gone.txt"));
    assert!(h.journal.get_file_record("gone.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn upload_of_a_file_that_changed_meanwhile_is_deferred() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("grew.txt", b"now much longer than planned");

    // the plan still carries the old size
    let mut item = file_item("grew.txt", SyncInstruction::Sync, Up);
    item.size = 4;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::SoftError);
    assert_eq!(h.remote.count("put grew.txt"), 0);
    assert!(h.propagator.another_sync_needed());
}
