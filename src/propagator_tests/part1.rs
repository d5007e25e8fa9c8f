#[tokio::test]
async fn mkdir_precedes_children_and_records_directory_metadata() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("A/x.txt", b"abc");

    let dir = dir_item("A", SyncInstruction::New, Up);
    let mut file = file_item("A/x.txt", SyncInstruction::New, Up);
    file.size = 3;

    let status = h.propagator.run(vec![dir, file]).await;
    assert_eq!(status, SyncStatus::Success);

    let mkcol = h.remote.position("mkcol A").unwrap();
    let put = h.remote.position("put A/x.txt").unwrap();
    assert!(mkcol < put, "directory job must finish before its children start");

    let dir_record = h.journal.get_file_record("A").await.unwrap().unwrap();
    assert_eq!(dir_record.file_id.as_deref(), Some("fid-A"));
    assert_eq!(dir_record.file_type, ItemType::Dir);
    let file_record = h.journal.get_file_record("A/x.txt").await.unwrap().unwrap();
    assert_eq!(file_record.etag.as_deref(), Some("etag-A/x.txt"));

    let completed = h.completed_items();
    assert_eq!(completed.len(), 2);
    assert!(completed.iter().all(|i| i.status == SyncStatus::Success));
}

#[tokio::test]
async fn rename_out_of_removed_directory_runs_before_the_delete() {
    let mut h = make_harness(PropagateConfig::default());
    h.journal
        .set_file_record(&journal_record("A", ItemType::Dir))
        .await
        .unwrap();
    h.journal
        .set_file_record(&journal_record("A/x", ItemType::File))
        .await
        .unwrap();

    let remove = dir_item("A", SyncInstruction::Remove, Up);
    let mut rename = file_item("A/x", SyncInstruction::Rename, Up);
    rename.rename_target = Some("B/x".into());

    let status = h.propagator.run(vec![remove, rename]).await;
    assert_eq!(status, SyncStatus::Success);

    let mv = h.remote.position("move A/x B/x").unwrap();
    let del = h.remote.position("delete A").unwrap();
    assert!(mv < del, "the move must finish before the deferred delete starts");

    assert!(h.journal.get_file_record("A").await.unwrap().is_none());
    assert!(h.journal.get_file_record("A/x").await.unwrap().is_none());
    assert!(h.journal.get_file_record("B/x").await.unwrap().is_some());
}

#[tokio::test]
async fn upload_strategy_follows_size_and_server_capability() {
    // large file, server speaks the NG scheme
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: true,
        ..PropagateConfig::default()
    });
    h.write_local("big.bin", &[7u8; 20]);
    let mut big = file_item("big.bin", SyncInstruction::New, Up);
    big.size = 20;
    assert_eq!(h.propagator.run(vec![big.clone()]).await, SyncStatus::Success);
    assert_eq!(h.remote.count("create_session big.bin"), 1);
    assert_eq!(h.remote.count("session_chunk"), 3);
    assert_eq!(h.remote.count("finalize big.bin"), 1);
    assert_eq!(h.remote.count("put_chunk_v1"), 0);

    // same file without the capability: legacy chunked PUTs
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: false,
        ..PropagateConfig::default()
    });
    h.write_local("big.bin", &[7u8; 20]);
    assert_eq!(h.propagator.run(vec![big]).await, SyncStatus::Success);
    assert_eq!(h.remote.count("put_chunk_v1 big.bin"), 3);
    assert_eq!(h.remote.count("create_session"), 0);

    // small file: a single PUT regardless of the capability
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: true,
        ..PropagateConfig::default()
    });
    h.write_local("small.bin", &[7u8; 4]);
    let mut small = file_item("small.bin", SyncInstruction::New, Up);
    small.size = 4;
    assert_eq!(h.propagator.run(vec![small]).await, SyncStatus::Success);
    assert_eq!(h.remote.count("put small.bin 4"), 1);
    assert_eq!(h.remote.count("create_session"), 0);
    assert_eq!(h.remote.count("put_chunk_v1"), 0);
}

#[tokio::test]
async fn type_change_up_neutralizes_children_and_requests_another_sync() {
    let mut h = make_harness(PropagateConfig::default());

    let dir = dir_item("T", SyncInstruction::TypeChange, Up);
    let mut child = file_item("T/a.txt", SyncInstruction::New, Up);
    child.size = 1;

    let status = h.propagator.run(vec![dir, child]).await;
    assert_eq!(status, SyncStatus::Success);

    // the replaced folder is deleted, recreated, and its queued uploads skipped
    assert!(h.remote.position("delete T").unwrap() < h.remote.position("mkcol T").unwrap());
    assert_eq!(h.remote.count("put T/a.txt"), 0);
    assert!(h.propagator.another_sync_needed());
}

#[tokio::test]
async fn removes_under_a_removed_directory_are_subsumed() {
    let mut h = make_harness(PropagateConfig::default());

    let parent = dir_item("A", SyncInstruction::Remove, Up);
    let nested = dir_item("A/sub", SyncInstruction::Remove, Up);
    let child = file_item("A/x", SyncInstruction::Remove, Up);

    let status = h.propagator.run(vec![parent, nested, child]).await;
    assert_eq!(status, SyncStatus::Success);

    assert_eq!(h.remote.count("delete"), 1);
    assert_eq!(h.remote.count("delete A"), 1);
    let completed = h.completed_items();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].path, "A");
}

#[tokio::test]
async fn empty_plan_finishes_successfully() {
    let mut h = make_harness(PropagateConfig::default());
    let status = h.propagator.run(Vec::new()).await;
    assert_eq!(status, SyncStatus::Success);
    assert!(h.completed_items().is_empty());
    assert!(h.remote.log_entries().is_empty());
}

#[tokio::test]
async fn failed_directory_job_skips_its_children() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.fail_with("mkcol A", StatusCode::BAD_REQUEST);
    h.write_local("A/x.txt", b"abc");

    let dir = dir_item("A", SyncInstruction::New, Up);
    let mut file = file_item("A/x.txt", SyncInstruction::New, Up);
    file.size = 3;

    let status = h.propagator.run(vec![dir, file]).await;
    assert_eq!(status, SyncStatus::NormalError);

    assert_eq!(h.remote.count("put A/x.txt"), 0);
    let completed = h.completed_items();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, SyncStatus::NormalError);
}

#[tokio::test]
async fn ignored_items_complete_as_file_ignored() {
    let mut h = make_harness(PropagateConfig::default());
    let item = file_item("skip.txt", SyncInstruction::Ignore, Down);

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    let completed = h.completed_items();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, SyncStatus::FileIgnored);
}
