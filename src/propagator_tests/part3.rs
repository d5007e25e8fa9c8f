#[tokio::test]
async fn ng_upload_resumes_after_recorded_chunks() {
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: true,
        ..PropagateConfig::default()
    });
    h.write_local("big.bin", &[9u8; 40]);

    // three of five chunks made it across before the crash
    h.journal
        .set_upload_info(
            "big.bin",
            Some(&UploadInfo {
                chunk: 3,
                transfer_id: 777,
                error_count: 1,
                size: 40,
                modtime: 0,
            }),
        )
        .await
        .unwrap();

    let mut item = file_item("big.bin", SyncInstruction::Sync, Up);
    item.size = 40;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    // the session already exists; only the remaining chunks travel
    assert_eq!(h.remote.count("create_session"), 0);
    assert_eq!(h.remote.count("session_chunk 0 "), 0);
    assert_eq!(h.remote.count("session_chunk 8 "), 0);
    assert_eq!(h.remote.count("session_chunk 16 "), 0);
    assert_eq!(h.remote.count("session_chunk 24 8"), 1);
    assert_eq!(h.remote.count("session_chunk 32 8"), 1);
    assert_eq!(h.remote.count("finalize big.bin"), 1);

    assert!(h.journal.get_upload_info("big.bin").await.unwrap().is_none());
    let record = h.journal.get_file_record("big.bin").await.unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("etag-big.bin"));
}

#[tokio::test]
async fn failed_chunk_leaves_a_resume_row_and_the_next_sync_continues() {
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: false,
        ..PropagateConfig::default()
    });
    h.write_local("big.bin", &[5u8; 40]);
    h.remote
        .fail_with("put_chunk_v1 big.bin 2/5", StatusCode::BAD_GATEWAY);

    let mut item = file_item("big.bin", SyncInstruction::Sync, Up);
    item.size = 40;

    let status = h.propagator.run(vec![item.clone()]).await;
    assert_eq!(status, SyncStatus::SoftError);

    let info = h.journal.get_upload_info("big.bin").await.unwrap().unwrap();
    assert_eq!(info.chunk, 2, "two chunks were acknowledged before the failure");
    assert!(info.error_count >= 1);
    assert_eq!(info.size, 40);

    // the next sync picks up at chunk 3 under the same transfer id
    h.remote.clear_failure("put_chunk_v1 big.bin 2/5");
    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::Success);

    assert_eq!(h.remote.count("put_chunk_v1 big.bin 0/5"), 1);
    assert_eq!(h.remote.count("put_chunk_v1 big.bin 1/5"), 1);
    assert_eq!(h.remote.count("put_chunk_v1 big.bin 2/5"), 2);
    assert_eq!(h.remote.count("put_chunk_v1 big.bin 3/5"), 1);
    assert_eq!(h.remote.count("put_chunk_v1 big.bin 4/5"), 1);

    let resumed = h.journal.get_upload_info("big.bin").await.unwrap();
    assert!(resumed.is_none(), "resume state is dropped on success");
}

#[tokio::test]
async fn forbidden_sync_in_shared_directory_restores_with_conflict() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("Shared/doc.txt", b"local-version");
    h.remote.fail_with("put Shared/doc.txt", StatusCode::FORBIDDEN);
    h.remote.set_body("Shared/doc.txt", b"server-version");

    let mut item = file_item("Shared/doc.txt", SyncInstruction::Sync, Up);
    item.size = 13;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::SoftError);

    // the server copy replaced the file, the local bytes survive as a copy
    assert_eq!(h.read_local("Shared/doc.txt"), b"server-version");
    let conflict_copy = std::fs::read_dir(h.dir.path().join("Shared"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|name| name.contains("conflict"))
        .expect("a conflict copy must exist");
    assert_eq!(h.read_local(&format!("Shared/{conflict_copy}")), b"local-version");

    let completed = h.completed_for("Shared/doc.txt");
    assert_eq!(completed.len(), 2, "restoration and original both complete");
    assert_eq!(completed[0].status, SyncStatus::Restoration);
    assert!(completed[0].is_restoration);
    assert_eq!(completed[1].status, SyncStatus::SoftError);
}

#[tokio::test]
async fn forbidden_push_of_a_new_file_is_not_recovered() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("Shared/new.txt", b"data");
    h.remote.fail_with("put Shared/new.txt", StatusCode::FORBIDDEN);

    let mut item = file_item("Shared/new.txt", SyncInstruction::New, Up);
    item.size = 4;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::NormalError);
    assert_eq!(h.remote.count("get Shared/new.txt"), 0);
}

#[tokio::test]
async fn forbidden_delete_of_a_shared_directory_recreates_it_locally() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.fail_with("delete Shared/team", StatusCode::FORBIDDEN);
    h.journal
        .set_file_record(&journal_record("Shared/team", ItemType::Dir))
        .await
        .unwrap();
    h.journal
        .set_file_record(&journal_record("Shared/team/file", ItemType::File))
        .await
        .unwrap();

    let item = dir_item("Shared/team", SyncInstruction::Remove, Up);

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::SoftError);

    assert!(h.local_exists("Shared/team"));
    assert!(h.propagator.another_sync_needed());
    // rename detection is disabled for the restored subtree
    let team = h.journal.get_file_record("Shared/team").await.unwrap().unwrap();
    assert_eq!(team.file_id, None);
    assert_eq!(team.inode, 0);
    let file = h
        .journal
        .get_file_record("Shared/team/file")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.file_id, None);
}

#[tokio::test]
async fn outside_a_shared_directory_forbidden_stays_an_error() {
    let mut h = make_harness(PropagateConfig::default());
    h.write_local("plain.txt", b"data");
    h.remote.fail_with("put plain.txt", StatusCode::FORBIDDEN);

    let mut item = file_item("plain.txt", SyncInstruction::Sync, Up);
    item.size = 4;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::NormalError);
    assert_eq!(h.remote.count("get plain.txt"), 0);
}

#[tokio::test]
async fn download_resumes_a_matching_partial_file() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.set_body("r.bin", b"1234567890");
    h.write_local("r.bin.partial", b"12345");
    h.journal
        .set_download_info(
            "r.bin",
            Some(&DownloadInfo {
                tmp_file: "r.bin.partial".into(),
                etag: Some("e9".into()),
                error_count: 1,
            }),
        )
        .await
        .unwrap();

    let mut item = file_item("r.bin", SyncInstruction::Sync, Down);
    item.size = 10;
    item.etag = Some("e9".into());

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    assert_eq!(h.remote.count("get r.bin 5"), 1);
    assert_eq!(h.read_local("r.bin"), b"1234567890");
    assert!(h.journal.get_download_info("r.bin").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_partial_file_with_other_etag_is_discarded() {
    let mut h = make_harness(PropagateConfig::default());
    h.remote.set_body("r.bin", b"fresh");
    h.write_local("r.bin.partial", b"stale-bytes");
    h.journal
        .set_download_info(
            "r.bin",
            Some(&DownloadInfo {
                tmp_file: "r.bin.partial".into(),
                etag: Some("old-etag".into()),
                error_count: 1,
            }),
        )
        .await
        .unwrap();

    let mut item = file_item("r.bin", SyncInstruction::Sync, Down);
    item.size = 5;
    item.etag = Some("new-etag".into());

    assert_eq!(h.propagator.run(vec![item]).await, SyncStatus::Success);
    assert_eq!(h.remote.count("get r.bin 0"), 1);
    assert_eq!(h.read_local("r.bin"), b"fresh");
}

#[tokio::test]
async fn ng_finalize_pending_polls_inline_until_done() {
    let mut h = make_harness(PropagateConfig {
        chunk_size: 8,
        server_chunking_ng: true,
        ..PropagateConfig::default()
    });
    h.write_local("big.bin", &[3u8; 20]);
    h.remote.pend_finalize("big.bin", "https://server/poll/9");
    h.remote.script_poll(
        "https://server/poll/9",
        vec![PollOutcome::Done(RemoteInfo {
            etag: Some("ng-etag".into()),
            file_id: Some("ng-id".into()),
            remote_perm: None,
            size: 20,
            modtime: 0,
            is_directory: false,
        })],
    );

    let mut item = file_item("big.bin", SyncInstruction::New, Up);
    item.size = 20;

    let status = h.propagator.run(vec![item]).await;
    assert_eq!(status, SyncStatus::Success);

    assert_eq!(h.remote.count("poll https://server/poll/9"), 1);
    assert!(h.journal.get_poll_infos().await.unwrap().is_empty());
    let record = h.journal.get_file_record("big.bin").await.unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("ng-etag"));
}

#[tokio::test]
async fn poll_cleanup_finalizes_a_pending_upload() {
    let remote = MockRemote::default();
    let journal = SyncJournal::in_memory(false);
    journal
        .set_file_record(&journal_record("big.bin", ItemType::File))
        .await
        .unwrap();
    journal
        .set_poll_info(&PollRecord {
            path: "big.bin".into(),
            modtime: 1_700_000_500,
            poll_url: Some("https://server/poll/1".into()),
        })
        .await
        .unwrap();
    remote.script_poll(
        "https://server/poll/1",
        vec![PollOutcome::Done(RemoteInfo {
            etag: Some("new-etag".into()),
            file_id: None,
            remote_perm: None,
            size: 40,
            modtime: 0,
            is_directory: false,
        })],
    );

    crate::poll::cleanup_polls(&remote, &journal).await.unwrap();

    assert!(journal.get_poll_infos().await.unwrap().is_empty());
    let record = journal.get_file_record("big.bin").await.unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("new-etag"));
    assert_eq!(record.size, 40);
    assert_eq!(record.modtime, 1_700_000_500);
}

#[tokio::test]
async fn poll_cleanup_drops_the_row_of_a_failed_upload() {
    let remote = MockRemote::default();
    let journal = SyncJournal::in_memory(false);
    journal
        .set_file_record(&journal_record("lost.bin", ItemType::File))
        .await
        .unwrap();
    journal
        .set_poll_info(&PollRecord {
            path: "lost.bin".into(),
            modtime: 1,
            poll_url: Some("https://server/poll/2".into()),
        })
        .await
        .unwrap();
    remote.script_poll(
        "https://server/poll/2",
        vec![PollOutcome::Failed("assembly failed".into())],
    );

    crate::poll::cleanup_polls(&remote, &journal).await.unwrap();
    assert!(journal.get_poll_infos().await.unwrap().is_empty());
}
