use super::*;
use crate::blacklist::BlacklistRecord;

fn record(path: &str, file_type: ItemType, etag: &str) -> FileRecord {
    FileRecord {
        path: path.into(),
        inode: 7,
        mode: 0o644,
        modtime: 1_700_000_000,
        file_type,
        etag: Some(etag.into()),
        file_id: Some(format!("id-{path}")),
        remote_perm: Some("RDNVW".into()),
        size: 12,
    }
}

fn blacklist_record(path: &str) -> BlacklistRecord {
    BlacklistRecord {
        path: path.into(),
        last_try_etag: Some("e1".into()),
        last_try_modtime: 1_700_000_000,
        retry_count: 2,
        error_string: "server returned 400: bad request".into(),
        last_try_time: 1_700_000_100,
        ignore_duration: 50,
    }
}

#[tokio::test]
async fn file_record_roundtrip() {
    let journal = SyncJournal::in_memory(false);
    let rec = record("Docs/A.txt", ItemType::File, "etag-1");

    journal.set_file_record(&rec).await.unwrap();
    let fetched = journal.get_file_record("Docs/A.txt").await.unwrap();

    assert_eq!(fetched, Some(rec));
    assert!(journal.get_file_record("Docs/B.txt").await.unwrap().is_none());
    assert!(journal.get_file_record("").await.unwrap().is_none());
    assert_eq!(journal.file_record_count().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_file_record_recursively() {
    let journal = SyncJournal::in_memory(false);
    journal.set_file_record(&record("A", ItemType::Dir, "e")).await.unwrap();
    journal.set_file_record(&record("A/x", ItemType::File, "e")).await.unwrap();
    journal.set_file_record(&record("A/sub/y", ItemType::File, "e")).await.unwrap();
    journal.set_file_record(&record("AB", ItemType::File, "e")).await.unwrap();

    journal.delete_file_record("A", true).await.unwrap();

    assert!(journal.get_file_record("A").await.unwrap().is_none());
    assert!(journal.get_file_record("A/x").await.unwrap().is_none());
    assert!(journal.get_file_record("A/sub/y").await.unwrap().is_none());
    // prefix match must not swallow sibling names
    assert!(journal.get_file_record("AB").await.unwrap().is_some());
}

#[tokio::test]
async fn avoid_read_invalidates_ancestor_etags() {
    let journal = SyncJournal::in_memory(false);
    journal.set_file_record(&record("A", ItemType::Dir, "dir-a")).await.unwrap();
    journal.set_file_record(&record("A/B", ItemType::Dir, "dir-b")).await.unwrap();
    journal.set_file_record(&record("A/B/c.txt", ItemType::File, "file-c")).await.unwrap();
    journal.set_file_record(&record("Z", ItemType::Dir, "dir-z")).await.unwrap();

    journal.avoid_read_from_db_on_next_sync("A/B/c.txt").await.unwrap();

    let a = journal.get_file_record("A").await.unwrap().unwrap();
    let b = journal.get_file_record("A/B").await.unwrap().unwrap();
    let c = journal.get_file_record("A/B/c.txt").await.unwrap().unwrap();
    let z = journal.get_file_record("Z").await.unwrap().unwrap();
    assert_eq!(a.etag.as_deref(), Some(INVALID_ETAG));
    assert_eq!(b.etag.as_deref(), Some(INVALID_ETAG));
    assert_eq!(c.etag.as_deref(), Some("file-c"));
    assert_eq!(z.etag.as_deref(), Some("dir-z"));

    // later writes of an ancestor within this sync stay poisoned
    journal.set_file_record(&record("A", ItemType::Dir, "fresh")).await.unwrap();
    let a = journal.get_file_record("A").await.unwrap().unwrap();
    assert_eq!(a.etag.as_deref(), Some(INVALID_ETAG));

    // unrelated directories are not filtered
    journal.set_file_record(&record("Z", ItemType::Dir, "fresh-z")).await.unwrap();
    let z = journal.get_file_record("Z").await.unwrap().unwrap();
    assert_eq!(z.etag.as_deref(), Some("fresh-z"));
}

#[tokio::test]
async fn avoid_renames_clears_fileid_and_inode() {
    let journal = SyncJournal::in_memory(false);
    journal.set_file_record(&record("A", ItemType::Dir, "e")).await.unwrap();
    journal.set_file_record(&record("A/x", ItemType::File, "e")).await.unwrap();
    journal.set_file_record(&record("B", ItemType::File, "e")).await.unwrap();

    journal.avoid_renames_on_next_sync("A").await.unwrap();

    let a = journal.get_file_record("A").await.unwrap().unwrap();
    let x = journal.get_file_record("A/x").await.unwrap().unwrap();
    let b = journal.get_file_record("B").await.unwrap().unwrap();
    assert_eq!(a.file_id, None);
    assert_eq!(a.inode, 0);
    assert_eq!(x.file_id, None);
    assert_eq!(x.inode, 0);
    assert_eq!(b.file_id.as_deref(), Some("id-B"));
    assert_eq!(b.inode, 7);
}

#[tokio::test]
async fn download_info_roundtrip_and_stale_sweep() {
    let journal = SyncJournal::in_memory(false);
    let keep_info = DownloadInfo {
        tmp_file: "Docs/A.txt.partial".into(),
        etag: Some("e1".into()),
        error_count: 1,
    };
    let stale_info = DownloadInfo {
        tmp_file: "Docs/B.txt.partial".into(),
        etag: Some("e2".into()),
        error_count: 2,
    };
    journal.set_download_info("Docs/A.txt", Some(&keep_info)).await.unwrap();
    journal.set_download_info("Docs/B.txt", Some(&stale_info)).await.unwrap();

    assert_eq!(
        journal.get_download_info("Docs/A.txt").await.unwrap(),
        Some(keep_info.clone())
    );

    let keep: HashSet<String> = ["Docs/A.txt".to_string()].into_iter().collect();
    let removed = journal.get_and_delete_stale_download_infos(&keep).await.unwrap();
    assert_eq!(removed, vec![stale_info]);
    assert_eq!(journal.download_info_count().await.unwrap(), 1);

    journal.set_download_info("Docs/A.txt", None).await.unwrap();
    assert!(journal.get_download_info("Docs/A.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn upload_info_roundtrip_and_stale_sweep() {
    let journal = SyncJournal::in_memory(false);
    let info = UploadInfo {
        chunk: 3,
        transfer_id: 0xfeed_beef,
        error_count: 1,
        size: 25_000_000,
        modtime: 1_700_000_000,
    };
    journal.set_upload_info("big.bin", Some(&info)).await.unwrap();
    journal
        .set_upload_info(
            "stale.bin",
            Some(&UploadInfo {
                chunk: 1,
                transfer_id: 1,
                error_count: 0,
                size: 10,
                modtime: 1,
            }),
        )
        .await
        .unwrap();

    assert_eq!(journal.get_upload_info("big.bin").await.unwrap(), Some(info));

    let keep: HashSet<String> = ["big.bin".to_string()].into_iter().collect();
    journal.delete_stale_upload_infos(&keep).await.unwrap();
    assert!(journal.get_upload_info("stale.bin").await.unwrap().is_none());
    assert!(journal.get_upload_info("big.bin").await.unwrap().is_some());
}

#[tokio::test]
async fn blacklist_roundtrip() {
    let journal = SyncJournal::in_memory(false);
    let rec = blacklist_record("Docs/A.txt");

    journal.update_blacklist_entry(&rec).await.unwrap();
    let fetched = journal.blacklist_entry("Docs/A.txt").await.unwrap();
    assert_eq!(fetched, Some(rec));

    journal.wipe_blacklist_entry("Docs/A.txt").await.unwrap();
    assert!(journal.blacklist_entry("Docs/A.txt").await.unwrap().is_none());
    assert!(journal.blacklist_entry("").await.unwrap().is_none());
}

#[tokio::test]
async fn blacklist_lookup_respects_case_preservation() {
    let preserving = SyncJournal::in_memory(true);
    preserving
        .update_blacklist_entry(&blacklist_record("Docs/A.txt"))
        .await
        .unwrap();
    let hit = preserving.blacklist_entry("docs/a.TXT").await.unwrap();
    assert!(hit.is_some());

    let sensitive = SyncJournal::in_memory(false);
    sensitive
        .update_blacklist_entry(&blacklist_record("Docs/A.txt"))
        .await
        .unwrap();
    assert!(sensitive.blacklist_entry("docs/a.TXT").await.unwrap().is_none());
    assert!(sensitive.blacklist_entry("Docs/A.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn blacklist_stale_sweep_and_wipe() {
    let journal = SyncJournal::in_memory(false);
    journal.update_blacklist_entry(&blacklist_record("a")).await.unwrap();
    journal.update_blacklist_entry(&blacklist_record("b")).await.unwrap();
    journal.update_blacklist_entry(&blacklist_record("c")).await.unwrap();

    let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
    journal.delete_stale_blacklist_entries(&keep).await.unwrap();
    assert_eq!(journal.blacklist_entry_count().await.unwrap(), 1);

    assert_eq!(journal.wipe_blacklist().await.unwrap(), 1);
    assert_eq!(journal.blacklist_entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn poll_records_roundtrip_and_empty_url_deletes() {
    let journal = SyncJournal::in_memory(false);
    let rec = PollRecord {
        path: "big.bin".into(),
        modtime: 1_700_000_000,
        poll_url: Some("https://server/poll/42".into()),
    };
    journal.set_poll_info(&rec).await.unwrap();
    assert_eq!(journal.get_poll_infos().await.unwrap(), vec![rec.clone()]);

    journal
        .set_poll_info(&PollRecord {
            poll_url: None,
            ..rec
        })
        .await
        .unwrap();
    assert!(journal.get_poll_infos().await.unwrap().is_empty());
}

#[tokio::test]
async fn post_sync_cleanup_keeps_only_keep_set() {
    let journal = SyncJournal::in_memory(false);
    journal.set_file_record(&record("a", ItemType::File, "e")).await.unwrap();
    journal.set_file_record(&record("b", ItemType::File, "e")).await.unwrap();
    journal.set_file_record(&record("c/d", ItemType::File, "e")).await.unwrap();

    let keep: HashSet<String> = ["a".to_string(), "c/d".to_string()].into_iter().collect();
    journal.post_sync_cleanup(&keep).await.unwrap();

    assert!(journal.get_file_record("a").await.unwrap().is_some());
    assert!(journal.get_file_record("b").await.unwrap().is_none());
    assert!(journal.get_file_record("c/d").await.unwrap().is_some());
    assert_eq!(journal.file_record_count().await.unwrap(), 2);
}

#[tokio::test]
async fn detects_upgrade_from_legacy_layout() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join(JOURNAL_FILE_NAME);

    // A pre-version-table journal: only the legacy metadata columns exist.
    {
        let options = SqliteConnectOptions::new()
            .filename(&db_file)
            .create_if_missing(true);
        let mut conn = options.connect().await.unwrap();
        sqlx::query(
            "CREATE TABLE metadata(phash INTEGER(8), pathlen INTEGER, path VARCHAR(4096), \
             inode INTEGER, uid INTEGER, gid INTEGER, mode INTEGER, modtime INTEGER(8), \
             type INTEGER, md5 VARCHAR(32), PRIMARY KEY(phash))",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        conn.close().await.unwrap();
    }

    let journal = SyncJournal::new(dir.path(), false);
    assert!(journal.is_update_from_legacy().await.unwrap());

    // the migration added the newer columns to the legacy table
    let rec = record("Docs/A.txt", ItemType::File, "etag-1");
    journal.set_file_record(&rec).await.unwrap();
    assert_eq!(journal.get_file_record("Docs/A.txt").await.unwrap(), Some(rec));

    // absorbed after the post-sync cleanup
    journal.post_sync_cleanup(&HashSet::new()).await.unwrap();
    assert!(!journal.is_update_from_legacy().await.unwrap());
    journal.close().await;
}

#[tokio::test]
async fn fresh_database_is_not_a_legacy_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let journal = SyncJournal::new(dir.path(), false);
    assert!(!journal.is_update_from_legacy().await.unwrap());
    assert!(journal.exists());
    journal.close().await;
}

#[tokio::test]
async fn schema_creation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();

    let journal = SyncJournal::new(dir.path(), false);
    journal.set_file_record(&record("a", ItemType::File, "e")).await.unwrap();
    journal.close().await;

    // second open runs the whole create/migrate path again
    let journal = SyncJournal::new(dir.path(), false);
    assert!(journal.get_file_record("a").await.unwrap().is_some());
    journal.close().await;

    let options = SqliteConnectOptions::new().filename(dir.path().join(JOURNAL_FILE_NAME));
    let mut conn = options.connect().await.unwrap();
    let versions = sqlx::query("SELECT COUNT(*) FROM version")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(versions.try_get::<i64, _>(0).unwrap(), 1);
    let columns = sqlx::query("PRAGMA table_info('metadata')")
        .fetch_all(&mut conn)
        .await
        .unwrap();
    assert_eq!(columns.len(), 13);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn commit_bracketing_survives_operations() {
    let journal = SyncJournal::in_memory(false);
    journal
        .commit_if_needed_and_start_new_transaction("sync start")
        .await
        .unwrap();
    journal.set_file_record(&record("a", ItemType::File, "e")).await.unwrap();
    journal
        .commit_if_needed_and_start_new_transaction("checkpoint")
        .await
        .unwrap();
    journal.set_file_record(&record("b", ItemType::File, "e")).await.unwrap();
    journal.commit("sync done", false).await.unwrap();

    assert_eq!(journal.file_record_count().await.unwrap(), 2);
}
