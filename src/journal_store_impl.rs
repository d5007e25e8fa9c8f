impl SyncJournal {
    /// Journal for the sync rooted at `local_dir`. The database file is
    /// created lazily on first use.
    pub fn new(local_dir: &Path, case_preserving_fs: bool) -> Self {
        Self {
            db_file: local_dir.join(JOURNAL_FILE_NAME),
            in_memory: false,
            case_insensitive_blacklist: case_preserving_fs,
            state: Mutex::new(JournalState {
                conn: None,
                transaction_open: false,
                avoid_read_filter: Vec::new(),
                legacy_upgrade: false,
            }),
        }
    }

    /// Private throwaway journal, used by tests.
    pub fn in_memory(case_preserving_fs: bool) -> Self {
        let mut journal = Self::new(Path::new(""), case_preserving_fs);
        journal.in_memory = true;
        journal
    }

    pub fn exists(&self) -> bool {
        self.in_memory || self.db_file.exists()
    }

    pub fn database_file_path(&self) -> &Path {
        &self.db_file
    }

    /// Set when an existing database predates the version table. Reset by
    /// `post_sync_cleanup` once the upgrade has been absorbed.
    pub async fn is_update_from_legacy(&self) -> Result<bool, JournalError> {
        let mut state = self.state.lock().await;
        let res = self.ensure_open(&mut state).await;
        Self::check(&mut state, "isUpdateFromLegacy", res).await?;
        Ok(state.legacy_upgrade)
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        debug!(file = %self.db_file.display(), "closing journal");
        let _ = Self::commit_transaction(&mut state).await;
        if let Some(conn) = state.conn.take() {
            let _ = conn.close().await;
        }
        state.avoid_read_filter.clear();
        state.legacy_upgrade = false;
    }

    pub async fn commit(&self, context: &str, start_new: bool) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = Self::commit_internal(&mut state, context, start_new).await;
        Self::check(&mut state, "commit", res).await
    }

    pub async fn commit_if_needed_and_start_new_transaction(
        &self,
        context: &str,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            if state.transaction_open {
                Self::commit_internal(&mut state, context, true).await
            } else {
                Self::start_transaction(&mut state).await
            }
        }
        .await;
        Self::check(&mut state, "commitIfNeeded", res).await
    }

    // ---- file records -------------------------------------------------

    pub async fn get_file_record(&self, path: &str) -> Result<Option<FileRecord>, JournalError> {
        if path.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.lock().await;
        let res = self.get_file_record_inner(&mut state, path).await;
        Self::check(&mut state, "getFileRecord", res).await
    }

    pub async fn set_file_record(&self, record: &FileRecord) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = self.set_file_record_inner(&mut state, record).await;
        Self::check(&mut state, "setFileRecord", res).await
    }

    pub async fn delete_file_record(
        &self,
        path: &str,
        recursively: bool,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            sqlx::query("DELETE FROM metadata WHERE phash=?1")
                .bind(path_hash(path))
                .execute(&mut *conn)
                .await?;
            if recursively {
                sqlx::query("DELETE FROM metadata WHERE path LIKE ?1||'/%'")
                    .bind(path)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "deleteFileRecord", res).await
    }

    pub async fn file_record_count(&self) -> Result<i64, JournalError> {
        self.count("SELECT COUNT(*) FROM metadata", "fileRecordCount")
            .await
    }

    /// Removes metadata rows whose paths are not in `keep`, then folds the
    /// WAL back into the main database file.
    pub async fn post_sync_cleanup(&self, keep: &HashSet<String>) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let rows = sqlx::query("SELECT phash, path FROM metadata ORDER BY path")
                .fetch_all(&mut *conn)
                .await?;

            let superfluous: Vec<String> = rows
                .iter()
                .filter_map(|row| {
                    let path: String = row.try_get(1).ok()?;
                    if keep.contains(&path) {
                        None
                    } else {
                        row.try_get::<i64, _>(0).ok().map(|h| h.to_string())
                    }
                })
                .collect();

            if !superfluous.is_empty() {
                let sql = format!(
                    "DELETE FROM metadata WHERE phash IN ({})",
                    superfluous.join(",")
                );
                debug!(removed = superfluous.len(), "journal cleanup");
                sqlx::query(&sql).execute(&mut *conn).await?;
            }

            sqlx::query("PRAGMA wal_checkpoint(FULL)")
                .execute(&mut *conn)
                .await?;
            state.legacy_upgrade = false;
            Ok(())
        }
        .await;
        Self::check(&mut state, "postSyncCleanup", res).await
    }

    /// Clears `fileid` and `inode` for `path` and all descendants so the next
    /// sync treats them as fresh, and poisons their ancestor etags.
    pub async fn avoid_renames_on_next_sync(&self, path: &str) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            sqlx::query("UPDATE metadata SET fileid = '', inode = 0 WHERE path == ?1 OR path LIKE ?2||'/%'")
                .bind(path)
                .bind(path)
                .execute(&mut *conn)
                .await?;
            self.avoid_read_inner(&mut state, path).await
        }
        .await;
        Self::check(&mut state, "avoidRenamesOnNextSync", res).await
    }

    /// Invalidates the etag of every directory that is an ancestor of
    /// `file_name`, and filters later etag writes for those ancestors within
    /// this sync. Guarantees the next sync re-fetches them from the server.
    pub async fn avoid_read_from_db_on_next_sync(
        &self,
        file_name: &str,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = self.avoid_read_inner(&mut state, file_name).await;
        Self::check(&mut state, "avoidReadFromDbOnNextSync", res).await
    }

    // ---- download resume ----------------------------------------------

    pub async fn get_download_info(&self, path: &str) -> Result<Option<DownloadInfo>, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let row =
                sqlx::query("SELECT tmpfile, etag, errorcount FROM downloadinfo WHERE path=?1")
                    .bind(path)
                    .fetch_optional(&mut *conn)
                    .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            Ok(Some(DownloadInfo {
                tmp_file: row.try_get(0)?,
                etag: non_empty(row.try_get(1)?),
                error_count: row.try_get::<i64, _>(2)? as u32,
            }))
        }
        .await;
        Self::check(&mut state, "getDownloadInfo", res).await
    }

    pub async fn set_download_info(
        &self,
        path: &str,
        info: Option<&DownloadInfo>,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            match info {
                Some(info) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO downloadinfo (path, tmpfile, etag, errorcount) \
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .bind(path)
                    .bind(&info.tmp_file)
                    .bind(info.etag.as_deref().unwrap_or_default())
                    .bind(info.error_count as i64)
                    .execute(&mut *conn)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM downloadinfo WHERE path=?1")
                        .bind(path)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "setDownloadInfo", res).await
    }

    /// Returns the resume rows whose paths are not in `keep` and deletes
    /// them, so the caller can remove the orphaned temporary files.
    pub async fn get_and_delete_stale_download_infos(
        &self,
        keep: &HashSet<String>,
    ) -> Result<Vec<DownloadInfo>, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let rows = sqlx::query("SELECT tmpfile, etag, errorcount, path FROM downloadinfo")
                .fetch_all(&mut *conn)
                .await?;

            let mut deleted = Vec::new();
            let mut stale_paths = Vec::new();
            for row in rows {
                let path: String = row.try_get(3)?;
                if keep.contains(&path) {
                    continue;
                }
                deleted.push(DownloadInfo {
                    tmp_file: row.try_get(0)?,
                    etag: non_empty(row.try_get(1)?),
                    error_count: row.try_get::<i64, _>(2)? as u32,
                });
                stale_paths.push(path);
            }
            for path in &stale_paths {
                sqlx::query("DELETE FROM downloadinfo WHERE path=?1")
                    .bind(path)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(deleted)
        }
        .await;
        Self::check(&mut state, "getAndDeleteStaleDownloadInfos", res).await
    }

    pub async fn download_info_count(&self) -> Result<i64, JournalError> {
        self.count("SELECT COUNT(*) FROM downloadinfo", "downloadInfoCount")
            .await
    }

    // ---- upload resume ------------------------------------------------

    pub async fn get_upload_info(&self, path: &str) -> Result<Option<UploadInfo>, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let row = sqlx::query(
                "SELECT chunk, transferid, errorcount, size, modtime FROM uploadinfo WHERE path=?1",
            )
            .bind(path)
            .fetch_optional(&mut *conn)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            Ok(Some(UploadInfo {
                chunk: row.try_get::<i64, _>(0)? as u32,
                transfer_id: row.try_get::<i64, _>(1)? as u64,
                error_count: row.try_get::<i64, _>(2)? as u32,
                size: row.try_get(3)?,
                modtime: row.try_get(4)?,
            }))
        }
        .await;
        Self::check(&mut state, "getUploadInfo", res).await
    }

    pub async fn set_upload_info(
        &self,
        path: &str,
        info: Option<&UploadInfo>,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            match info {
                Some(info) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO uploadinfo \
                         (path, chunk, transferid, errorcount, size, modtime) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .bind(path)
                    .bind(info.chunk as i64)
                    .bind(info.transfer_id as i64)
                    .bind(info.error_count as i64)
                    .bind(info.size)
                    .bind(info.modtime)
                    .execute(&mut *conn)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM uploadinfo WHERE path=?1")
                        .bind(path)
                        .execute(&mut *conn)
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "setUploadInfo", res).await
    }

    pub async fn delete_stale_upload_infos(
        &self,
        keep: &HashSet<String>,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let rows = sqlx::query("SELECT path FROM uploadinfo")
                .fetch_all(&mut *conn)
                .await?;
            for row in rows {
                let path: String = row.try_get(0)?;
                if keep.contains(&path) {
                    continue;
                }
                sqlx::query("DELETE FROM uploadinfo WHERE path=?1")
                    .bind(&path)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "deleteStaleUploadInfos", res).await
    }

    // ---- error blacklist ----------------------------------------------

    pub async fn blacklist_entry(
        &self,
        path: &str,
    ) -> Result<Option<crate::blacklist::BlacklistRecord>, JournalError> {
        if path.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            // case-preserving filesystems need a case-insensitive lookup
            let sql = if self.case_insensitive_blacklist {
                "SELECT lastTryEtag, lastTryModtime, retrycount, errorstring, lastTryTime, \
                 ignoreDuration FROM blacklist WHERE path=?1 COLLATE NOCASE"
            } else {
                "SELECT lastTryEtag, lastTryModtime, retrycount, errorstring, lastTryTime, \
                 ignoreDuration FROM blacklist WHERE path=?1"
            };
            let row = sqlx::query(sql).bind(path).fetch_optional(&mut *conn).await?;
            let Some(row) = row else {
                return Ok(None);
            };
            Ok(Some(crate::blacklist::BlacklistRecord {
                path: path.to_string(),
                last_try_etag: non_empty(row.try_get(0)?),
                last_try_modtime: row.try_get(1)?,
                retry_count: row.try_get::<i64, _>(2)? as u32,
                error_string: row.try_get(3)?,
                last_try_time: row.try_get::<Option<i64>, _>(4)?.unwrap_or(0),
                ignore_duration: row.try_get::<Option<i64>, _>(5)?.unwrap_or(0),
            }))
        }
        .await;
        Self::check(&mut state, "blacklistEntry", res).await
    }

    pub async fn update_blacklist_entry(
        &self,
        record: &crate::blacklist::BlacklistRecord,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            sqlx::query(
                "INSERT OR REPLACE INTO blacklist \
                 (path, lastTryEtag, lastTryModtime, retrycount, errorstring, lastTryTime, \
                  ignoreDuration) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&record.path)
            .bind(record.last_try_etag.as_deref().unwrap_or_default())
            .bind(record.last_try_modtime)
            .bind(record.retry_count as i64)
            .bind(&record.error_string)
            .bind(record.last_try_time)
            .bind(record.ignore_duration)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;
        Self::check(&mut state, "updateBlacklistEntry", res).await
    }

    pub async fn wipe_blacklist_entry(&self, path: &str) -> Result<(), JournalError> {
        if path.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            sqlx::query("DELETE FROM blacklist WHERE path=?1")
                .bind(path)
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
        .await;
        Self::check(&mut state, "wipeBlacklistEntry", res).await
    }

    pub async fn delete_stale_blacklist_entries(
        &self,
        keep: &HashSet<String>,
    ) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let rows = sqlx::query("SELECT path FROM blacklist")
                .fetch_all(&mut *conn)
                .await?;
            for row in rows {
                let path: String = row.try_get(0)?;
                if keep.contains(&path) {
                    continue;
                }
                sqlx::query("DELETE FROM blacklist WHERE path=?1")
                    .bind(&path)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "deleteStaleBlacklistEntries", res).await
    }

    pub async fn wipe_blacklist(&self) -> Result<i64, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let result = sqlx::query("DELETE FROM blacklist").execute(&mut *conn).await?;
            Ok(result.rows_affected() as i64)
        }
        .await;
        Self::check(&mut state, "wipeBlacklist", res).await
    }

    pub async fn blacklist_entry_count(&self) -> Result<i64, JournalError> {
        self.count("SELECT COUNT(*) FROM blacklist", "blacklistEntryCount")
            .await
    }

    // ---- async poll entries -------------------------------------------

    pub async fn get_poll_infos(&self) -> Result<Vec<PollRecord>, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let rows = sqlx::query("SELECT path, modtime, pollpath FROM poll")
                .fetch_all(&mut *conn)
                .await?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(PollRecord {
                    path: row.try_get(0)?,
                    modtime: row.try_get(1)?,
                    poll_url: non_empty(row.try_get(2)?),
                });
            }
            Ok(out)
        }
        .await;
        Self::check(&mut state, "getPollInfos", res).await
    }

    pub async fn set_poll_info(&self, info: &PollRecord) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            match info.poll_url.as_deref().filter(|u| !u.is_empty()) {
                None => {
                    sqlx::query("DELETE FROM poll WHERE path=?1")
                        .bind(&info.path)
                        .execute(&mut *conn)
                        .await?;
                }
                Some(url) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO poll (path, modtime, pollpath) VALUES (?1, ?2, ?3)",
                    )
                    .bind(&info.path)
                    .bind(info.modtime)
                    .bind(url)
                    .execute(&mut *conn)
                    .await?;
                }
            }
            Ok(())
        }
        .await;
        Self::check(&mut state, "setPollInfo", res).await
    }

    // ---- internals -----------------------------------------------------

    async fn get_file_record_inner(
        &self,
        state: &mut JournalState,
        path: &str,
    ) -> Result<Option<FileRecord>, JournalError> {
        self.ensure_open(state).await?;
        let conn = Self::conn(state)?;
        let row = sqlx::query(
            "SELECT path, inode, mode, modtime, type, md5, fileid, remotePerm, filesize \
             FROM metadata WHERE phash=?1",
        )
        .bind(path_hash(path))
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            debug!(path, "no journal entry");
            return Ok(None);
        };

        Ok(Some(FileRecord {
            path: row.try_get(0)?,
            inode: row.try_get::<i64, _>(1)? as u64,
            mode: row.try_get::<i64, _>(2)? as u32,
            modtime: row.try_get(3)?,
            file_type: ItemType::parse(row.try_get(4)?)?,
            etag: non_empty(row.try_get(5)?),
            file_id: non_empty(row.try_get(6)?),
            remote_perm: non_empty(row.try_get(7)?),
            size: row.try_get::<Option<i64>, _>(8)?.unwrap_or(0),
        }))
    }

    async fn set_file_record_inner(
        &self,
        state: &mut JournalState,
        record: &FileRecord,
    ) -> Result<(), JournalError> {
        self.ensure_open(state).await?;

        let mut etag = record.etag.clone().unwrap_or_default();
        if !state.avoid_read_filter.is_empty() {
            let prefix = format!("{}/", record.path);
            if state.avoid_read_filter.iter().any(|f| f.starts_with(&prefix)) {
                debug!(path = %record.path, "filtered etag write, directory must be re-fetched");
                etag = INVALID_ETAG.to_string();
            }
        }

        let conn = Self::conn(state)?;
        sqlx::query(
            "INSERT OR REPLACE INTO metadata \
             (phash, pathlen, path, inode, uid, gid, mode, modtime, type, md5, fileid, \
              remotePerm, filesize) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(path_hash(&record.path))
        .bind(record.path.len() as i64)
        .bind(&record.path)
        .bind(record.inode as i64)
        .bind(0_i64)
        .bind(0_i64)
        .bind(record.mode as i64)
        .bind(record.modtime)
        .bind(record.file_type.as_i64())
        .bind(etag)
        .bind(record.file_id.as_deref().unwrap_or_default())
        .bind(record.remote_perm.as_deref())
        .bind(record.size)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn avoid_read_inner(
        &self,
        state: &mut JournalState,
        file_name: &str,
    ) -> Result<(), JournalError> {
        self.ensure_open(state).await?;
        let conn = Self::conn(state)?;
        // matches rows whose path is an ancestor directory of file_name
        sqlx::query("UPDATE metadata SET md5=?1 WHERE ?2 LIKE path||'/%' AND type == 2")
            .bind(INVALID_ETAG)
            .bind(file_name)
            .execute(&mut *conn)
            .await?;
        state.avoid_read_filter.push(file_name.to_string());
        Ok(())
    }

    async fn count(&self, sql: &str, context: &str) -> Result<i64, JournalError> {
        let mut state = self.state.lock().await;
        let res = async {
            self.ensure_open(&mut state).await?;
            let conn = Self::conn(&mut state)?;
            let row = sqlx::query(sql).fetch_one(&mut *conn).await?;
            Ok(row.try_get(0)?)
        }
        .await;
        Self::check(&mut state, context, res).await
    }

    fn conn(state: &mut JournalState) -> Result<&mut SqliteConnection, JournalError> {
        state.conn.as_mut().ok_or(JournalError::Closed)
    }

    /// Failure contract: any SQL error flushes what was done, closes the
    /// database, and surfaces the error. The next operation reconnects.
    async fn check<T>(
        state: &mut JournalState,
        context: &str,
        result: Result<T, JournalError>,
    ) -> Result<T, JournalError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(context, error = %err, "journal operation failed, closing database");
                if state.conn.is_some() {
                    let _ = Self::commit_transaction(state).await;
                }
                if let Some(conn) = state.conn.take() {
                    let _ = conn.close().await;
                }
                state.transaction_open = false;
                state.avoid_read_filter.clear();
                Err(err)
            }
        }
    }

    async fn ensure_open(&self, state: &mut JournalState) -> Result<(), JournalError> {
        if state.conn.is_some() {
            return Ok(());
        }

        let is_new_db = self.in_memory || !self.db_file.exists();
        let options = if self.in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.db_file)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        }
        .pragma("case_sensitive_like", "ON");

        let conn = options.connect().await?;
        state.conn = Some(conn);
        state.transaction_open = false;
        debug!(file = %self.db_file.display(), new = is_new_db, "journal opened");

        // Inserts are slow, so setup work runs inside explicit transactions.
        Self::start_transaction(state).await?;
        Self::create_tables(state).await?;
        self.check_version(state, is_new_db).await?;
        Self::commit_internal(state, "checkConnect", true).await?;
        Self::update_database_structure(state).await?;
        Self::commit_internal(state, "checkConnect end", false).await?;
        Ok(())
    }

    async fn create_tables(state: &mut JournalState) -> Result<(), JournalError> {
        let conn = Self::conn(state)?;
        // The etag column is called md5 and the base table carries only the
        // legacy columns; newer columns arrive through the migration path so
        // that old and new journals end up structurally identical.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata(\
             phash INTEGER(8),\
             pathlen INTEGER,\
             path VARCHAR(4096),\
             inode INTEGER,\
             uid INTEGER,\
             gid INTEGER,\
             mode INTEGER,\
             modtime INTEGER(8),\
             type INTEGER,\
             md5 VARCHAR(32),\
             PRIMARY KEY(phash))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS downloadinfo(\
             path VARCHAR(4096),\
             tmpfile VARCHAR(4096),\
             etag VARCHAR(32),\
             errorcount INTEGER,\
             PRIMARY KEY(path))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS uploadinfo(\
             path VARCHAR(4096),\
             chunk INTEGER,\
             transferid INTEGER,\
             errorcount INTEGER,\
             size INTEGER(8),\
             modtime INTEGER(8),\
             PRIMARY KEY(path))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blacklist(\
             path VARCHAR(4096),\
             lastTryEtag VARCHAR(32),\
             lastTryModtime INTEGER(8),\
             retrycount INTEGER,\
             errorstring VARCHAR(4096),\
             PRIMARY KEY(path))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS poll(\
             path VARCHAR(4096),\
             modtime INTEGER(8),\
             pollpath VARCHAR(4096))",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS version(\
             major INTEGER(8),\
             minor INTEGER(8),\
             patch INTEGER(8),\
             custom VARCHAR(256))",
        )
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn check_version(
        &self,
        state: &mut JournalState,
        is_new_db: bool,
    ) -> Result<(), JournalError> {
        let (major, minor, patch, build) = crate_version();
        let conn = Self::conn(state)?;
        let row = sqlx::query("SELECT major, minor, patch FROM version")
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            None => {
                // No version row in an existing database: upgrade from the
                // legacy journal layout.
                if !is_new_db {
                    debug!("existing journal without version row, legacy upgrade assumed");
                    state.legacy_upgrade = true;
                }
                let conn = Self::conn(state)?;
                sqlx::query("INSERT INTO version VALUES (?1, ?2, ?3, ?4)")
                    .bind(major)
                    .bind(minor)
                    .bind(patch)
                    .bind(build)
                    .execute(&mut *conn)
                    .await?;
            }
            Some(row) => {
                let old_major: i64 = row.try_get(0)?;
                let old_minor: i64 = row.try_get(1)?;
                let old_patch: i64 = row.try_get(2)?;
                if (old_major, old_minor, old_patch) != (major, minor, patch) {
                    sqlx::query(
                        "UPDATE version SET major=?1, minor=?2, patch=?3, custom=?4 \
                         WHERE major=?5 AND minor=?6 AND patch=?7",
                    )
                    .bind(major)
                    .bind(minor)
                    .bind(patch)
                    .bind(build)
                    .bind(old_major)
                    .bind(old_minor)
                    .bind(old_patch)
                    .execute(&mut *conn)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn update_database_structure(state: &mut JournalState) -> Result<(), JournalError> {
        let columns = Self::table_columns(state, "metadata").await?;

        if !columns.iter().any(|c| c == "fileid") {
            let conn = Self::conn(state)?;
            sqlx::query("ALTER TABLE metadata ADD COLUMN fileid VARCHAR(128)")
                .execute(&mut *conn)
                .await?;
            sqlx::query("CREATE INDEX metadata_file_id ON metadata(fileid)")
                .execute(&mut *conn)
                .await?;
            Self::commit_internal(state, "add fileid col", true).await?;
        }
        if !columns.iter().any(|c| c == "remotePerm") {
            let conn = Self::conn(state)?;
            sqlx::query("ALTER TABLE metadata ADD COLUMN remotePerm VARCHAR(128)")
                .execute(&mut *conn)
                .await?;
            Self::commit_internal(state, "add remotePerm col", true).await?;
        }
        if !columns.iter().any(|c| c == "filesize") {
            let conn = Self::conn(state)?;
            sqlx::query("ALTER TABLE metadata ADD COLUMN filesize BIGINT")
                .execute(&mut *conn)
                .await?;
            Self::commit_internal(state, "add filesize col", true).await?;
        }

        let conn = Self::conn(state)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS metadata_inode ON metadata(inode)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS metadata_pathlen ON metadata(pathlen)")
            .execute(&mut *conn)
            .await?;
        Self::commit_internal(state, "add metadata indexes", true).await?;

        let blacklist_columns = Self::table_columns(state, "blacklist").await?;
        if !blacklist_columns.iter().any(|c| c == "lastTryTime") {
            let conn = Self::conn(state)?;
            sqlx::query("ALTER TABLE blacklist ADD COLUMN lastTryTime INTEGER(8)")
                .execute(&mut *conn)
                .await?;
            sqlx::query("ALTER TABLE blacklist ADD COLUMN ignoreDuration INTEGER(8)")
                .execute(&mut *conn)
                .await?;
            Self::commit_internal(state, "add blacklist backoff cols", true).await?;
        }
        Ok(())
    }

    async fn table_columns(
        state: &mut JournalState,
        table: &str,
    ) -> Result<Vec<String>, JournalError> {
        let conn = Self::conn(state)?;
        let sql = format!("PRAGMA table_info('{table}')");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(row.try_get::<String, _>(1)?);
        }
        Ok(columns)
    }

    async fn start_transaction(state: &mut JournalState) -> Result<(), JournalError> {
        if state.transaction_open {
            debug!("transaction already running, not starting another one");
            return Ok(());
        }
        let conn = Self::conn(state)?;
        sqlx::query("BEGIN").execute(&mut *conn).await?;
        state.transaction_open = true;
        Ok(())
    }

    async fn commit_transaction(state: &mut JournalState) -> Result<(), JournalError> {
        if !state.transaction_open {
            debug!("no transaction to commit");
            return Ok(());
        }
        let conn = Self::conn(state)?;
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        state.transaction_open = false;
        Ok(())
    }

    async fn commit_internal(
        state: &mut JournalState,
        context: &str,
        start_new: bool,
    ) -> Result<(), JournalError> {
        debug!(context, start_new, "transaction commit");
        Self::commit_transaction(state).await?;
        if start_new {
            Self::start_transaction(state).await?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn crate_version() -> (i64, i64, i64, &'static str) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    (major, minor, patch, env!("CARGO_PKG_VERSION"))
}
