impl Propagator {
    /// Drives the plan to completion and returns the aggregate status.
    pub async fn run(&mut self, items: Vec<SyncItem>) -> SyncStatus {
        let _ = self
            .journal
            .commit_if_needed_and_start_new_transaction("propagation")
            .await;

        self.build_job_tree(items);
        self.schedule_next_job();

        let Some(mut rx) = self.job_rx.take() else {
            return SyncStatus::FatalError;
        };
        while self.final_status.is_none() {
            let Some(event) = rx.recv().await else {
                break;
            };
            match event {
                JobEvent::ScheduleNext => self.schedule_next_job_impl(),
                JobEvent::Finalize(id) => self.finalize_composite(id).await,
                JobEvent::LeafFinished { id, status } => self.on_leaf_finished(id, status).await,
            }
        }
        self.job_rx = Some(rx);

        let status = self.final_status.unwrap_or(SyncStatus::Success);
        let _ = self.journal.commit("propagation finished", false).await;
        let _ = self.events.send(SyncEvent::Finished(status));
        status
    }

    /// Requests one more scheduling step from the event loop. Deferred so a
    /// parent iterating its running children is never mutated re-entrantly.
    fn schedule_next_job(&self) {
        let _ = self.job_tx.send(JobEvent::ScheduleNext);
    }

    fn schedule_next_job_impl(&mut self) {
        if self.abort_requested.load(Ordering::Relaxed) {
            self.clear_pending();
        }

        let soft_max = self.cfg.max_active_transfers();
        let hard_max = self.cfg.hard_max_active;
        let active = self.active_jobs.len();

        if active < soft_max {
            if self.schedule_self_or_child(self.root) {
                self.schedule_next_job();
            }
        } else if active < hard_max {
            // Only the first soft_max jobs are counted; every one of them
            // that is likely to finish quickly buys one extra slot. When a
            // job finishes, another moves up and gets counted too.
            let quick = self
                .active_jobs
                .iter()
                .take(soft_max)
                .filter(|&&id| self.is_likely_finished_quickly(id))
                .count();
            if active < soft_max + quick {
                debug!(active, "pumping in another request");
                if self.schedule_self_or_child(self.root) {
                    self.schedule_next_job();
                }
            }
        }
    }

    fn clear_pending(&mut self) {
        for slot in &mut self.jobs {
            if let JobKind::Composite(c) = &mut slot.kind {
                c.jobs_to_do.clear();
                c.tasks_to_do.clear();
                c.deferred_jobs.clear();
            }
        }
    }

    fn is_likely_finished_quickly(&self, id: JobId) -> bool {
        match &self.jobs[id].kind {
            JobKind::Leaf(leaf) => {
                if leaf.op.is_transfer() {
                    let snap = leaf.item.lock().expect("item mutex poisoned");
                    snap.is_directory || snap.size < QUICK_TRANSFER_BYTES
                } else {
                    true
                }
            }
            _ => true,
        }
    }

    /// Returns true when a new job was started in this tick.
    fn schedule_self_or_child(&mut self, id: JobId) -> bool {
        enum Tag {
            Leaf,
            Composite,
            Directory,
        }

        if self.jobs[id].state == JobState::Finished {
            return false;
        }
        let tag = match &self.jobs[id].kind {
            JobKind::Leaf(_) => Tag::Leaf,
            JobKind::Composite(_) => Tag::Composite,
            JobKind::Directory(_) => Tag::Directory,
        };
        match tag {
            Tag::Leaf => {
                if self.jobs[id].state == JobState::NotYetStarted {
                    self.start_leaf(id);
                    true
                } else {
                    false
                }
            }
            Tag::Composite => {
                self.jobs[id].state = JobState::Running;
                self.schedule_composite(id)
            }
            Tag::Directory => {
                self.jobs[id].state = JobState::Running;
                self.schedule_directory(id)
            }
        }
    }

    fn schedule_directory(&mut self, id: JobId) -> bool {
        let (first, subjobs) = match &self.jobs[id].kind {
            JobKind::Directory(d) => (d.first, d.subjobs),
            _ => return false,
        };
        if let Some(first_id) = first {
            return match self.jobs[first_id].state {
                JobState::NotYetStarted => self.schedule_self_or_child(first_id),
                // the directory's own job runs alone
                JobState::Running => false,
                JobState::Finished => self.schedule_self_or_child(subjobs),
            };
        }
        self.schedule_self_or_child(subjobs)
    }

    fn schedule_composite(&mut self, id: JobId) -> bool {
        let running: Vec<JobId> = match &self.jobs[id].kind {
            JobKind::Composite(c) => c.running.clone(),
            _ => return false,
        };

        // Ask the running children first; a non-parallel child blocks the
        // scheduling of the rest of the list until it finished.
        for child in running {
            if self.schedule_self_or_child(child) {
                return true;
            }
            if self.parallelism(child) == JobParallelism::WaitForFinished {
                return false;
            }
        }

        loop {
            let next = match &mut self.jobs[id].kind {
                JobKind::Composite(c) => c.jobs_to_do.pop_front(),
                _ => None,
            };
            if let Some(next_id) = next {
                if let JobKind::Composite(c) = &mut self.jobs[id].kind {
                    c.running.push(next_id);
                }
                return self.schedule_self_or_child(next_id);
            }

            let task = match &mut self.jobs[id].kind {
                JobKind::Composite(c) => c.tasks_to_do.pop_front(),
                _ => None,
            };
            let Some(task) = task else {
                break;
            };
            match self.create_job(&task) {
                Some(job_id) => {
                    self.jobs[job_id].parent = Some(id);
                    if let JobKind::Composite(c) = &mut self.jobs[id].kind {
                        c.running.push(job_id);
                    }
                    return self.schedule_self_or_child(job_id);
                }
                None => {
                    let snap = task.lock().expect("item mutex poisoned");
                    warn!(
                        path = %snap.destination(),
                        instruction = ?snap.instruction,
                        "useless task found in composite job"
                    );
                }
            }
        }

        // Deferred directory removals only start once every other child
        // has finished; renames out of those directories run first.
        let deferred = match &mut self.jobs[id].kind {
            JobKind::Composite(c) => {
                if c.running.is_empty() {
                    c.deferred_jobs.pop_front()
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(next_id) = deferred {
            if let JobKind::Composite(c) = &mut self.jobs[id].kind {
                c.running.push(next_id);
            }
            return self.schedule_self_or_child(next_id);
        }

        // Nothing left to do and nothing running: finalize from the event
        // loop, our parent may be iterating over us right now.
        let request = match &mut self.jobs[id].kind {
            JobKind::Composite(c) => {
                if c.is_drained() && !c.finalize_requested {
                    c.finalize_requested = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if request {
            let _ = self.job_tx.send(JobEvent::Finalize(id));
        }
        false
    }

    fn parallelism(&self, id: JobId) -> JobParallelism {
        match &self.jobs[id].kind {
            JobKind::Leaf(leaf) => {
                // a chunked upload keeps the connection to itself
                if let LeafOp::Upload { .. } = leaf.op {
                    let snap = leaf.item.lock().expect("item mutex poisoned");
                    if snap.size as u64 > self.cfg.chunk_size {
                        return JobParallelism::WaitForFinished;
                    }
                }
                JobParallelism::FullParallelism
            }
            JobKind::Composite(c) => {
                for &child in &c.running {
                    if self.parallelism(child) == JobParallelism::WaitForFinished {
                        return JobParallelism::WaitForFinished;
                    }
                }
                JobParallelism::FullParallelism
            }
            JobKind::Directory(d) => {
                if let Some(first) = d.first
                    && self.jobs[first].state != JobState::Finished
                    && self.parallelism(first) != JobParallelism::FullParallelism
                {
                    return JobParallelism::WaitForFinished;
                }
                if self.parallelism(d.subjobs) != JobParallelism::FullParallelism {
                    return JobParallelism::WaitForFinished;
                }
                JobParallelism::FullParallelism
            }
        }
    }

    fn start_leaf(&mut self, id: JobId) {
        let (op, item) = match &self.jobs[id].kind {
            JobKind::Leaf(leaf) => (leaf.op, leaf.item.clone()),
            _ => return,
        };

        // The check runs before this download reserves its own bytes.
        if matches!(op, LeafOp::Download { .. }) {
            let check = self.disk_space_check();
            if check != DiskSpaceResult::Ok {
                warn!(result = ?check, "insufficient local disk space, not starting download");
                self.jobs[id].state = JobState::Running;
                let completed = {
                    let mut locked = item.lock().expect("item mutex poisoned");
                    locked.status = SyncStatus::SoftError;
                    locked.error_string = "Insufficient remaining local disk space".into();
                    locked.clone()
                };
                let _ = self.events.send(SyncEvent::ItemCompleted(completed));
                let _ = self.job_tx.send(JobEvent::LeafFinished {
                    id,
                    status: SyncStatus::SoftError,
                });
                return;
            }
        }

        self.jobs[id].state = JobState::Running;
        self.active_jobs.push(id);
        let ctx = LeafCtx {
            remote: self.remote.clone(),
            local: self.local.clone(),
            journal: self.journal.clone(),
            cfg: self.cfg.clone(),
            local_dir: self.local_dir.clone(),
            events: self.events.clone(),
            abort_requested: self.abort_requested.clone(),
            another_sync_needed: self.another_sync_needed.clone(),
            cancel: self.cancel.child_token(),
        };
        let tx = self.job_tx.clone();
        tokio::spawn(async move {
            let status = transfer::run_leaf(ctx, op, item).await;
            let _ = tx.send(JobEvent::LeafFinished { id, status });
        });
    }

    async fn on_leaf_finished(&mut self, id: JobId, status: SyncStatus) {
        self.active_jobs.retain(|&job| job != id);
        if status == SyncStatus::FatalError {
            // abort all remaining jobs
            self.abort();
        }
        self.propagate_finished(id, status).await;
    }

    async fn finalize_composite(&mut self, id: JobId) {
        // Parallel scheduling can post this more than once; only the first
        // call may finish the job.
        if self.jobs[id].state == JobState::Finished {
            return;
        }
        let status = match &mut self.jobs[id].kind {
            JobKind::Composite(c) => {
                if !c.is_drained() {
                    c.finalize_requested = false;
                    return;
                }
                if c.worst_error == SyncStatus::NoStatus {
                    SyncStatus::Success
                } else {
                    c.worst_error
                }
            }
            _ => return,
        };
        self.propagate_finished(id, status).await;
    }

    /// Marks `child` finished and walks the completion up the tree.
    async fn propagate_finished(&mut self, mut child: JobId, mut status: SyncStatus) {
        enum Next {
            Wait,
            CompositeDone(SyncStatus),
            DirFirstOk,
            DirFirstFailed,
            DirSubsDone,
        }

        loop {
            self.jobs[child].state = JobState::Finished;
            let Some(parent) = self.jobs[child].parent else {
                self.final_status = Some(status);
                return;
            };

            let next = match &mut self.jobs[parent].kind {
                JobKind::Composite(c) => {
                    c.running.retain(|&job| job != child);
                    if status.is_error() {
                        c.worst_error = status;
                    }
                    if c.is_drained() {
                        Next::CompositeDone(if c.worst_error == SyncStatus::NoStatus {
                            SyncStatus::Success
                        } else {
                            c.worst_error
                        })
                    } else {
                        Next::Wait
                    }
                }
                JobKind::Directory(d) => {
                    if d.first == Some(child) {
                        d.first = None;
                        if status == SyncStatus::Success || status == SyncStatus::Restoration {
                            Next::DirFirstOk
                        } else {
                            Next::DirFirstFailed
                        }
                    } else {
                        Next::DirSubsDone
                    }
                }
                JobKind::Leaf(_) => return,
            };

            match next {
                Next::Wait | Next::DirFirstOk => {
                    self.schedule_next_job();
                    return;
                }
                Next::CompositeDone(composite_status) => {
                    child = parent;
                    status = composite_status;
                }
                Next::DirFirstFailed => {
                    // The directory's own operation failed: its children must
                    // never run; the directory finishes with that status.
                    let subjobs = match &self.jobs[parent].kind {
                        JobKind::Directory(d) => d.subjobs,
                        _ => return,
                    };
                    self.jobs[subjobs].state = JobState::Finished;
                    child = parent;
                }
                Next::DirSubsDone => {
                    status = self.directory_subjobs_finished(parent, status).await;
                    child = parent;
                }
            }
        }
    }

    /// Runs once all children of a directory finished: applies the rename
    /// target and commits the directory's metadata to the journal.
    async fn directory_subjobs_finished(
        &mut self,
        dir_id: JobId,
        status: SyncStatus,
    ) -> SyncStatus {
        let (item, affected) = match &self.jobs[dir_id].kind {
            JobKind::Directory(d) => (d.item.clone(), d.affected),
            _ => (None, 0),
        };
        let Some(item) = item else {
            return status;
        };
        if affected > 0 {
            let locked = item.lock().expect("item mutex poisoned");
            debug!(path = %locked.path, affected, "directory removal subsumed plan entries");
        }
        if status != SyncStatus::Success {
            return status;
        }

        let (snap, stale_original) = {
            let mut locked = item.lock().expect("item mutex poisoned");
            let mut stale = None;
            if let Some(target) = locked.rename_target.clone() {
                if locked.instruction == SyncInstruction::Rename && locked.original() != target {
                    stale = Some(locked.original().to_string());
                }
                locked.path = target;
            }
            (locked.clone(), stale)
        };

        if let Some(original) = stale_original {
            // drop the stale subtree rows under the old name
            let _ = self.journal.delete_file_record(&original, true).await;
        }

        // New and renamed directories must reach the database before the sync
        // ends, otherwise they exist locally without a journal row.
        if matches!(
            snap.instruction,
            SyncInstruction::Rename | SyncInstruction::New | SyncInstruction::UpdateMetadata
        ) && self
            .journal
            .set_file_record(&FileRecord::from_item(&snap))
            .await
            .is_err()
        {
            warn!(path = %snap.path, "error writing directory metadata to the database");
            let mut locked = item.lock().expect("item mutex poisoned");
            locked.status = SyncStatus::FatalError;
            locked.error_string = "Error writing metadata to the database".into();
            return SyncStatus::FatalError;
        }
        status
    }
}
