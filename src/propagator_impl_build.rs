impl Propagator {
    /// Builds the job tree from the destination-sorted plan in one pass.
    /// Directories become nested directory jobs; directory removals are
    /// deferred to the end of the sync so renames out of them run first.
    pub(crate) fn build_job_tree(&mut self, mut items: Vec<SyncItem>) {
        debug_assert!(
            items
                .windows(2)
                .all(|pair| pair[0].destination() <= pair[1].destination()),
            "plan must be sorted by destination path"
        );

        self.jobs.clear();
        self.active_jobs.clear();
        self.final_status = None;

        let root_sub = self.push_job(None, JobKind::Composite(CompositeJob::new()));
        let root = self.push_job(
            None,
            JobKind::Directory(DirectoryJob {
                item: None,
                first: None,
                subjobs: root_sub,
                affected: 0,
            }),
        );
        self.jobs[root_sub].parent = Some(root);
        self.root = root;

        let mut directories: Vec<(String, JobId)> = vec![(String::new(), root)];
        let mut directories_to_remove: VecDeque<JobId> = VecDeque::new();
        let mut removed_directory = String::new();

        let mut index = 0;
        while index < items.len() {
            let item = items[index].clone();
            index += 1;

            if !removed_directory.is_empty() && item.path.starts_with(&removed_directory) {
                match item.instruction {
                    SyncInstruction::Remove => {
                        // subsumed by the removal of the parent directory
                        if let Some(&front) = directories_to_remove.front() {
                            self.bump_affected(front);
                        }
                        continue;
                    }
                    SyncInstruction::New | SyncInstruction::TypeChange if item.is_directory => {
                        // A new directory inside a removed one: the directory
                        // etag was not fetched properly on the previous sync
                        // because it was aborted while uploading this (now
                        // removed) directory. Safe to skip.
                        if let Some(&front) = directories_to_remove.front() {
                            self.bump_affected(front);
                        }
                        continue;
                    }
                    SyncInstruction::Ignore => continue,
                    SyncInstruction::Rename => {
                        // fine, the rename executes before the deferred delete
                    }
                    _ => {
                        warn!(
                            path = %item.path,
                            instruction = ?item.instruction,
                            "job inside a removed directory, this should not happen"
                        );
                    }
                }
            }

            while let Some((prefix, _)) = directories.last() {
                if item.destination().starts_with(prefix.as_str()) {
                    break;
                }
                directories.pop();
            }

            if item.is_directory {
                if item.instruction == SyncInstruction::TypeChange
                    && item.direction == SyncDirection::Up
                {
                    // Skip every queued upload into the replaced folder; the
                    // permission checks upstream ran against the entry that is
                    // about to be deleted.
                    let prefix = format!("{}/", item.destination());
                    for later in items.iter_mut() {
                        if later.destination().starts_with(&prefix) {
                            later.instruction = SyncInstruction::None;
                        }
                    }
                    self.another_sync_needed.store(true, Ordering::Relaxed);
                }

                let shared_item = shared(item.clone());
                let first = self.create_job(&shared_item);
                let sub = self.push_job(None, JobKind::Composite(CompositeJob::new()));
                let dir = self.push_job(
                    None,
                    JobKind::Directory(DirectoryJob {
                        item: Some(shared_item),
                        first,
                        subjobs: sub,
                        affected: 0,
                    }),
                );
                self.jobs[sub].parent = Some(dir);
                if let Some(first_id) = first {
                    self.jobs[first_id].parent = Some(dir);
                }

                if item.instruction == SyncInstruction::Remove {
                    // Deletes run last; deepest first keeps the prepend order.
                    directories_to_remove.push_front(dir);
                    removed_directory = format!("{}/", item.path);

                    // Ancestor etags must not advance past a pending delete,
                    // the next sync refreshes them instead.
                    for (_, ancestor) in &directories {
                        if let JobKind::Directory(d) = &self.jobs[*ancestor].kind
                            && let Some(dir_item) = &d.item
                        {
                            let mut locked = dir_item.lock().expect("item mutex poisoned");
                            if locked.instruction == SyncInstruction::UpdateMetadata {
                                locked.instruction = SyncInstruction::None;
                            }
                        }
                    }
                } else {
                    let top = directories
                        .last()
                        .map(|(_, id)| *id)
                        .unwrap_or(self.root);
                    self.append_job(top, dir);
                }
                directories.push((format!("{}/", item.destination()), dir));
            } else if item.instruction == SyncInstruction::TypeChange {
                // A file replacing a directory deletes that directory, so it
                // is deferred along with the directory removals.
                let shared_item = shared(item.clone());
                if let Some(job) = self.create_job(&shared_item) {
                    directories_to_remove.push_front(job);
                    removed_directory = format!("{}/", item.path);
                }
            } else {
                let top = directories
                    .last()
                    .map(|(_, id)| *id)
                    .unwrap_or(self.root);
                self.append_task(top, shared(item));
            }
        }

        for job in directories_to_remove {
            self.append_deferred(self.root, job);
        }
    }

    /// Leaf factory: dispatches an item to its job kind. `None` for items
    /// that need no work here (`None`, `UpdateMetadata` on files).
    pub(crate) fn create_job(&mut self, item: &SharedItem) -> Option<JobId> {
        let snap = item.lock().expect("item mutex poisoned").clone();
        let delete_existing = snap.instruction == SyncInstruction::TypeChange;
        let op = match snap.instruction {
            SyncInstruction::Remove => {
                if snap.direction == SyncDirection::Down {
                    LeafOp::LocalRemove
                } else {
                    LeafOp::RemoteDelete
                }
            }
            SyncInstruction::New | SyncInstruction::TypeChange if snap.is_directory => {
                if snap.direction == SyncDirection::Down {
                    LeafOp::LocalMkdir { delete_existing }
                } else {
                    LeafOp::RemoteMkdir { delete_existing }
                }
            }
            SyncInstruction::New
            | SyncInstruction::TypeChange
            | SyncInstruction::Sync
            | SyncInstruction::Conflict => {
                if snap.direction != SyncDirection::Up {
                    LeafOp::Download {
                        delete_existing_folder: delete_existing,
                    }
                } else {
                    let ng = snap.size as u64 > self.cfg.chunk_size && self.cfg.server_chunking_ng;
                    LeafOp::Upload {
                        ng,
                        delete_existing,
                    }
                }
            }
            SyncInstruction::Rename => {
                if snap.direction == SyncDirection::Up {
                    LeafOp::RemoteMove
                } else {
                    LeafOp::LocalRename
                }
            }
            SyncInstruction::Ignore | SyncInstruction::Error => LeafOp::Ignore,
            SyncInstruction::None | SyncInstruction::UpdateMetadata => return None,
        };
        Some(self.push_job(
            None,
            JobKind::Leaf(LeafJob {
                item: item.clone(),
                op,
            }),
        ))
    }

    fn append_job(&mut self, dir_id: JobId, child: JobId) {
        let sub = match &self.jobs[dir_id].kind {
            JobKind::Directory(d) => d.subjobs,
            _ => dir_id,
        };
        self.jobs[child].parent = Some(sub);
        if let JobKind::Composite(c) = &mut self.jobs[sub].kind {
            c.jobs_to_do.push_back(child);
        }
    }

    fn append_task(&mut self, dir_id: JobId, item: SharedItem) {
        let sub = match &self.jobs[dir_id].kind {
            JobKind::Directory(d) => d.subjobs,
            _ => dir_id,
        };
        if let JobKind::Composite(c) = &mut self.jobs[sub].kind {
            c.tasks_to_do.push_back(item);
        }
    }

    fn append_deferred(&mut self, dir_id: JobId, child: JobId) {
        let sub = match &self.jobs[dir_id].kind {
            JobKind::Directory(d) => d.subjobs,
            _ => dir_id,
        };
        self.jobs[child].parent = Some(sub);
        if let JobKind::Composite(c) = &mut self.jobs[sub].kind {
            c.deferred_jobs.push_back(child);
        }
    }

    fn bump_affected(&mut self, id: JobId) {
        if let JobKind::Directory(d) = &mut self.jobs[id].kind {
            d.affected += 1;
        }
    }
}
