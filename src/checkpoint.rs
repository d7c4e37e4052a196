//! Durable job-progress snapshots.
//!
//! One JSON file per job. Every save writes a temp file, flushes it to disk,
//! and renames it over the live snapshot, so a crash mid-write can never
//! leave a torn checkpoint readable on the next load.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::Checkpoint;

/// File-backed checkpoint store rooted at one directory.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Atomically persist a snapshot: temp file, fsync, rename.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path(&checkpoint.job_id);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.job_id));

        let data = serde_json::to_vec_pretty(checkpoint)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the live snapshot for a job. Missing file means no checkpoint;
    /// an unreadable file is an error, never silently treated as fresh.
    pub fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let data = match fs::read(self.path(job_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Retire a completed job's snapshot, keeping it on disk for audit.
    pub fn archive(&self, job_id: &str) -> Result<()> {
        let path = self.path(job_id);
        if path.exists() {
            fs::rename(&path, self.dir.join(format!("{job_id}.json.done")))?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
