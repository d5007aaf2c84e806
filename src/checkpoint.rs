//! Stage progress checkpoints and the per-stage error log.
//!
//! A [`Checkpoint`] is an explicit value passed into and returned from
//! each batch-processing call; persisting it is a side effect at the call
//! site, never ambient global state. One JSON file exists per stage and
//! shard, rewritten after every committed batch, so a restarted run
//! resumes strictly after `last_key` instead of reprocessing.
//!
//! Detailed failures additionally stream to a JSONL error log per stage;
//! the checkpoint keeps only a bounded tail so the file stays small.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Most recent failures kept inline in the checkpoint file.
const MAX_INLINE_ERRORS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: String,
    pub shard_id: u32,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    /// Last natural key examined by this shard; selection resumes after it.
    pub last_key: Option<String>,
    #[serde(default)]
    pub errors: Vec<CheckpointError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointError {
    pub key: String,
    pub reason: String,
    pub at: i64,
}

impl Checkpoint {
    pub fn new(stage: &str, shard_id: u32) -> Self {
        Self {
            stage: stage.to_string(),
            shard_id,
            processed: 0,
            successful: 0,
            failed: 0,
            last_key: None,
            errors: Vec::new(),
        }
    }

    /// Checkpoint file path for a stage/shard under the state directory.
    pub fn path_for(state_dir: &Path, stage: &str, shard_id: u32) -> PathBuf {
        state_dir.join(format!("{}-shard{}.json", stage, shard_id))
    }

    /// Load the checkpoint for this stage/shard, or start fresh.
    pub fn load_or_new(path: &Path, stage: &str, shard_id: u32) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(stage, shard_id));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Malformed checkpoint: {}", path.display()))?;

        if checkpoint.stage != stage || checkpoint.shard_id != shard_id {
            anyhow::bail!(
                "Checkpoint {} belongs to stage '{}' shard {}, expected stage '{}' shard {}",
                path.display(),
                checkpoint.stage,
                checkpoint.shard_id,
                stage,
                shard_id
            );
        }

        Ok(checkpoint)
    }

    /// Persist atomically (write-then-rename) so a crash mid-write never
    /// leaves a torn checkpoint behind.
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace checkpoint: {}", path.display()))?;

        Ok(())
    }

    pub fn record_success(&mut self, key: &str) {
        self.processed += 1;
        self.successful += 1;
        self.advance(key);
    }

    pub fn record_failure(&mut self, key: &str, reason: &str) {
        self.processed += 1;
        self.failed += 1;
        self.advance(key);
        self.errors.push(CheckpointError {
            key: key.to_string(),
            reason: reason.to_string(),
            at: chrono::Utc::now().timestamp(),
        });
        if self.errors.len() > MAX_INLINE_ERRORS {
            let overflow = self.errors.len() - MAX_INLINE_ERRORS;
            self.errors.drain(..overflow);
        }
    }

    /// Clear the cursor after a completed pass so the next run starts a
    /// fresh scan of the range. Counters and errors are preserved; rows
    /// that failed this pass are still pending and get picked up again.
    pub fn reset_cursor(&mut self) {
        self.last_key = None;
    }

    /// Move the cursor forward. Keys only ever advance; an out-of-order
    /// key (possible when a batch mixes skip reasons) is ignored.
    pub fn advance(&mut self, key: &str) {
        match &self.last_key {
            Some(last) if last.as_str() >= key => {}
            _ => self.last_key = Some(key.to_string()),
        }
    }
}

/// Append-only JSONL error log, one file per stage.
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn open(state_dir: &Path, stage: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: state_dir.join(format!("{}-errors.jsonl", stage)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, key: &str, reason: &str) -> Result<()> {
        use std::io::Write;

        let entry = serde_json::json!({
            "at": chrono::Utc::now().timestamp(),
            "key": key,
            "reason": reason,
        });

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open error log: {}", self.path.display()))?;
        writeln!(file, "{}", entry)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Checkpoint::path_for(tmp.path(), "narrative", 2);

        let mut cp = Checkpoint::new("narrative", 2);
        cp.record_success("100001");
        cp.record_failure("100002", "provider timeout");
        cp.store(&path).unwrap();

        let loaded = Checkpoint::load_or_new(&path, "narrative", 2).unwrap();
        assert_eq!(loaded.processed, 2);
        assert_eq!(loaded.successful, 1);
        assert_eq!(loaded.failed, 1);
        assert_eq!(loaded.last_key.as_deref(), Some("100002"));
        assert_eq!(loaded.errors.len(), 1);
        assert_eq!(loaded.errors[0].key, "100002");
    }

    #[test]
    fn missing_file_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Checkpoint::path_for(tmp.path(), "embedding", 0);
        let cp = Checkpoint::load_or_new(&path, "embedding", 0).unwrap();
        assert_eq!(cp.processed, 0);
        assert_eq!(cp.last_key, None);
    }

    #[test]
    fn stage_mismatch_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Checkpoint::path_for(tmp.path(), "narrative", 0);
        Checkpoint::new("narrative", 0).store(&path).unwrap();

        assert!(Checkpoint::load_or_new(&path, "embedding", 0).is_err());
        assert!(Checkpoint::load_or_new(&path, "narrative", 1).is_err());
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cp = Checkpoint::new("narrative", 0);
        cp.advance("100200");
        cp.advance("100100");
        assert_eq!(cp.last_key.as_deref(), Some("100200"));
    }

    #[test]
    fn inline_errors_stay_bounded() {
        let mut cp = Checkpoint::new("embedding", 0);
        for i in 0..500 {
            cp.record_failure(&format!("{:06}", i), "boom");
        }
        assert_eq!(cp.errors.len(), MAX_INLINE_ERRORS);
        assert_eq!(cp.failed, 500);
        // Oldest entries were dropped, newest kept.
        assert_eq!(cp.errors.last().unwrap().key, "000499");
    }

    #[test]
    fn error_log_appends_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ErrorLog::open(tmp.path(), "narrative").unwrap();
        log.append("100001", "rate limited").unwrap();
        log.append("100002", "empty response").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["key"], "100001");
    }
}
