//! Per-stage JSON cache.
//!
//! Each calibration stage writes one self-describing JSON file into the cache
//! directory. A later run with the same cache directory resumes after the
//! last completed stage instead of recomputing it.
//!
//! Robustness rules:
//!
//! - a missing, unreadable, schema-mismatched, or wrong-stage file is a MISS
//!   (the stage reruns); it never aborts the run
//! - files are written to a temp name and atomically renamed, so a crash
//!   mid-write cannot leave a half-written stage behind

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::StageTable;
use crate::error::AppError;

/// Bump when `StageFile`/`StageTable` change incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

const TOOL_NAME: &str = "poolfit";

/// On-disk envelope around a stage table.
#[derive(Debug, Serialize, Deserialize)]
struct StageFile {
    tool: String,
    schema_version: u32,
    created: String,
    seed: u64,
    table: StageTable,
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheRead {
    Hit(StageTable),
    Miss,
    /// Unusable file; the reason is reported and the stage reruns.
    Corrupt(String),
}

/// Handle on the run's cache directory.
#[derive(Debug, Clone)]
pub struct StageCache {
    dir: PathBuf,
}

impl StageCache {
    /// Open (creating if needed) the cache directory.
    pub fn open(dir: &Path) -> Result<Self, AppError> {
        fs::create_dir_all(dir).map_err(|e| {
            AppError::new(
                2,
                format!("Failed to create cache directory '{}': {e}", dir.display()),
            )
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn stage_path(&self, stage: usize) -> PathBuf {
        self.dir.join(format!("stage_{stage}.json"))
    }

    /// Look up a completed stage.
    pub fn load(&self, stage: usize, n_pools: usize) -> CacheRead {
        let path = self.stage_path(stage);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheRead::Miss,
            Err(e) => return CacheRead::Corrupt(format!("unreadable ({e})")),
        };

        let file: StageFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => return CacheRead::Corrupt(format!("invalid JSON ({e})")),
        };

        if file.tool != TOOL_NAME || file.schema_version != SCHEMA_VERSION {
            return CacheRead::Corrupt(format!(
                "schema mismatch (tool '{}', version {})",
                file.tool, file.schema_version
            ));
        }
        if file.table.stage != stage || file.table.n_pools != n_pools {
            return CacheRead::Corrupt(format!(
                "wrong stage content (stage {}, {} pools)",
                file.table.stage, file.table.n_pools
            ));
        }
        if let Some(bad) = file
            .table
            .entries
            .iter()
            .find_map(|e| e.params.validate().err())
        {
            return CacheRead::Corrupt(format!("invalid stored parameters ({bad})"));
        }
        CacheRead::Hit(file.table)
    }

    /// Persist a completed stage atomically.
    pub fn store(&self, table: &StageTable, seed: u64) -> Result<(), AppError> {
        let file = StageFile {
            tool: TOOL_NAME.to_string(),
            schema_version: SCHEMA_VERSION,
            created: chrono::Local::now().to_rfc3339(),
            seed,
            table: table.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AppError::new(4, format!("Failed to serialize stage table: {e}")))?;

        let path = self.stage_path(table.stage);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| {
            AppError::new(2, format!("Failed to write '{}': {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            AppError::new(2, format!("Failed to move '{}' into place: {e}", tmp.display()))
        })?;
        Ok(())
    }
}
