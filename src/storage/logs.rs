//! Log blobs: one UTF-8 text file per execution and per (execution, script).

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::model::{ExecutionId, ScriptId};

pub trait LogStore: Send + Sync {
    /// Write the full report of an execution; returns the stable key.
    fn write_execution_log(&self, execution_id: ExecutionId, text: &str) -> Result<String>;
    /// Write the output of one script within an execution; returns the stable key.
    fn write_result_log(&self, execution_id: ExecutionId, script_id: ScriptId, text: &str) -> Result<String>;
}

pub fn execution_log_key(execution_id: ExecutionId) -> String {
    format!("logs/execution_{execution_id}.txt")
}

pub fn result_log_key(execution_id: ExecutionId, script_id: ScriptId) -> String {
    format!("logs/execution_{execution_id}_script_{script_id}.txt")
}

/// Stores blobs under a media root directory, keyed by relative path.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn write(&self, key: String, text: &str) -> Result<String> {
        let path = self.root.join(&key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write log {}", path.display()))?;
        Ok(key)
    }
}

impl LogStore for FsLogStore {
    fn write_execution_log(&self, execution_id: ExecutionId, text: &str) -> Result<String> {
        self.write(execution_log_key(execution_id), text)
    }

    fn write_result_log(&self, execution_id: ExecutionId, script_id: ScriptId, text: &str) -> Result<String> {
        self.write(result_log_key(execution_id, script_id), text)
    }
}
