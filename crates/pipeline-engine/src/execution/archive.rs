//! Compressed snapshots of completed plan executions
//!
//! Once a plan execution is final its node executions no longer change.
//! The archive keeps a zstd-compressed JSON snapshot of all of them, keyed
//! by plan execution id.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::NodeExecution;
use crate::error::{EngineError, Result};

pub struct ExecutionArchive {
    level: i32,
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl ExecutionArchive {
    /// Create an archive compressing at the given zstd level
    pub fn new(level: i32) -> Self {
        Self {
            level,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot `nodes` under `plan_execution_id`, replacing any earlier
    /// snapshot. Returns the compressed size.
    pub fn archive(&self, plan_execution_id: &str, nodes: &[NodeExecution]) -> Result<usize> {
        let json = serde_json::to_vec(nodes)?;
        let compressed = zstd::encode_all(&json[..], self.level)
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        let size = compressed.len();
        log::debug!(
            "Archived {} node executions of {} ({} -> {} bytes)",
            nodes.len(),
            plan_execution_id,
            json.len(),
            size
        );
        self.snapshots
            .write()
            .insert(plan_execution_id.to_string(), compressed);
        Ok(size)
    }

    pub fn restore(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let snapshots = self.snapshots.read();
        let compressed = snapshots
            .get(plan_execution_id)
            .ok_or_else(|| EngineError::not_found("ArchivedPlanExecution", plan_execution_id))?;
        let json = zstd::decode_all(&compressed[..])
            .map_err(|e| EngineError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn contains(&self, plan_execution_id: &str) -> bool {
        self.snapshots.read().contains_key(plan_execution_id)
    }

    /// Total compressed size of all snapshots
    pub fn compressed_size(&self) -> usize {
        self.snapshots.read().values().map(Vec::len).sum()
    }
}

impl Default for ExecutionArchive {
    fn default() -> Self {
        Self::new(crate::config::defaults::COMPRESSION_LEVEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::test_support::node;

    #[test]
    fn test_archive_and_restore() {
        let archive = ExecutionArchive::default();
        let nodes = vec![node("pe", "a"), node("pe", "b")];

        let size = archive.archive("pe", &nodes).unwrap();
        assert!(size > 0);
        assert!(archive.contains("pe"));
        assert_eq!(archive.compressed_size(), size);

        let restored = archive.restore("pe").unwrap();
        assert_eq!(restored, nodes);
    }

    #[test]
    fn test_restore_missing() {
        let archive = ExecutionArchive::new(1);
        assert!(archive.restore("nope").unwrap_err().is_not_found());
        assert!(!archive.contains("nope"));
    }
}
