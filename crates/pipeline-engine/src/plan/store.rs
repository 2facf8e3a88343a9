//! Plan storage with file persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::Plan;
use crate::error::{EngineError, Result};

/// Metadata for a plan (for listing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub uuid: String,
    pub name: String,
    pub node_count: usize,
}

/// In-memory plan store with optional file persistence.
///
/// Plans are immutable once inserted and handed out as `Arc<Plan>`, so the
/// engine can hold one across awaits without cloning the graph.
///
/// # Example
///
/// ```ignore
/// let store = PlanStore::with_persistence(".pipelines/plans");
/// let count = store.load_from_disk()?;
/// store.insert_plan(plan)?;
/// ```
#[derive(Debug, Default)]
pub struct PlanStore {
    plans: RwLock<HashMap<String, Arc<Plan>>>,
    persist_path: Option<PathBuf>,
}

impl PlanStore {
    /// Create a new in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory.
    ///
    /// The directory will be created if it doesn't exist when saving.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load all plans from the persistence directory.
    ///
    /// Returns the number of plans loaded. Unparseable or invalid files are
    /// skipped with a warning.
    pub fn load_from_disk(&self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };

        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();

            if file_path.extension().is_some_and(|e| e == "json") {
                let content = std::fs::read_to_string(&file_path)?;
                match serde_json::from_str::<Plan>(&content) {
                    Ok(plan) => {
                        if let Err(e) = plan.validate() {
                            log::warn!("Skipping invalid plan in {:?}: {}", file_path, e);
                            continue;
                        }
                        log::info!("Loaded plan '{}' from {:?}", plan.uuid, file_path);
                        self.plans.write().insert(plan.uuid.clone(), Arc::new(plan));
                        count += 1;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse plan from {:?}: {}", file_path, e);
                    }
                }
            }
        }
        Ok(count)
    }

    fn save_to_disk(&self, plan: &Plan) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.json", &plan.uuid));
        let content = serde_json::to_string_pretty(plan)?;
        std::fs::write(&file_path, content)?;
        log::debug!("Saved plan '{}' to {:?}", plan.uuid, file_path);
        Ok(())
    }

    fn delete_from_disk(&self, id: &str) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        let file_path = path.join(format!("{}.json", id));
        if file_path.exists() {
            std::fs::remove_file(&file_path)?;
            log::debug!("Deleted plan '{}' from {:?}", id, file_path);
        }
        Ok(())
    }

    /// Validate, persist and insert a plan, replacing any plan with the same id.
    pub fn insert_plan(&self, plan: Plan) -> Result<Arc<Plan>> {
        plan.validate()?;
        self.save_to_disk(&plan)?;
        let plan = Arc::new(plan);
        self.plans.write().insert(plan.uuid.clone(), plan.clone());
        Ok(plan)
    }

    pub fn get_plan(&self, id: &str) -> Result<Arc<Plan>> {
        self.plans
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("Plan", id))
    }

    pub fn remove_plan(&self, id: &str) -> Result<Option<Arc<Plan>>> {
        self.delete_from_disk(id)?;
        Ok(self.plans.write().remove(id))
    }

    pub fn list_plans(&self) -> Vec<PlanMetadata> {
        let mut plans: Vec<_> = self
            .plans
            .read()
            .values()
            .map(|p| PlanMetadata {
                uuid: p.uuid.clone(),
                name: p.name.clone(),
                node_count: p.nodes.len(),
            })
            .collect();
        plans.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        plans
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plans.read().contains_key(id)
    }
}
