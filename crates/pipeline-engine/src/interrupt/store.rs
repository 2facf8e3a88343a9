//! Interrupt persistence

use async_trait::async_trait;

use super::{Interrupt, InterruptType};
use crate::error::Result;
use crate::persistence::{VersionedMap, VersionedStore};

/// Persistence boundary for interrupts.
#[async_trait]
pub trait InterruptStore: VersionedStore<Interrupt> {
    /// All interrupts of a plan execution, oldest first.
    async fn fetch_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>>;

    /// Registered or processing interrupts of the given type.
    async fn fetch_active(
        &self,
        plan_execution_id: &str,
        interrupt_type: InterruptType,
    ) -> Result<Vec<Interrupt>> {
        Ok(self
            .fetch_for_plan(plan_execution_id)
            .await?
            .into_iter()
            .filter(|i| i.interrupt_type == interrupt_type && i.state.is_active())
            .collect())
    }
}

pub type InMemoryInterruptStore = VersionedMap<Interrupt>;

#[async_trait]
impl InterruptStore for VersionedMap<Interrupt> {
    async fn fetch_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>> {
        let mut interrupts = self.find(|i| i.plan_execution_id == plan_execution_id);
        interrupts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(interrupts)
    }
}
