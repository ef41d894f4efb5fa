//! Persisted record of provisioned workspaces, so `ListActive`/`Gc` don't
//! need to re-derive state from the filesystem on every call.

use serde::{Deserialize, Serialize};
use undercity_core::model::workspace::Workspace;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    pub workspaces: Vec<Workspace>,
}

impl Registry {
    pub fn find(&self, task_id: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.task_id.as_str() == task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Workspace> {
        let idx = self.workspaces.iter().position(|w| w.task_id.as_str() == task_id)?;
        Some(self.workspaces.remove(idx))
    }

    pub fn upsert(&mut self, workspace: Workspace) {
        if let Some(existing) = self
            .workspaces
            .iter_mut()
            .find(|w| w.task_id == workspace.task_id)
        {
            *existing = workspace;
        } else {
            self.workspaces.push(workspace);
        }
    }
}
