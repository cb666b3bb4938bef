//! Explicit core → lifecycle manager registry
//!
//! Built once at startup by the composition root. A core without a manager
//! is a structural fact callers handle as `None`, not a runtime guess.

use crate::core::Core;
use crate::lifecycle::ServerLifecycleManager;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct CoreRegistry {
    managers: HashMap<Core, Arc<ServerLifecycleManager>>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manager: Arc<ServerLifecycleManager>) {
        self.managers.insert(manager.core(), manager);
    }

    pub fn get(&self, core: Core) -> Option<&Arc<ServerLifecycleManager>> {
        self.managers.get(&core)
    }

    /// Stop every tracked tunnel on every manager; used at shutdown.
    pub async fn cleanup_all(&self) {
        for manager in self.managers.values() {
            manager.cleanup_all().await;
        }
    }
}
