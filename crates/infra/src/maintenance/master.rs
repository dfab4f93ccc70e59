use std::sync::atomic::{AtomicBool, Ordering};

/// Cluster leadership oracle. Only the master runs maintenance iterations.
pub trait MasterElection: Send + Sync {
    fn is_master(&self) -> bool;
}

/// Fixed (but switchable) leadership, for single-node deployments and tests.
#[derive(Debug)]
pub struct StaticMaster(AtomicBool);

impl StaticMaster {
    pub fn new(is_master: bool) -> Self {
        Self(AtomicBool::new(is_master))
    }

    pub fn set(&self, is_master: bool) {
        self.0.store(is_master, Ordering::SeqCst);
    }
}

impl Default for StaticMaster {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MasterElection for StaticMaster {
    fn is_master(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
