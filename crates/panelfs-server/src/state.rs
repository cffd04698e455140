use std::sync::Arc;

use panelfs_core::{EngineConfig, TaskRegistry};
use panelfs_ops::TaskEngine;
use panelfs_upload::ChunkStore;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: TaskEngine,
    pub uploads: Arc<ChunkStore>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        let uploads = Arc::new(ChunkStore::from_config(&config));
        let engine = TaskEngine::new(Arc::new(TaskRegistry::new()), config);
        Self { engine, uploads }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.engine.registry()
    }

    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }
}
