//! Fleet runtime: the engine wired to the state file.
//!
//! Every command that touches devices or jobs opens the snapshot, runs
//! against an in-memory store and queue, lets the dispatcher drain job
//! events, and writes the snapshot back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use edgesync_config::Config;
use edgesync_core::{
    DeviceRegistry, Engine, FleetSnapshot, HttpRegistry, JobQueue, MemoryJobQueue, MemoryStore,
    Store,
};

use crate::error::CliError;

pub struct Fleet {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    state: PathBuf,
}

impl Fleet {
    /// Load the snapshot at `state` and start an engine over it.
    pub async fn open(
        state: PathBuf,
        cfg: &Config,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Self, CliError> {
        let snapshot = FleetSnapshot::load(&state)?;
        debug!(
            path = %state.display(),
            devices = snapshot.devices.len(),
            jobs = snapshot.queue.jobs.len(),
            "fleet state loaded"
        );
        let (store, queue) = snapshot.restore();
        let store = Arc::new(store);
        let queue = Arc::new(queue);

        let engine = Engine::new(
            cfg.engine_config()?,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            registry,
        )?;
        engine.start().await?;

        Ok(Self {
            engine,
            store,
            queue,
            state,
        })
    }

    /// Drain pending callbacks and persist the fleet.
    pub async fn close(self) -> Result<(), CliError> {
        self.engine.shutdown().await;
        FleetSnapshot::capture(&self.store, &self.queue).save(&self.state)?;
        debug!(path = %self.state.display(), "fleet state saved");
        Ok(())
    }
}

/// Registry backed by the configured connection service.
pub fn live_registry(
    cfg: &Config,
    config_path: &Path,
) -> Result<Arc<dyn DeviceRegistry>, CliError> {
    let client = cfg.registry_client()?.ok_or_else(|| CliError::NoRegistry {
        path: config_path.display().to_string(),
    })?;
    Ok(Arc::new(HttpRegistry::new(client)))
}
