// ── Engine facade ──
//
// Wires the feature modules, the sync orchestrator and the dispatcher
// to one store, queue and device registry, and owns the background
// loop consuming job events.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compat::messages;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::feature::{ApplyOutcome, ApplyRequest, FeatureContext, FeatureModule, default_modules};
use crate::model::{DeviceId, JobId, Task};
use crate::queue::JobQueue;
use crate::registry::DeviceRegistry;
use crate::store::Store;
use crate::sync::SyncOrchestrator;

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Call [`start()`](Self::start)
/// before expecting job callbacks to settle device state, and
/// [`shutdown()`](Self::shutdown) to drain them.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: Arc<FeatureContext>,
    dispatcher: Arc<Dispatcher>,
    sync: Arc<SyncOrchestrator>,
    registry: Arc<dyn DeviceRegistry>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Self, CoreError> {
        let ctx = Arc::new(FeatureContext::new(config, store, queue));
        let modules = default_modules(&ctx);
        let sync = Arc::new(SyncOrchestrator::new(Arc::clone(&ctx), &modules));
        let dispatcher = Dispatcher::builder()
            .register_all(modules)?
            .register(Arc::clone(&sync) as Arc<dyn FeatureModule>)?
            .build();

        Ok(Self {
            inner: Arc::new(EngineInner {
                ctx,
                dispatcher: Arc::new(dispatcher),
                sync,
                registry,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.ctx.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.inner.ctx.queue
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Register removal handlers and spawn the dispatcher loop.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Err(CoreError::Internal("engine already started".into()));
        }
        let queue = &self.inner.ctx.queue;
        self.inner
            .dispatcher
            .register_remove_methods(queue.as_ref());
        let events = queue
            .subscribe()
            .await
            .ok_or_else(|| CoreError::Internal("job event stream already taken".into()))?;

        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let cancel = self.inner.cancel.clone();
        *task = Some(tokio::spawn(dispatcher.run(events, cancel)));
        info!(methods = ?self.inner.dispatcher.methods(), "engine started");
        Ok(())
    }

    /// Stop the dispatcher loop after it drains buffered events.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher task ended abnormally");
            }
        }
        debug!("engine shut down");
    }

    // ── Operations ───────────────────────────────────────────────────

    pub async fn apply(
        &self,
        devices: Vec<DeviceId>,
        method: &str,
        user: &str,
        data: Value,
    ) -> Result<ApplyOutcome, CoreError> {
        let request = ApplyRequest {
            devices,
            user: user.to_owned(),
            data,
        };
        self.inner.dispatcher.apply(method, &request).await
    }

    pub async fn request_sync(
        &self,
        device: &DeviceId,
        force: bool,
    ) -> Result<Option<JobId>, CoreError> {
        self.inner.sync.request_sync(device, force).await
    }

    /// Handle a device connect: refresh its versions from the registry
    /// and sync it unless the configuration it reports is current.
    pub async fn device_connected(&self, device: &DeviceId) -> Result<Option<JobId>, CoreError> {
        let conn = self
            .inner
            .registry
            .connection(device)
            .await?
            .filter(|c| c.connected)
            .ok_or_else(|| CoreError::DeviceUnreachable {
                device: device.to_string(),
            })?;
        self.inner
            .sync
            .on_device_connected(device, conn.versions, conn.sync_hash.as_deref())
            .await
    }

    /// Send one query-style task and wait for the reply. Bounded by the
    /// configured device timeout; never retried.
    pub async fn query_device(&self, device: &DeviceId, task: Task) -> Result<Value, CoreError> {
        let registry = &self.inner.registry;
        if !registry.is_connected(device).await? {
            return Err(CoreError::DeviceUnreachable {
                device: device.to_string(),
            });
        }
        let timeout = self.inner.ctx.config.device_request_timeout;
        debug!(device = %device, message = %task.message, "device request");
        tokio::time::timeout(timeout, registry.request(device, &task, timeout))
            .await
            .map_err(|_| CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            })?
    }

    pub async fn router_config(&self, device: &DeviceId) -> Result<Value, CoreError> {
        self.query_device(
            device,
            Task::agent(messages::GET_ROUTER_CONFIG, json!({})),
        )
        .await
    }
}
