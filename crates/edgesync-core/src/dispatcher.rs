// ── Dispatcher ──
//
// Static method table from method name to feature module, built once.
// `apply` is the synchronous entry point; job lifecycle events arrive
// on the queue's event stream and are routed by a dedicated loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::feature::{ApplyOutcome, ApplyRequest, FeatureModule};
use crate::model::Job;
use crate::queue::{JobEvent, JobQueue};

// ── Builder ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DispatcherBuilder {
    modules: HashMap<String, Arc<dyn FeatureModule>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module under its method name. A second module claiming the
    /// same name is rejected.
    pub fn register(mut self, module: Arc<dyn FeatureModule>) -> Result<Self, CoreError> {
        let method = module.method().to_string();
        if self.modules.contains_key(&method) {
            return Err(CoreError::DuplicateMethod { method });
        }
        self.modules.insert(method, module);
        Ok(self)
    }

    pub fn register_all(
        self,
        modules: impl IntoIterator<Item = Arc<dyn FeatureModule>>,
    ) -> Result<Self, CoreError> {
        modules.into_iter().try_fold(self, Self::register)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            modules: self.modules,
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

pub struct Dispatcher {
    modules: HashMap<String, Arc<dyn FeatureModule>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    fn module(&self, method: &str) -> Option<&Arc<dyn FeatureModule>> {
        self.modules.get(method)
    }

    /// Tell the queue which methods want `Removed` events.
    pub fn register_remove_methods(&self, queue: &dyn JobQueue) {
        for (method, module) in &self.modules {
            if module.handles_remove() {
                queue.register_remove_method(method);
            }
        }
    }

    pub async fn apply(
        &self,
        method: &str,
        request: &ApplyRequest,
    ) -> Result<ApplyOutcome, CoreError> {
        let module = self.module(method).ok_or_else(|| CoreError::UnknownMethod {
            method: method.to_owned(),
        })?;
        debug!(method, devices = request.devices.len(), user = %request.user, "apply");
        module.apply(request).await
    }

    pub async fn complete(&self, job: &Job, result: &Value) {
        let method = job.completion_method();
        match self.module(method) {
            Some(module) => module.complete(job, result).await,
            None => warn!(job = %job.id, device = %job.device, method, "completion for unknown method"),
        }
    }

    pub async fn error(&self, job: &Job, reason: &str) {
        let method = job.meta.method.as_str();
        match self.module(method) {
            Some(module) => module.error(job, reason).await,
            None => warn!(job = %job.id, device = %job.device, method, "error for unknown method"),
        }
    }

    pub async fn remove(&self, job: &Job) {
        let method = job.meta.method.as_str();
        match self.module(method) {
            Some(module) if module.handles_remove() => module.remove(job).await,
            Some(_) => debug!(job = %job.id, method, "module ignores job removal"),
            None => warn!(job = %job.id, device = %job.device, method, "removal for unknown method"),
        }
    }

    pub async fn handle(&self, event: JobEvent) {
        match event {
            JobEvent::Completed { job, result } => self.complete(&job, &result).await,
            JobEvent::Failed { job, reason } => self.error(&job, &reason).await,
            JobEvent::Removed { job } => self.remove(&job).await,
        }
    }

    /// Route queue events until cancelled, then drain what is already
    /// buffered so no callback is lost on shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<JobEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!("job event stream closed");
                        break;
                    }
                },
            }
        }

        let mut drained = 0_usize;
        while let Ok(event) = events.try_recv() {
            self.handle(event).await;
            drained += 1;
        }
        info!(drained, "dispatcher stopped");
    }
}
