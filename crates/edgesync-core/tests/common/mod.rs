// Shared fleet harness for scenario tests.
#![allow(clippy::unwrap_used, dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use edgesync_core::model::{Interface, InterfaceKind};
use edgesync_core::{
    ApplyOutcome, Device, DeviceId, Engine, EngineConfig, Job, JobEvent, JobId, JobQueue,
    MemoryJobQueue, MemoryRegistry, MemoryStore, PolicyDocument, Store,
};

pub struct Fleet {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub registry: Arc<MemoryRegistry>,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl Fleet {
    /// An engine whose job events are pumped by hand, so every test
    /// controls exactly when callbacks run.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let registry = Arc::new(MemoryRegistry::new());
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&registry) as _,
        )
        .unwrap();
        engine
            .dispatcher()
            .register_remove_methods(queue.as_ref());
        let events = queue.subscribe().await.unwrap();
        Self {
            engine,
            store,
            queue,
            registry,
            events,
        }
    }

    pub async fn add_device(&self, device: Device) {
        self.store.put_device(device).await.unwrap();
    }

    pub fn add_policy(&self, doc: PolicyDocument) {
        self.store.put_policy(doc);
    }

    pub async fn device(&self, id: &str) -> Device {
        self.store.device(&id.into()).await.unwrap().unwrap()
    }

    pub async fn apply(&self, method: &str, devices: &[&str], data: Value) -> ApplyOutcome {
        self.engine
            .apply(
                devices.iter().map(|d| DeviceId::from(*d)).collect(),
                method,
                "ops",
                data,
            )
            .await
            .unwrap()
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.queue.job(id).await.unwrap().unwrap()
    }

    /// Route every queued job event through the dispatcher.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.engine.dispatcher().handle(event).await;
        }
    }

    pub async fn complete(&mut self, id: JobId) {
        self.queue.complete(id, Value::Null).unwrap();
        self.pump().await;
    }

    pub async fn fail(&mut self, id: JobId, reason: &str) {
        self.queue.fail(id, reason).unwrap();
        self.pump().await;
    }

    pub async fn remove(&mut self, id: JobId) {
        self.queue.remove(id).unwrap();
        self.pump().await;
    }
}

pub fn wan(dev_id: &str) -> Interface {
    Interface {
        dev_id: dev_id.into(),
        name: format!("wan-{dev_id}"),
        assigned: true,
        kind: InterfaceKind::Wan,
        ip: Some("100.64.0.2/24".into()),
        gateway: Some("100.64.0.1".into()),
        metric: Some(0),
        routing: Vec::new(),
        qos_policy: None,
    }
}

pub fn lan(dev_id: &str, ip: &str) -> Interface {
    Interface {
        dev_id: dev_id.into(),
        name: format!("lan-{dev_id}"),
        assigned: true,
        kind: InterfaceKind::Lan,
        ip: Some(ip.into()),
        gateway: None,
        metric: None,
        routing: Vec::new(),
        qos_policy: None,
    }
}

/// Approved device in org `o1` with two WANs and one LAN.
pub fn edge(id: &str, agent: &str) -> Device {
    let mut dev = Device::new(id, "o1");
    dev.name = id.to_uppercase();
    dev.versions.agent = Some(agent.into());
    dev.interfaces = vec![wan("X"), wan("Y"), lan("L", "192.168.1.2/24")];
    dev
}

/// Message names of a job, with aggregated wrappers expanded.
pub fn messages(job: &Job) -> Vec<String> {
    job.flat_tasks().into_iter().map(|t| t.message).collect()
}
