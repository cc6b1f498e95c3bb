//! Device job orchestration and state-sync engine for an SD-WAN fleet.
//!
//! Operators apply configuration to many devices at once; this crate turns
//! each request into one job per device, tracks per-device feature state
//! through the job lifecycle, and can rebuild a device's whole
//! configuration in a single sync:
//!
//! - **[`Engine`]**: Facade wiring the modules to a [`Store`], a
//!   [`JobQueue`] and a [`DeviceRegistry`]. [`start()`](Engine::start) spawns
//!   the dispatcher loop consuming job events.
//!
//! - **[`Dispatcher`]**: Static method table routing `apply` and the job
//!   callbacks (`complete`, `error`, `remove`) to feature modules.
//!
//! - **[`FeatureModule`]**: One per feature (QoS policy and traffic map,
//!   application identification, firewall, notifications, DHCP, static
//!   routes, VRRP, interface modify, upgrade). Each persists the pending
//!   transition before enqueueing and settles it from callbacks guarded by
//!   request time.
//!
//! - **[`SyncOrchestrator`]**: Concatenates every module's desired state in
//!   a fixed order and fingerprints it so unchanged devices are left alone.
//!
//! - **[`compat`]**: Pure functions shaping parameters for each agent
//!   version.

pub mod clock;
pub mod compat;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod feature;
pub mod model;
pub mod queue;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use engine::Engine;
pub use error::CoreError;
pub use fanout::{DeviceFailure, FanOut, fan_out};
pub use feature::{ApplyOutcome, ApplyRequest, ApplyStatus, FeatureModule, SyncContribution};
pub use queue::{JobEvent, JobQueue, JobRequest, MemoryJobQueue, QueueError, QueueSnapshot};
pub use registry::{ConnectionInfo, DeviceRegistry, HttpRegistry, MemoryRegistry};
pub use snapshot::FleetSnapshot;
pub use store::{MemoryStore, Store, StoreError};
pub use sync::SyncOrchestrator;

pub use model::{
    AgentVersion, Device, DeviceId, Feature, FeatureState, FeatureStatus, Job, JobId, JobState,
    OrgId, PolicyDocument, PolicyId, SyncStatus, Task,
};
