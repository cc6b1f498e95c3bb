// ── Domain model ──
//
// Canonical types shared by every feature module: devices and their
// feature states, desired policy documents, jobs and tasks.

pub mod device;
pub mod entity_id;
pub mod feature;
pub mod job;
pub mod policy;
pub mod version;

pub use device::{
    AppClient, Device, DeviceVersions, DhcpConfig, DhcpEntry, DhcpOption, Interface,
    InterfaceKind, MacAssignment, StaticRoute, StaticRouteEntry, SyncState, SyncStatus,
    UpgradeState, VrrpMembership,
};
pub use entity_id::{DeviceId, JobId, OrgId, PolicyId};
pub use feature::{Feature, FeatureState, FeatureStatus};
pub use job::{Job, JobOptions, JobPriority, JobState, ResponseMeta, Task};
pub use policy::{
    AppIdentification, Application, FilterAction, FirewallDirection, FirewallPolicy,
    FirewallRule, NotificationsConfig, PolicyDocument, QosPolicy, QueueShare, RoutingFilter,
    RoutingFilterRule, Threshold, TrafficClass, TrafficMap, VrrpGroup, VrrpMember,
};
pub use version::AgentVersion;
