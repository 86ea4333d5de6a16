//! Address-space subdivision and provisioning engine.
//!
//! Given a master IP block and a declarative [`SubdivisionRule`], the engine
//! deterministically partitions the block into sub-blocks and host
//! addresses, indexes them under human-readable keywords per target, and
//! keeps the index consistent as devices are registered and removed, VPN
//! memberships change, and rules are edited. Collaborators publish
//! [`TriggerEvent`]s; the [`Engine`] reacts in idempotent background tasks
//! and exposes the result as a flat keyword -> value context per
//! configuration.

pub mod allocator;
pub mod context;
mod engine;
pub mod errors;
mod events;
pub mod models;
pub mod output;
pub mod rule_types;
pub mod store;

pub use engine::{Engine, NewRule, RuleChange, RuleUpdate};
pub use errors::{CapacityError, CidrError, EngineError, NotFoundError, ValidationError};
pub use events::{
    LogNotificationSink, Notification, NotificationLevel, NotificationSink, ProvisionedEvent,
    TriggerEvent,
};
pub use models::{Cidr, RuleKind, SubdivisionRule, Target};
pub use store::Store;
