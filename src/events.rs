//! Trigger events consumed by the engine and the notifications it emits.
//!
//! Collaborators publish typed [`TriggerEvent`]s instead of reaching into
//! engine state; the engine reacts in background tasks. Failures the engine
//! degrades (capacity exhaustion) surface as [`Notification`]s through a
//! pluggable [`NotificationSink`]; successful provisioning passes surface
//! as [`ProvisionedEvent`]s to registered listeners.

use std::fmt;

use crate::models::{BlockId, ConfigId, DeviceConfig, EntryId, RuleId, Target, TemplateId};

/// An external event the engine reacts to.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// A configuration started using a template (may create a VPN
    /// membership).
    TemplateAttached {
        config: ConfigId,
        template: TemplateId,
    },
    /// A configuration stopped using a template.
    TemplateDetached {
        config: ConfigId,
        template: TemplateId,
    },
    /// A device became registered; carries its configuration.
    DeviceRegistered { config: DeviceConfig },
    /// A device was deleted.
    DeviceDeleted { config: ConfigId },
    /// A rule was created; triggers backfill over existing targets.
    RuleCreated { rule: RuleId },
    /// A rule was edited; carries the pre-edit state the follow-up work
    /// needs.
    RuleEdited {
        rule: RuleId,
        old_label: String,
        old_number_of_ips: u32,
    },
    /// A rule was deleted; triggers the ownership cascade.
    RuleDeleted { rule: RuleId },
}

/// Severity of an emitted notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "info"),
            NotificationLevel::Warning => write!(f, "warning"),
            NotificationLevel::Error => write!(f, "error"),
        }
    }
}

/// A failure report for a single target, delivered out of band.
#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    /// The target the provisioning pass was running for.
    pub target: Target,
    /// The block the report is about (e.g. the exhausted one).
    pub action_object: BlockId,
    pub message: String,
    pub description: String,
}

/// Delivery transport for notifications; the engine only emits.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Sink that writes notifications to the log. Useful as a default and for
/// the demo binary.
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn emit(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => log::error!(
                "[notification] {}: {} ({})",
                notification.target,
                notification.message,
                notification.description
            ),
            NotificationLevel::Warning => log::warn!(
                "[notification] {}: {} ({})",
                notification.target,
                notification.message,
                notification.description
            ),
            NotificationLevel::Info => log::info!(
                "[notification] {}: {} ({})",
                notification.target,
                notification.message,
                notification.description
            ),
        }
    }
}

/// Emitted after a target was fully provisioned under a rule.
#[derive(Debug, Clone)]
pub struct ProvisionedEvent {
    pub rule: RuleId,
    pub target: Target,
    /// The index entries the pass created.
    pub entries: Vec<EntryId>,
}
