//! Rule-type handlers binding rule lifecycle to trigger events.
//!
//! A [`RuleTypeHandler`] decides which targets a rule is in scope for and
//! runs rule-kind-specific work after provisioning. New target kinds are
//! added by implementing the trait, not by special-casing the engine:
//! - [`DeviceRuleType`] - one provisioning pass per registered device
//! - [`VpnRuleType`] - one pass per (configuration, VPN membership) pair

mod device;
mod vpn;

pub use device::DeviceRuleType;
pub use vpn::VpnRuleType;

use crate::models::{RuleKind, SubdivisionRule, Target};
use crate::store::Store;

/// Capability interface of a rule kind.
pub trait RuleTypeHandler {
    /// Whether `target` is currently in scope for `rule`.
    fn applies_to(&self, rule: &SubdivisionRule, store: &Store, target: &Target) -> bool;

    /// All currently matching targets, used to backfill a freshly created
    /// rule over pre-existing devices and memberships.
    fn resolve_targets(&self, rule: &SubdivisionRule, store: &Store) -> Vec<Target>;

    /// Hook run right after `target` was provisioned, with the store still
    /// locked.
    fn post_provision(&self, _rule: &SubdivisionRule, _target: &Target, _store: &mut Store) {}
}

/// The handler implementing `kind`.
pub fn handler_for(kind: RuleKind) -> &'static dyn RuleTypeHandler {
    match kind {
        RuleKind::Device => &DeviceRuleType,
        RuleKind::Vpn => &VpnRuleType,
    }
}

/// Shared tenant filter: a shared rule matches any organization, a scoped
/// rule only its own.
pub(crate) fn organization_matches(rule: &SubdivisionRule, organization: crate::models::OrgId) -> bool {
    match rule.organization {
        None => true,
        Some(org) => org == organization,
    }
}
