//! Device rule kind: provisions per registered device configuration.

use super::{organization_matches, RuleTypeHandler};
use crate::models::{SubdivisionRule, Target};
use crate::store::Store;

/// Targets every registered device configuration in the rule's organization
/// scope, independent of any VPN membership. Driven by device-registered
/// and device-deleted events.
pub struct DeviceRuleType;

impl RuleTypeHandler for DeviceRuleType {
    fn applies_to(&self, rule: &SubdivisionRule, store: &Store, target: &Target) -> bool {
        let Target::Config(config_id) = target else {
            return false;
        };
        match store.config(*config_id) {
            Some(config) => organization_matches(rule, config.organization),
            None => false,
        }
    }

    fn resolve_targets(&self, rule: &SubdivisionRule, store: &Store) -> Vec<Target> {
        store
            .configs()
            .filter(|config| organization_matches(rule, config.organization))
            .map(|config| Target::Config(config.id))
            .collect()
    }
}
