//! VPN rule kind: provisions per (configuration, VPN membership) pair.

use super::{organization_matches, RuleTypeHandler};
use crate::models::{SubdivisionRule, Target};
use crate::store::Store;

/// Targets memberships whose VPN server network is backed by the rule's
/// master block. Driven by membership-created (template attach) and
/// membership-removed events. After provisioning, assigns the first
/// provisioned address as the membership's own tunnel address.
pub struct VpnRuleType;

impl VpnRuleType {
    /// Whether `membership` belongs to a VPN whose network is this rule's
    /// master block.
    fn vpn_matches(rule: &SubdivisionRule, store: &Store, membership: crate::models::MembershipId) -> bool {
        let Some(membership) = store.membership(membership) else {
            return false;
        };
        match store.vpn(membership.vpn) {
            Some(vpn) => vpn.subnet == Some(rule.master_block),
            None => false,
        }
    }
}

impl RuleTypeHandler for VpnRuleType {
    fn applies_to(&self, rule: &SubdivisionRule, store: &Store, target: &Target) -> bool {
        let Target::Membership { config, membership } = target else {
            return false;
        };
        if !Self::vpn_matches(rule, store, *membership) {
            return false;
        }
        match store.config(*config) {
            Some(config) => organization_matches(rule, config.organization),
            None => false,
        }
    }

    fn resolve_targets(&self, rule: &SubdivisionRule, store: &Store) -> Vec<Target> {
        store
            .memberships()
            .filter(|m| Self::vpn_matches(rule, store, m.id))
            .filter(|m| match store.config(m.config) {
                Some(config) => organization_matches(rule, config.organization),
                None => false,
            })
            .map(|m| Target::Membership {
                config: m.config,
                membership: m.id,
            })
            .collect()
    }

    /// Assign the address indexed under `{label}_subnet1_ip1` as the
    /// membership's tunnel address, unless one is already assigned.
    fn post_provision(&self, rule: &SubdivisionRule, target: &Target, store: &mut Store) {
        let Target::Membership { membership, .. } = target else {
            return;
        };
        let already_assigned = match store.membership(*membership) {
            Some(m) => m.address.is_some(),
            None => return,
        };
        if already_assigned {
            return;
        }
        let keyword = format!("{}_subnet1_ip1", rule.label);
        let address = store
            .entry_by_keyword(rule.id, target, &keyword)
            .and_then(|entry| entry.address);
        if let Some(address) = address {
            store.set_membership_address(*membership, Some(address));
            log::debug!("Assigned tunnel address to membership {membership}");
        }
    }
}
