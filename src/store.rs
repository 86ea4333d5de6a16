//! In-memory resource store for the subdivision engine.
//!
//! Stands in for the transactional relational store of a real deployment:
//! holds rules, blocks, addresses and index entries plus the collaborator
//! inventory, enforces keyword uniqueness within a `(rule, target)` scope,
//! and implements the ownership cascades (entries first, then addresses,
//! then blocks). The full state can be saved to and restored from a JSON
//! snapshot.

use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::net::IpAddr;
use std::path::Path;

use crate::models::{
    Address, AddressId, Block, BlockId, Cidr, ConfigId, DeviceConfig, EntryId, IndexEntry,
    MembershipId, OrgId, RuleId, SubdivisionRule, Target, Template, TemplateId, VpnId,
    VpnMembership, VpnServer,
};

/// Resources deleted by a cascade, in deletion order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CascadeCounts {
    pub entries: usize,
    pub addresses: usize,
    pub blocks: usize,
}

impl CascadeCounts {
    pub fn is_empty(&self) -> bool {
        self.entries == 0 && self.addresses == 0 && self.blocks == 0
    }
}

/// In-memory store of engine-owned resources and collaborator inventory.
#[derive(Debug, Default)]
pub struct Store {
    next_id: u64,
    rules: HashMap<RuleId, SubdivisionRule>,
    blocks: HashMap<BlockId, Block>,
    addresses: HashMap<AddressId, Address>,
    entries: HashMap<EntryId, IndexEntry>,
    configs: HashMap<ConfigId, DeviceConfig>,
    vpns: HashMap<VpnId, VpnServer>,
    templates: HashMap<TemplateId, Template>,
    memberships: HashMap<MembershipId, VpnMembership>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ---- rules -----------------------------------------------------------

    /// Insert a validated rule, assigning its id.
    pub fn insert_rule(&mut self, mut rule: SubdivisionRule) -> SubdivisionRule {
        rule.id = RuleId(self.next_id());
        self.rules.insert(rule.id, rule.clone());
        rule
    }

    pub fn rule(&self, id: RuleId) -> Option<&SubdivisionRule> {
        self.rules.get(&id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &SubdivisionRule> {
        self.rules.values().sorted_by_key(|r| r.id)
    }

    pub fn replace_rule(&mut self, rule: SubdivisionRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn remove_rule(&mut self, id: RuleId) -> Option<SubdivisionRule> {
        self.rules.remove(&id)
    }

    // ---- blocks and addresses -------------------------------------------

    /// Register a pre-existing master block (owned by a collaborator, never
    /// by a rule).
    pub fn add_master_block(
        &mut self,
        cidr: Cidr,
        name: &str,
        organization: Option<OrgId>,
    ) -> BlockId {
        let id = BlockId(self.next_id());
        self.blocks.insert(
            id,
            Block {
                id,
                cidr,
                name: name.to_string(),
                description: String::new(),
                organization,
                master: None,
                rule: None,
                reserved: false,
                created: Utc::now(),
            },
        );
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_derived_block(
        &mut self,
        cidr: Cidr,
        name: String,
        description: String,
        organization: Option<OrgId>,
        master: BlockId,
        rule: RuleId,
        reserved: bool,
    ) -> BlockId {
        let id = BlockId(self.next_id());
        self.blocks.insert(
            id,
            Block {
                id,
                cidr,
                name,
                description,
                organization,
                master: Some(master),
                rule: Some(rule),
                reserved,
                created: Utc::now(),
            },
        );
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn update_block_meta(&mut self, id: BlockId, name: String, description: String) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.name = name;
            block.description = description;
        }
    }

    /// All blocks carved from `master`, reserved ones included, in address
    /// order. The planner treats every one of them as occupied.
    pub fn blocks_under_master(&self, master: BlockId) -> Vec<&Block> {
        self.blocks
            .values()
            .filter(|b| b.master == Some(master))
            .sorted_by_key(|b| b.cidr)
            .collect()
    }

    /// All blocks owned by `rule`, reserved ones included, in address order.
    pub fn blocks_for_rule(&self, rule: RuleId) -> Vec<&Block> {
        self.blocks
            .values()
            .filter(|b| b.rule == Some(rule))
            .sorted_by_key(|b| b.cidr)
            .collect()
    }

    /// The reserved block row for `(master, cidr)`, if already materialized.
    pub fn find_reserved(&self, master: BlockId, cidr: &Cidr) -> Option<&Block> {
        self.blocks
            .values()
            .find(|b| b.reserved && b.master == Some(master) && b.cidr == *cidr)
    }

    pub fn add_address(
        &mut self,
        ip: IpAddr,
        block: BlockId,
        organization: Option<OrgId>,
        rule: RuleId,
    ) -> AddressId {
        let id = AddressId(self.next_id());
        self.addresses.insert(
            id,
            Address {
                id,
                ip,
                block,
                organization,
                rule: Some(rule),
                created: Utc::now(),
            },
        );
        id
    }

    pub fn address(&self, id: AddressId) -> Option<&Address> {
        self.addresses.get(&id)
    }

    // ---- index entries ---------------------------------------------------

    /// Insert an index entry. Keywords must be unique within the
    /// `(rule, target)` scope; a duplicate is a bug in the caller.
    pub fn add_entry(
        &mut self,
        keyword: String,
        rule: RuleId,
        target: Target,
        block: BlockId,
        address: Option<AddressId>,
    ) -> EntryId {
        assert!(
            !self.entry_exists(rule, &target, &keyword),
            "duplicate keyword {keyword:?} for rule {rule} and {target}"
        );
        let id = EntryId(self.next_id());
        self.entries.insert(
            id,
            IndexEntry {
                id,
                keyword,
                rule,
                target,
                block,
                address,
                created: Utc::now(),
            },
        );
        id
    }

    pub fn entry(&self, id: EntryId) -> Option<&IndexEntry> {
        self.entries.get(&id)
    }

    pub fn entry_exists(&self, rule: RuleId, target: &Target, keyword: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.rule == rule && e.target == *target && e.keyword == keyword)
    }

    pub fn entry_by_keyword(
        &self,
        rule: RuleId,
        target: &Target,
        keyword: &str,
    ) -> Option<&IndexEntry> {
        self.entries
            .values()
            .find(|e| e.rule == rule && e.target == *target && e.keyword == keyword)
    }

    pub fn entries_for_scope(&self, rule: RuleId, target: &Target) -> Vec<&IndexEntry> {
        self.entries
            .values()
            .filter(|e| e.rule == rule && e.target == *target)
            .sorted_by_key(|e| e.id)
            .collect()
    }

    pub fn entries_for_rule(&self, rule: RuleId) -> Vec<&IndexEntry> {
        self.entries
            .values()
            .filter(|e| e.rule == rule)
            .sorted_by_key(|e| e.id)
            .collect()
    }

    pub fn entries_for_config(&self, config: ConfigId) -> Vec<&IndexEntry> {
        self.entries
            .values()
            .filter(|e| e.target.config_id() == config)
            .sorted_by_key(|e| e.id)
            .collect()
    }

    pub fn update_entry_keyword(&mut self, id: EntryId, keyword: String) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.keyword = keyword;
        }
    }

    /// Distinct rules holding resources for exactly `target`.
    pub fn rules_for_target(&self, target: &Target) -> Vec<RuleId> {
        self.entries
            .values()
            .filter(|e| e.target == *target)
            .map(|e| e.rule)
            .sorted()
            .unique()
            .collect()
    }

    /// Distinct `(rule, target)` scopes holding resources for `config`.
    pub fn scopes_for_config(&self, config: ConfigId) -> Vec<(RuleId, Target)> {
        self.entries
            .values()
            .filter(|e| e.target.config_id() == config)
            .map(|e| (e.rule, e.target))
            .sorted_by_key(|(rule, _)| *rule)
            .unique()
            .collect()
    }

    // ---- cascades --------------------------------------------------------

    /// Delete everything scoped to `(rule, target)`: entries first, then
    /// addresses, then blocks. Other targets of the rule and other rules of
    /// the master are untouched.
    pub fn delete_scope(&mut self, rule: RuleId, target: &Target) -> CascadeCounts {
        let entry_ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.rule == rule && e.target == *target)
            .map(|e| e.id)
            .collect();
        let address_ids: Vec<AddressId> = entry_ids
            .iter()
            .filter_map(|id| self.entries.get(id).and_then(|e| e.address))
            .collect();
        let block_ids: Vec<BlockId> = entry_ids
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                entry.address.is_none().then_some(entry.block)
            })
            .collect();
        self.remove_resources(&entry_ids, &address_ids, &block_ids)
    }

    /// Delete everything a rule owns, the reserved block included — unless a
    /// surviving rule still walks the same `(master, cidr)` reservation, in
    /// which case the row is handed over to it.
    pub fn delete_rule_resources(&mut self, rule: RuleId) -> CascadeCounts {
        let entry_ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.rule == rule)
            .map(|e| e.id)
            .collect();
        let address_ids: Vec<AddressId> = self
            .addresses
            .values()
            .filter(|a| a.rule == Some(rule))
            .map(|a| a.id)
            .collect();
        let mut block_ids = Vec::new();
        let mut handovers = Vec::new();
        for block in self.blocks.values().filter(|b| b.rule == Some(rule)) {
            if block.reserved {
                let survivor = self.rules.values().find(|r| {
                    r.id != rule
                        && Some(r.master_block) == block.master
                        && r.size == block.cidr.prefix
                });
                if let Some(survivor) = survivor {
                    handovers.push((block.id, survivor.id));
                    continue;
                }
            }
            block_ids.push(block.id);
        }
        for (block_id, new_owner) in handovers {
            if let Some(block) = self.blocks.get_mut(&block_id) {
                block.rule = Some(new_owner);
            }
        }
        self.remove_resources(&entry_ids, &address_ids, &block_ids)
    }

    fn remove_resources(
        &mut self,
        entry_ids: &[EntryId],
        address_ids: &[AddressId],
        block_ids: &[BlockId],
    ) -> CascadeCounts {
        let mut counts = CascadeCounts::default();
        for id in entry_ids {
            if self.entries.remove(id).is_some() {
                counts.entries += 1;
            }
        }
        let removed_addresses: HashSet<AddressId> = address_ids.iter().copied().collect();
        for id in address_ids {
            if self.addresses.remove(id).is_some() {
                counts.addresses += 1;
            }
        }
        for id in block_ids {
            if self.blocks.remove(id).is_some() {
                counts.blocks += 1;
            }
        }
        // A membership tunnel address may have referenced a removed address.
        for membership in self.memberships.values_mut() {
            if let Some(address) = membership.address {
                if removed_addresses.contains(&address) {
                    membership.address = None;
                }
            }
        }
        counts
    }

    // ---- collaborator inventory -----------------------------------------

    pub fn upsert_config(&mut self, config: DeviceConfig) {
        self.configs.insert(config.id, config);
    }

    pub fn config(&self, id: ConfigId) -> Option<&DeviceConfig> {
        self.configs.get(&id)
    }

    pub fn configs(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.configs.values().sorted_by_key(|c| c.id)
    }

    pub fn remove_config(&mut self, id: ConfigId) -> Option<DeviceConfig> {
        self.configs.remove(&id)
    }

    pub fn upsert_vpn(&mut self, vpn: VpnServer) {
        self.vpns.insert(vpn.id, vpn);
    }

    pub fn vpn(&self, id: VpnId) -> Option<&VpnServer> {
        self.vpns.get(&id)
    }

    pub fn upsert_template(&mut self, template: Template) {
        self.templates.insert(template.id, template);
    }

    pub fn template(&self, id: TemplateId) -> Option<&Template> {
        self.templates.get(&id)
    }

    /// The membership for `(config, vpn)`, created if missing. Re-attaching
    /// a template is idempotent.
    pub fn ensure_membership(&mut self, config: ConfigId, vpn: VpnId) -> MembershipId {
        if let Some(existing) = self
            .memberships
            .values()
            .find(|m| m.config == config && m.vpn == vpn)
        {
            return existing.id;
        }
        let id = MembershipId(self.next_id());
        self.memberships.insert(
            id,
            VpnMembership {
                id,
                config,
                vpn,
                address: None,
                created: Utc::now(),
            },
        );
        id
    }

    pub fn membership(&self, id: MembershipId) -> Option<&VpnMembership> {
        self.memberships.get(&id)
    }

    pub fn membership_for(&self, config: ConfigId, vpn: VpnId) -> Option<&VpnMembership> {
        self.memberships
            .values()
            .find(|m| m.config == config && m.vpn == vpn)
    }

    pub fn memberships(&self) -> impl Iterator<Item = &VpnMembership> {
        self.memberships.values().sorted_by_key(|m| m.id)
    }

    pub fn memberships_for_config(&self, config: ConfigId) -> Vec<MembershipId> {
        self.memberships
            .values()
            .filter(|m| m.config == config)
            .map(|m| m.id)
            .sorted()
            .collect()
    }

    pub fn set_membership_address(&mut self, id: MembershipId, address: Option<AddressId>) {
        if let Some(membership) = self.memberships.get_mut(&id) {
            membership.address = address;
        }
    }

    pub fn remove_membership(&mut self, id: MembershipId) -> Option<VpnMembership> {
        self.memberships.remove(&id)
    }

    // ---- snapshot --------------------------------------------------------

    /// Serializable copy of the full store state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            next_id: self.next_id,
            rules: self.rules.values().cloned().sorted_by_key(|r| r.id).collect(),
            blocks: self.blocks.values().cloned().sorted_by_key(|b| b.id).collect(),
            addresses: self
                .addresses
                .values()
                .cloned()
                .sorted_by_key(|a| a.id)
                .collect(),
            entries: self
                .entries
                .values()
                .cloned()
                .sorted_by_key(|e| e.id)
                .collect(),
            configs: self.configs.values().cloned().sorted_by_key(|c| c.id).collect(),
            vpns: self.vpns.values().cloned().sorted_by_key(|v| v.id).collect(),
            templates: self
                .templates
                .values()
                .cloned()
                .sorted_by_key(|t| t.id)
                .collect(),
            memberships: self
                .memberships
                .values()
                .cloned()
                .sorted_by_key(|m| m.id)
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Store {
        Store {
            next_id: snapshot.next_id,
            rules: snapshot.rules.into_iter().map(|r| (r.id, r)).collect(),
            blocks: snapshot.blocks.into_iter().map(|b| (b.id, b)).collect(),
            addresses: snapshot.addresses.into_iter().map(|a| (a.id, a)).collect(),
            entries: snapshot.entries.into_iter().map(|e| (e.id, e)).collect(),
            configs: snapshot.configs.into_iter().map(|c| (c.id, c)).collect(),
            vpns: snapshot.vpns.into_iter().map(|v| (v.id, v)).collect(),
            templates: snapshot.templates.into_iter().map(|t| (t.id, t)).collect(),
            memberships: snapshot
                .memberships
                .into_iter()
                .map(|m| (m.id, m))
                .collect(),
        }
    }

    /// Write the store state to `path` as pretty JSON.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| format!("Error serializing snapshot: {e}"))?;
        std::fs::write(path, json)
            .map_err(|e| format!("Error writing snapshot file {}: {e}", path.display()))?;
        log::info!("Wrote store snapshot to {}", path.display());
        Ok(())
    }

    /// Restore a store from a snapshot file written by [`Store::save_snapshot`].
    pub fn load_snapshot(path: &Path) -> Result<Store, Box<dyn Error>> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading snapshot file {}: {e}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&json).map_err(|e| format!("Error parsing snapshot JSON: {e}"))?;
        log::info!("Loaded store snapshot from {}", path.display());
        Ok(Store::from_snapshot(snapshot))
    }
}

/// JSON-serializable image of a [`Store`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: u64,
    pub rules: Vec<SubdivisionRule>,
    pub blocks: Vec<Block>,
    pub addresses: Vec<Address>,
    pub entries: Vec<IndexEntry>,
    pub configs: Vec<DeviceConfig>,
    pub vpns: Vec<VpnServer>,
    pub templates: Vec<Template>,
    pub memberships: Vec<VpnMembership>,
}
