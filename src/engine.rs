//! Provisioning orchestrator.
//!
//! Reacts to [`TriggerEvent`]s as fire-and-forget background tasks, drives
//! the [`allocator`](crate::allocator) and the [`Store`], and keeps the
//! operations idempotent so duplicate or retried tasks are harmless.
//! Allocation against a given master block is serialized through a
//! per-master lock, and a provisioning pass plans everything before it
//! persists anything: a target is provisioned completely or not at all.
//! Capacity exhaustion is degraded to an error log plus a notification; the
//! workflow that triggered the pass always completes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::allocator;
use crate::context;
use crate::errors::{EngineError, NotFoundError, ValidationError};
use crate::events::{
    Notification, NotificationLevel, NotificationSink, ProvisionedEvent, TriggerEvent,
};
use crate::models::{
    Block, BlockId, Cidr, ConfigId, EntryId, OrgId, RuleId, RuleKind, SubdivisionRule, Target,
    Template, TemplateId, VpnServer,
};
use crate::rule_types::handler_for;
use crate::store::Store;

/// Parameters for creating a rule; the engine assigns the id.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub label: String,
    pub kind: RuleKind,
    pub master_block: BlockId,
    pub size: u8,
    pub number_of_subnets: u32,
    pub number_of_ips: u32,
    pub organization: Option<OrgId>,
}

/// Field changes for an existing rule. Unset fields keep their value;
/// `size` and `number_of_subnets` changes are rejected at validation.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub label: Option<String>,
    pub size: Option<u8>,
    pub number_of_subnets: Option<u32>,
    pub number_of_ips: Option<u32>,
}

/// A successfully applied rule edit, with the pre-edit values the follow-up
/// background work needs.
#[derive(Debug, Clone)]
pub struct RuleChange {
    pub rule: SubdivisionRule,
    pub old_label: String,
    pub old_number_of_ips: u32,
}

impl RuleChange {
    /// The trigger event to dispatch for this edit.
    pub fn edited_event(&self) -> TriggerEvent {
        TriggerEvent::RuleEdited {
            rule: self.rule.id,
            old_label: self.old_label.clone(),
            old_number_of_ips: self.old_number_of_ips,
        }
    }
}

type ProvisionedListener = Box<dyn Fn(&ProvisionedEvent) + Send + Sync>;

struct EngineInner {
    store: Mutex<Store>,
    notifier: Box<dyn NotificationSink>,
    listeners: Mutex<Vec<ProvisionedListener>>,
    master_locks: Mutex<HashMap<BlockId, Arc<Mutex<()>>>>,
}

/// The provisioning engine. A cheap clone handle; clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(notifier: Box<dyn NotificationSink>) -> Engine {
        Engine::with_initial_store(Store::new(), notifier)
    }

    /// Build an engine around pre-existing state (e.g. a loaded snapshot).
    pub fn with_initial_store(store: Store, notifier: Box<dyn NotificationSink>) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                store: Mutex::new(store),
                notifier,
                listeners: Mutex::new(Vec::new()),
                master_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run a closure against the store, for inspection and snapshots.
    pub fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.lock_store())
    }

    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.inner.store.lock().expect("store mutex poisoned")
    }

    fn master_lock(&self, master: BlockId) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .master_locks
            .lock()
            .expect("lock registry poisoned");
        locks.entry(master).or_default().clone()
    }

    /// Register a listener for successful provisioning passes.
    pub fn on_provisioned(&self, listener: impl Fn(&ProvisionedEvent) + Send + Sync + 'static) {
        self.inner
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .push(Box::new(listener));
    }

    fn emit_provisioned(&self, event: ProvisionedEvent) {
        for listener in self
            .inner
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(&event);
        }
    }

    // ---- collaborator state --------------------------------------------

    pub fn add_master_block(&self, cidr: Cidr, name: &str, organization: Option<OrgId>) -> BlockId {
        self.lock_store().add_master_block(cidr, name, organization)
    }

    pub fn register_vpn(&self, vpn: VpnServer) {
        self.lock_store().upsert_vpn(vpn);
    }

    pub fn register_template(&self, template: Template) {
        self.lock_store().upsert_template(template);
    }

    // ---- rule CRUD (synchronous; effects run as dispatched tasks) -------

    /// Validate and store a new rule. Dispatch
    /// [`TriggerEvent::RuleCreated`] afterwards to backfill existing
    /// targets.
    pub fn create_rule(&self, new: NewRule) -> Result<SubdivisionRule, EngineError> {
        let mut store = self.lock_store();
        let rule = SubdivisionRule {
            id: RuleId(0),
            label: new.label,
            kind: new.kind,
            master_block: new.master_block,
            size: new.size,
            number_of_subnets: new.number_of_subnets,
            number_of_ips: new.number_of_ips,
            organization: new.organization,
        };
        let master = store
            .block(rule.master_block)
            .ok_or_else(|| ValidationError::new("master_block", "Invalid master block."))?;
        rule.validate(master)?;
        let rule = store.insert_rule(rule);
        log::info!("Created subdivision rule {rule} (id {})", rule.id);
        Ok(rule)
    }

    /// Validate and apply a rule edit. Dispatch the returned change's
    /// [`RuleChange::edited_event`] afterwards to run the follow-up work.
    pub fn update_rule(&self, id: RuleId, update: RuleUpdate) -> Result<RuleChange, EngineError> {
        let mut store = self.lock_store();
        let old = store.rule(id).cloned().ok_or(NotFoundError { rule: id })?;
        let mut edited = old.clone();
        if let Some(label) = update.label {
            edited.label = label;
        }
        if let Some(size) = update.size {
            edited.size = size;
        }
        if let Some(number_of_subnets) = update.number_of_subnets {
            edited.number_of_subnets = number_of_subnets;
        }
        if let Some(number_of_ips) = update.number_of_ips {
            edited.number_of_ips = number_of_ips;
        }
        edited.validate_update(&old)?;
        let master = store
            .block(edited.master_block)
            .ok_or_else(|| ValidationError::new("master_block", "Invalid master block."))?;
        edited.validate(master)?;
        store.replace_rule(edited.clone());
        log::info!("Updated subdivision rule {edited} (id {id})");
        Ok(RuleChange {
            rule: edited,
            old_label: old.label,
            old_number_of_ips: old.number_of_ips,
        })
    }

    /// Remove the rule row. Dispatch [`TriggerEvent::RuleDeleted`]
    /// afterwards to cascade deletion of everything it owns.
    pub fn delete_rule(&self, id: RuleId) -> Result<SubdivisionRule, EngineError> {
        let mut store = self.lock_store();
        let rule = store.remove_rule(id).ok_or(NotFoundError { rule: id })?;
        log::info!("Deleted subdivision rule {rule} (id {id})");
        Ok(rule)
    }

    // ---- event handling -------------------------------------------------

    /// Spawn the background task handling `event`. The trigger path returns
    /// promptly; await the handle only when completion matters (tests,
    /// shutdown).
    pub fn dispatch(&self, event: TriggerEvent) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.handle_event(event);
        })
    }

    /// Handle one trigger event to completion. [`Engine::dispatch`] runs
    /// this on the runtime; callers without a runtime may invoke it
    /// directly.
    pub fn handle_event(&self, event: TriggerEvent) {
        match event {
            TriggerEvent::TemplateAttached { config, template } => {
                self.handle_template_attached(config, template);
            }
            TriggerEvent::TemplateDetached { config, template } => {
                self.handle_template_detached(config, template);
            }
            TriggerEvent::DeviceRegistered { config } => {
                let id = config.id;
                let rule_ids = {
                    let mut store = self.lock_store();
                    store.upsert_config(config);
                    let target = Target::Config(id);
                    store
                        .rules()
                        .filter(|r| r.kind == RuleKind::Device)
                        .filter(|r| handler_for(r.kind).applies_to(r, &store, &target))
                        .map(|r| r.id)
                        .collect::<Vec<_>>()
                };
                for rule_id in rule_ids {
                    self.provision(rule_id, Target::Config(id));
                }
            }
            TriggerEvent::DeviceDeleted { config } => {
                let scopes = self.lock_store().scopes_for_config(config);
                for (rule_id, target) in scopes {
                    self.deprovision(rule_id, target);
                }
                let mut store = self.lock_store();
                for membership in store.memberships_for_config(config) {
                    store.remove_membership(membership);
                }
                if store.remove_config(config).is_some() {
                    log::debug!("Removed configuration {config} from the inventory");
                }
            }
            TriggerEvent::RuleCreated { rule } => {
                let targets = {
                    let store = self.lock_store();
                    match store.rule(rule) {
                        Some(r) => handler_for(r.kind).resolve_targets(r, &store),
                        None => {
                            log::warn!(
                                "Failed to provision existing targets for subdivision rule \
                                 with id \"{rule}\", reason: rule does not exist"
                            );
                            return;
                        }
                    }
                };
                for target in targets {
                    self.provision(rule, target);
                }
            }
            TriggerEvent::RuleEdited {
                rule,
                old_label,
                old_number_of_ips,
            } => {
                let (new_label, new_number_of_ips) = {
                    let store = self.lock_store();
                    match store.rule(rule) {
                        Some(r) => (r.label.clone(), r.number_of_ips),
                        None => {
                            log::warn!(
                                "Failed to update indexes for subdivision rule with id \
                                 \"{rule}\", reason: rule does not exist"
                            );
                            return;
                        }
                    }
                };
                if new_label != old_label {
                    self.relabel(rule, &old_label);
                }
                if new_number_of_ips > old_number_of_ips {
                    self.provision_extra_ips(rule, old_number_of_ips);
                }
            }
            TriggerEvent::RuleDeleted { rule } => {
                let counts = self.lock_store().delete_rule_resources(rule);
                log::info!(
                    "Deleted {} index entries, {} addresses and {} blocks of rule id {rule}",
                    counts.entries,
                    counts.addresses,
                    counts.blocks
                );
            }
        }
    }

    fn handle_template_attached(&self, config: ConfigId, template: TemplateId) {
        let (target, rule_ids) = {
            let mut store = self.lock_store();
            let Some(template) = store.template(template).cloned() else {
                log::warn!("Unknown template {template} attached to configuration {config}");
                return;
            };
            let Some(vpn_id) = template.vpn else {
                log::debug!("Template {} has no VPN; nothing to provision", template.name);
                return;
            };
            let Some(vpn) = store.vpn(vpn_id).cloned() else {
                log::warn!("Unknown VPN {vpn_id} on template {}", template.name);
                return;
            };
            let Some(master) = vpn.subnet else {
                log::debug!("VPN {} has no network block; nothing to provision", vpn.name);
                return;
            };
            if store.config(config).is_none() {
                log::warn!("Unknown configuration {config}; skipping provisioning");
                return;
            }
            let membership = store.ensure_membership(config, vpn_id);
            let target = Target::Membership { config, membership };
            let rule_ids: Vec<RuleId> = store
                .rules()
                .filter(|r| r.kind == RuleKind::Vpn && r.master_block == master)
                .filter(|r| handler_for(r.kind).applies_to(r, &store, &target))
                .map(|r| r.id)
                .collect();
            (target, rule_ids)
        };
        for rule_id in rule_ids {
            self.provision(rule_id, target);
        }
    }

    fn handle_template_detached(&self, config: ConfigId, template: TemplateId) {
        let (target, membership_id, rule_ids) = {
            let store = self.lock_store();
            let Some(detached) = store.template(template) else {
                log::warn!("Unknown template {template} detached from configuration {config}");
                return;
            };
            let Some(vpn_id) = detached.vpn else {
                return;
            };
            let Some(membership) = store.membership_for(config, vpn_id) else {
                log::debug!("No membership of configuration {config} for template {template}");
                return;
            };
            let target = Target::Membership {
                config,
                membership: membership.id,
            };
            (target, membership.id, store.rules_for_target(&target))
        };
        for rule_id in rule_ids {
            self.deprovision(rule_id, target);
        }
        let mut store = self.lock_store();
        store.remove_membership(membership_id);
        log::debug!("Removed membership {membership_id} of configuration {config}");
    }

    // ---- provisioning ---------------------------------------------------

    /// Provision `target` under `rule`. Idempotent: a scope that already has
    /// index entries is left untouched.
    fn provision(&self, rule_id: RuleId, target: Target) {
        let master_id = {
            let store = self.lock_store();
            match store.rule(rule_id) {
                Some(rule) => rule.master_block,
                None => {
                    log::warn!(
                        "Failed to provision resources for subdivision rule with id \
                         \"{rule_id}\", reason: rule does not exist"
                    );
                    return;
                }
            }
        };
        // Serialize allocation per master so concurrent targets observe each
        // other's persisted blocks. Acquired before the store lock, always in
        // this order.
        let master_lock = self.master_lock(master_id);
        let _guard = master_lock.lock().expect("master lock poisoned");

        let mut store = self.lock_store();
        let Some(rule) = store.rule(rule_id).cloned() else {
            log::warn!(
                "Failed to provision resources for subdivision rule with id \
                 \"{rule_id}\", reason: rule does not exist"
            );
            return;
        };
        if !store.entries_for_scope(rule_id, &target).is_empty() {
            log::debug!("{target} is already provisioned under rule {rule}; nothing to do");
            return;
        }
        let Some(master) = store.block(rule.master_block).cloned() else {
            log::error!("Master block {} of rule {rule} is missing", rule.master_block);
            return;
        };
        let Some(device) = store.config(target.config_id()).cloned() else {
            log::warn!(
                "Unknown configuration {} for {target}; skipping provisioning",
                target.config_id()
            );
            return;
        };
        // A shared rule scopes its resources to the target's organization.
        let organization = rule.organization.or(Some(device.organization));

        let used: Vec<Cidr> = store
            .blocks_under_master(master.id)
            .iter()
            .map(|b| b.cidr)
            .collect();
        let planned =
            match allocator::plan_blocks(&master.cidr, rule.size, rule.number_of_subnets, &used) {
                Ok(planned) => planned,
                Err(err) => {
                    drop(store);
                    log::debug!("{err}");
                    self.report_exhausted(target, &device.name, &master);
                    return;
                }
            };
        let mut host_sets = Vec::with_capacity(planned.len());
        for (_, block) in &planned {
            match allocator::select_hosts(block, rule.number_of_ips) {
                Ok(hosts) => host_sets.push(hosts),
                Err(err) => {
                    drop(store);
                    log::debug!("{err}");
                    self.report_exhausted(target, &device.name, &master);
                    return;
                }
            }
        }

        // Nothing can fail past this point; persist the whole plan.
        if let Ok(reserved) = allocator::reserved_block(&master.cidr, rule.size) {
            if store.find_reserved(master.id, &reserved).is_none() {
                store.add_derived_block(
                    reserved,
                    format!("Reserved sub-block {reserved}"),
                    format!("Reserved sub-block of {}", master.cidr),
                    None,
                    master.id,
                    rule.id,
                    true,
                );
            }
        }
        let mut entry_ids: Vec<EntryId> = Vec::new();
        for (position, ((_, block_cidr), hosts)) in planned.iter().zip(&host_sets).enumerate() {
            let n = position + 1;
            let name = format!("{}_subnet{}", rule.label, n);
            let block_id = store.add_derived_block(
                *block_cidr,
                name.clone(),
                format!(
                    "Sub-block of {} provisioned for rule {}",
                    master.cidr, rule.label
                ),
                organization,
                master.id,
                rule.id,
                false,
            );
            entry_ids.push(store.add_entry(name, rule.id, target, block_id, None));
            for (m, ip) in hosts.iter().enumerate() {
                let address_id = store.add_address(*ip, block_id, organization, rule.id);
                entry_ids.push(store.add_entry(
                    format!("{}_subnet{}_ip{}", rule.label, n, m + 1),
                    rule.id,
                    target,
                    block_id,
                    Some(address_id),
                ));
            }
        }
        handler_for(rule.kind).post_provision(&rule, &target, &mut store);
        drop(store);

        log::info!(
            "Provisioned {} sub-blocks for {target} under rule {rule}",
            planned.len()
        );
        self.emit_provisioned(ProvisionedEvent {
            rule: rule_id,
            target,
            entries: entry_ids,
        });
    }

    fn report_exhausted(&self, target: Target, device_name: &str, master: &Block) {
        log::error!("Cannot create more sub-blocks of {}", master.cidr);
        self.inner.notifier.emit(Notification {
            level: NotificationLevel::Error,
            target,
            action_object: master.id,
            message: format!("Failed to provision sub-blocks for {device_name}"),
            description: format!("The {} block has run out of space.", master.cidr),
        });
    }

    /// Remove everything scoped to `(rule, target)`. Idempotent.
    fn deprovision(&self, rule_id: RuleId, target: Target) {
        let counts = self.lock_store().delete_scope(rule_id, &target);
        if counts.is_empty() {
            log::debug!("Nothing provisioned for {target} under rule id {rule_id}");
        } else {
            log::info!(
                "Deprovisioned {} index entries, {} addresses and {} blocks for {target}",
                counts.entries,
                counts.addresses,
                counts.blocks
            );
        }
    }

    /// Rewrite every keyword and owned block name/description after a label
    /// change.
    fn relabel(&self, rule_id: RuleId, old_label: &str) {
        let mut store = self.lock_store();
        let Some(rule) = store.rule(rule_id).cloned() else {
            return;
        };
        let new_label = rule.label;
        let master_cidr = store.block(rule.master_block).map(|b| b.cidr);

        let keyword_updates: Vec<(EntryId, String)> = store
            .entries_for_rule(rule_id)
            .iter()
            .filter_map(|e| {
                e.keyword
                    .strip_prefix(old_label)
                    .map(|rest| (e.id, format!("{new_label}{rest}")))
            })
            .collect();
        let keyword_count = keyword_updates.len();
        for (id, keyword) in keyword_updates {
            store.update_entry_keyword(id, keyword);
        }

        let block_updates: Vec<(BlockId, String, String)> = store
            .blocks_for_rule(rule_id)
            .iter()
            .filter(|b| !b.reserved)
            .filter_map(|b| {
                let rest = b.name.strip_prefix(old_label)?;
                let description = match master_cidr {
                    Some(master) => {
                        format!("Sub-block of {master} provisioned for rule {new_label}")
                    }
                    None => b.description.clone(),
                };
                Some((b.id, format!("{new_label}{rest}"), description))
            })
            .collect();
        for (id, name, description) in block_updates {
            store.update_block_meta(id, name, description);
        }
        log::info!(
            "Relabeled {keyword_count} index keywords of rule {new_label} (was {old_label})"
        );
    }

    /// Allocate the additional addresses after a `number_of_ips` increase,
    /// continuing each sub-block's sequence without touching existing
    /// assignments.
    fn provision_extra_ips(&self, rule_id: RuleId, old_count: u32) {
        let mut store = self.lock_store();
        let Some(rule) = store.rule(rule_id).cloned() else {
            return;
        };
        let new_count = rule.number_of_ips;
        let prefix = format!("{}_subnet", rule.label);

        struct Job {
            target: Target,
            block: BlockId,
            cidr: Cidr,
            organization: Option<OrgId>,
            n: u32,
        }
        let jobs: Vec<Job> = store
            .entries_for_rule(rule_id)
            .iter()
            .filter(|e| e.address.is_none())
            .filter_map(|e| {
                let n: u32 = e.keyword.strip_prefix(&prefix)?.parse().ok()?;
                let block = store.block(e.block)?;
                Some(Job {
                    target: e.target,
                    block: e.block,
                    cidr: block.cidr,
                    organization: block.organization,
                    n,
                })
            })
            .collect();

        let mut added = 0usize;
        let mut failures: Vec<(Target, BlockId, Cidr)> = Vec::new();
        for job in jobs {
            match allocator::extend_hosts(&job.cidr, old_count, new_count) {
                Ok(hosts) => {
                    for (offset, ip) in hosts.iter().enumerate() {
                        let m = old_count as usize + 1 + offset;
                        let keyword = format!("{}{}_ip{}", prefix, job.n, m);
                        if store.entry_exists(rule_id, &job.target, &keyword) {
                            continue;
                        }
                        let address_id =
                            store.add_address(*ip, job.block, job.organization, rule_id);
                        store.add_entry(keyword, rule_id, job.target, job.block, Some(address_id));
                        added += 1;
                    }
                }
                Err(err) => {
                    log::error!("Cannot provision more addresses in {}: {err}", job.cidr);
                    failures.push((job.target, job.block, job.cidr));
                }
            }
        }
        let notifications: Vec<Notification> = failures
            .into_iter()
            .map(|(target, block, cidr)| {
                let device_name = store
                    .config(target.config_id())
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("configuration {}", target.config_id()));
                Notification {
                    level: NotificationLevel::Error,
                    target,
                    action_object: block,
                    message: format!("Failed to provision addresses for {device_name}"),
                    description: format!("The {cidr} block has run out of space."),
                }
            })
            .collect();
        drop(store);
        log::info!("Provisioned {added} additional addresses for rule id {rule_id}");
        for notification in notifications {
            self.inner.notifier.emit(notification);
        }
    }

    // ---- exports --------------------------------------------------------

    /// Flat keyword -> value mapping for the configuration, for template
    /// rendering.
    pub fn export_context(&self, config: ConfigId) -> BTreeMap<String, String> {
        context::export(&self.lock_store(), config)
    }
}
