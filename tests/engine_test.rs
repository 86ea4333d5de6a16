//! Integration tests for the subdivision engine.
//!
//! These drive the full event flow: rule CRUD, device registration, template
//! attach/detach, and verify the provisioned blocks, addresses, keywords and
//! notifications end to end.

use std::sync::{Arc, Mutex};

use subnet_division::models::{
    BlockId, ConfigId, DeviceConfig, OrgId, Template, TemplateId, VpnId, VpnServer,
};
use subnet_division::{
    Cidr, Engine, NewRule, Notification, NotificationLevel, NotificationSink, RuleKind,
    RuleUpdate, SubdivisionRule, TriggerEvent,
};

#[derive(Clone, Default)]
struct RecordingSink {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications.lock().unwrap())
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}

fn engine_with_sink() -> (Engine, RecordingSink) {
    let sink = RecordingSink::default();
    (Engine::new(Box::new(sink.clone())), sink)
}

/// Master block + VPN server + client template, the usual VPN fixture.
fn vpn_fixture(engine: &Engine, master_cidr: &str, organization: Option<OrgId>) -> BlockId {
    let master = engine.add_master_block(Cidr::new(master_cidr).unwrap(), "master", organization);
    engine.register_vpn(VpnServer {
        id: VpnId(1),
        name: "wg0".to_string(),
        subnet: Some(master),
        organization,
    });
    engine.register_template(Template {
        id: TemplateId(1),
        name: "wg-client".to_string(),
        vpn: Some(VpnId(1)),
        organization,
    });
    master
}

fn vpn_rule(engine: &Engine, master: BlockId, label: &str, organization: Option<OrgId>) -> SubdivisionRule {
    engine
        .create_rule(NewRule {
            label: label.to_string(),
            kind: RuleKind::Vpn,
            master_block: master,
            size: 28,
            number_of_subnets: 2,
            number_of_ips: 2,
            organization,
        })
        .expect("rule should validate")
}

fn device_rule(engine: &Engine, master: BlockId, label: &str, organization: Option<OrgId>) -> SubdivisionRule {
    engine
        .create_rule(NewRule {
            label: label.to_string(),
            kind: RuleKind::Device,
            master_block: master,
            size: 28,
            number_of_subnets: 2,
            number_of_ips: 2,
            organization,
        })
        .expect("rule should validate")
}

async fn register_device(engine: &Engine, id: u64, organization: OrgId) {
    engine
        .dispatch(TriggerEvent::DeviceRegistered {
            config: DeviceConfig {
                id: ConfigId(id),
                name: format!("ap-{id:02}"),
                organization,
            },
        })
        .await
        .unwrap();
}

async fn attach_template(engine: &Engine, config: u64) {
    engine
        .dispatch(TriggerEvent::TemplateAttached {
            config: ConfigId(config),
            template: TemplateId(1),
        })
        .await
        .unwrap();
}

fn derived_blocks(engine: &Engine, master: BlockId) -> Vec<String> {
    engine.with_store(|s| {
        s.blocks_under_master(master)
            .iter()
            .filter(|b| !b.reserved)
            .map(|b| b.cidr.to_string())
            .collect()
    })
}

#[tokio::test]
async fn test_template_attach_provisions_vpn_rule() {
    let (engine, sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let rule = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    assert_eq!(
        derived_blocks(&engine, master),
        vec!["10.0.0.16/28", "10.0.0.32/28"],
        "two sub-blocks in address order"
    );
    // Keywords for sub-blocks + keywords for addresses
    assert_eq!(
        engine.with_store(|s| s.entries_for_rule(rule.id).len()),
        2 + 2 * 2
    );

    let context = engine.export_context(ConfigId(1));
    assert_eq!(context.get("VPN_OW_prefixlen").unwrap(), "28");
    assert_eq!(context.get("VPN_OW_subnet1").unwrap(), "10.0.0.16/28");
    assert_eq!(context.get("VPN_OW_subnet1_ip1").unwrap(), "10.0.0.17");
    assert_eq!(context.get("VPN_OW_subnet1_ip2").unwrap(), "10.0.0.18");
    assert_eq!(context.get("VPN_OW_subnet2").unwrap(), "10.0.0.32/28");
    assert_eq!(context.get("VPN_OW_subnet2_ip1").unwrap(), "10.0.0.33");
    assert_eq!(context.get("VPN_OW_subnet2_ip2").unwrap(), "10.0.0.34");

    // The membership got the first provisioned address as tunnel address
    let tunnel_ip = engine.with_store(|s| {
        let membership = s.membership_for(ConfigId(1), VpnId(1)).unwrap();
        membership.address.and_then(|a| s.address(a).map(|a| a.ip))
    });
    assert_eq!(tunnel_ip.unwrap().to_string(), "10.0.0.17");
    assert!(sink.take().is_empty(), "no notifications on success");
}

#[tokio::test]
async fn test_template_attach_is_idempotent() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let rule = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    let entries = engine.with_store(|s| s.entries_for_rule(rule.id).len());
    attach_template(&engine, 1).await;
    assert_eq!(
        engine.with_store(|s| s.entries_for_rule(rule.id).len()),
        entries,
        "re-attaching the template must not provision again"
    );
}

#[tokio::test]
async fn test_device_rule_lifecycle() {
    let (engine, _sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("10.0.0.0/24").unwrap(),
        "master",
        Some(OrgId(1)),
    );
    let rule = device_rule(&engine, master, "LAN", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;

    assert_eq!(
        derived_blocks(&engine, master),
        vec!["10.0.0.16/28", "10.0.0.32/28"]
    );
    let context = engine.export_context(ConfigId(1));
    assert_eq!(context.get("LAN_subnet1_ip1").unwrap(), "10.0.0.17");
    assert_eq!(context.get("LAN_subnet1_ip2").unwrap(), "10.0.0.18");
    assert_eq!(context.get("LAN_subnet2_ip1").unwrap(), "10.0.0.33");
    assert_eq!(context.get("LAN_subnet2_ip2").unwrap(), "10.0.0.34");

    // Deleting the device removes its resources; the reserved sub-block row
    // stays with the rule
    engine
        .dispatch(TriggerEvent::DeviceDeleted {
            config: ConfigId(1),
        })
        .await
        .unwrap();
    assert!(engine.with_store(|s| s.entries_for_rule(rule.id).is_empty()));
    assert!(derived_blocks(&engine, master).is_empty());
    let reserved = engine.with_store(|s| {
        s.blocks_under_master(master)
            .iter()
            .filter(|b| b.reserved)
            .map(|b| b.cidr.to_string())
            .collect::<Vec<_>>()
    });
    assert_eq!(reserved, vec!["10.0.0.0/28"]);
}

#[tokio::test]
async fn test_full_capacity_rule_includes_network_address() {
    let (engine, _sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("10.0.0.0/24").unwrap(),
        "master",
        Some(OrgId(1)),
    );
    engine
        .create_rule(NewRule {
            label: "POOL".to_string(),
            kind: RuleKind::Device,
            master_block: master,
            size: 29,
            number_of_subnets: 2,
            number_of_ips: 8,
            organization: Some(OrgId(1)),
        })
        .unwrap();
    register_device(&engine, 1, OrgId(1)).await;

    assert_eq!(
        derived_blocks(&engine, master),
        vec!["10.0.0.8/29", "10.0.0.16/29"]
    );
    let context = engine.export_context(ConfigId(1));
    // Full-capacity selection starts at the network address
    let mut number = 8;
    for subnet in 1..=2 {
        for ip in 1..=8 {
            let keyword = format!("POOL_subnet{subnet}_ip{ip}");
            assert_eq!(
                context.get(&keyword).unwrap(),
                &format!("10.0.0.{number}"),
                "unexpected address for {keyword}"
            );
            number += 1;
        }
    }
}

#[tokio::test]
async fn test_single_address_rule() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.8.0.0/24", Some(OrgId(1)));
    engine
        .create_rule(NewRule {
            label: "TUN".to_string(),
            kind: RuleKind::Vpn,
            master_block: master,
            size: 32,
            number_of_subnets: 1,
            number_of_ips: 1,
            organization: Some(OrgId(1)),
        })
        .unwrap();
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    let context = engine.export_context(ConfigId(1));
    assert_eq!(context.get("TUN_subnet1").unwrap(), "10.8.0.1/32");
    assert_eq!(context.get("TUN_subnet1_ip1").unwrap(), "10.8.0.1");
}

#[tokio::test]
async fn test_exhausted_master_notifies_second_target() {
    let (engine, sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/29", Some(OrgId(1)));
    // 4 /31 slots minus the reserved one leaves 3; each pass takes 2, so the
    // second pass must fail.
    engine
        .create_rule(NewRule {
            label: "P2P".to_string(),
            kind: RuleKind::Vpn,
            master_block: master,
            size: 31,
            number_of_subnets: 2,
            number_of_ips: 2,
            organization: Some(OrgId(1)),
        })
        .unwrap();
    register_device(&engine, 1, OrgId(1)).await;
    register_device(&engine, 2, OrgId(1)).await;
    attach_template(&engine, 1).await;
    let first = engine.with_store(|s| s.entries_for_config(ConfigId(1)).len());
    assert_eq!(first, 6);
    assert!(sink.take().is_empty());

    attach_template(&engine, 2).await;
    let notifications = sink.take();
    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0];
    assert_eq!(notification.level, NotificationLevel::Error);
    assert_eq!(notification.action_object, master);
    assert_eq!(notification.target.config_id(), ConfigId(2));
    assert_eq!(notification.message, "Failed to provision sub-blocks for ap-02");
    assert_eq!(
        notification.description,
        "The 10.0.0.0/29 block has run out of space."
    );
    // Second target got zero resources, first target is untouched
    assert!(engine.with_store(|s| s.entries_for_config(ConfigId(2)).is_empty()));
    assert_eq!(
        engine.with_store(|s| s.entries_for_config(ConfigId(1)).len()),
        first
    );
}

#[tokio::test]
async fn test_label_rename_rewrites_keywords_and_block_names() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let rule = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;
    let count_before = engine.with_store(|s| s.entries_for_rule(rule.id).len());

    let change = engine
        .update_rule(
            rule.id,
            RuleUpdate {
                label: Some("TSDR".to_string()),
                ..RuleUpdate::default()
            },
        )
        .unwrap();
    engine.dispatch(change.edited_event()).await.unwrap();

    let keywords: Vec<String> = engine.with_store(|s| {
        s.entries_for_rule(rule.id)
            .iter()
            .map(|e| e.keyword.clone())
            .collect()
    });
    assert_eq!(keywords.len(), count_before, "keyword count unchanged");
    assert!(
        keywords.iter().all(|k| k.starts_with("TSDR")),
        "every keyword rewritten: {keywords:?}"
    );
    let context = engine.export_context(ConfigId(1));
    assert_eq!(context.get("TSDR_prefixlen").unwrap(), "28");
    assert_eq!(context.get("TSDR_subnet1_ip1").unwrap(), "10.0.0.17");
    assert!(!context.contains_key("VPN_OW_prefixlen"));

    // Block names and descriptions follow the new label
    engine.with_store(|s| {
        for block in s.blocks_for_rule(rule.id) {
            if block.reserved {
                continue;
            }
            assert!(block.name.starts_with("TSDR"), "name: {}", block.name);
            assert!(
                block.description.contains("TSDR"),
                "description: {}",
                block.description
            );
        }
    });
}

#[tokio::test]
async fn test_number_of_ips_increase_extends_sequences() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let rule = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    // A no-op edit changes nothing
    let change = engine.update_rule(rule.id, RuleUpdate::default()).unwrap();
    engine.dispatch(change.edited_event()).await.unwrap();
    assert_eq!(engine.with_store(|s| s.entries_for_rule(rule.id).len()), 6);

    let change = engine
        .update_rule(
            rule.id,
            RuleUpdate {
                number_of_ips: Some(4),
                ..RuleUpdate::default()
            },
        )
        .unwrap();
    engine.dispatch(change.edited_event()).await.unwrap();

    assert_eq!(
        engine.with_store(|s| s.entries_for_rule(rule.id).len()),
        2 + 2 * 4
    );
    let context = engine.export_context(ConfigId(1));
    // Existing assignments untouched, the sequence continues
    assert_eq!(context.get("VPN_OW_subnet1_ip1").unwrap(), "10.0.0.17");
    assert_eq!(context.get("VPN_OW_subnet1_ip2").unwrap(), "10.0.0.18");
    assert_eq!(context.get("VPN_OW_subnet1_ip3").unwrap(), "10.0.0.19");
    assert_eq!(context.get("VPN_OW_subnet1_ip4").unwrap(), "10.0.0.20");
    assert_eq!(context.get("VPN_OW_subnet2_ip3").unwrap(), "10.0.0.35");
    assert_eq!(context.get("VPN_OW_subnet2_ip4").unwrap(), "10.0.0.36");
}

#[tokio::test]
async fn test_rule_deletion_spares_sibling_rule() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let rule1 = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    let rule2 = vpn_rule(&engine, master, "VPN", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    assert_eq!(derived_blocks(&engine, master).len(), 4);

    engine.delete_rule(rule2.id).unwrap();
    engine
        .dispatch(TriggerEvent::RuleDeleted { rule: rule2.id })
        .await
        .unwrap();

    assert_eq!(
        derived_blocks(&engine, master),
        vec!["10.0.0.16/28", "10.0.0.32/28"],
        "only the first rule's sub-blocks remain"
    );
    assert_eq!(engine.with_store(|s| s.entries_for_rule(rule1.id).len()), 6);
    assert!(engine.with_store(|s| s.entries_for_rule(rule2.id).is_empty()));
    // Both rules shared the /28 reservation; it survives with the sibling
    assert_eq!(
        engine.with_store(|s| {
            s.blocks_under_master(master)
                .iter()
                .filter(|b| b.reserved)
                .count()
        }),
        1
    );
}

#[tokio::test]
async fn test_shared_master_scopes_resources_to_target_organization() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", None);
    let rule1 = vpn_rule(&engine, master, "R1", Some(OrgId(1)));
    let rule2 = vpn_rule(&engine, master, "R2", Some(OrgId(2)));
    register_device(&engine, 1, OrgId(1)).await;
    register_device(&engine, 2, OrgId(2)).await;
    attach_template(&engine, 1).await;
    attach_template(&engine, 2).await;

    // Each organization's rule provisioned only its own configuration
    assert_eq!(engine.with_store(|s| s.entries_for_rule(rule1.id).len()), 6);
    assert_eq!(engine.with_store(|s| s.entries_for_rule(rule2.id).len()), 6);
    let config1_keys: Vec<String> = engine
        .export_context(ConfigId(1))
        .keys()
        .cloned()
        .collect();
    assert!(config1_keys.iter().all(|k| k.starts_with("R1")));

    // Sub-blocks are disjoint across the two configurations
    let blocks = derived_blocks(&engine, master);
    assert_eq!(blocks.len(), 4);
    let unique: std::collections::HashSet<&String> = blocks.iter().collect();
    assert_eq!(unique.len(), 4, "overlapping sub-blocks: {blocks:?}");

    // Provisioned resources carry the target's organization
    engine.with_store(|s| {
        for (rule, organization) in [(rule1.id, OrgId(1)), (rule2.id, OrgId(2))] {
            for block in s.blocks_for_rule(rule) {
                if !block.reserved {
                    assert_eq!(block.organization, Some(organization));
                }
            }
        }
    });
}

#[tokio::test]
async fn test_rule_creation_backfills_existing_devices() {
    let (engine, _sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("10.0.0.0/24").unwrap(),
        "master",
        Some(OrgId(1)),
    );
    register_device(&engine, 1, OrgId(1)).await;
    register_device(&engine, 2, OrgId(1)).await;

    let rule = device_rule(&engine, master, "LAN", Some(OrgId(1)));
    engine
        .dispatch(TriggerEvent::RuleCreated { rule: rule.id })
        .await
        .unwrap();

    assert_eq!(
        engine.with_store(|s| s.entries_for_rule(rule.id).len()),
        2 * 6,
        "both pre-existing devices provisioned"
    );
    assert!(!engine.export_context(ConfigId(1)).is_empty());
    assert!(!engine.export_context(ConfigId(2)).is_empty());
}

#[tokio::test]
async fn test_rule_creation_backfills_existing_memberships() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;
    assert!(engine.export_context(ConfigId(1)).is_empty());

    let rule = vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    engine
        .dispatch(TriggerEvent::RuleCreated { rule: rule.id })
        .await
        .unwrap();
    assert_eq!(engine.with_store(|s| s.entries_for_rule(rule.id).len()), 6);
}

#[tokio::test]
async fn test_template_detach_leaves_device_rule_resources() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let lan = device_rule(&engine, master, "LAN", Some(OrgId(1)));
    let vpn = vpn_rule(&engine, master, "VPN", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    assert_eq!(derived_blocks(&engine, master).len(), 4);

    engine
        .dispatch(TriggerEvent::TemplateDetached {
            config: ConfigId(1),
            template: TemplateId(1),
        })
        .await
        .unwrap();

    assert!(engine.with_store(|s| s.entries_for_rule(vpn.id).is_empty()));
    assert_eq!(engine.with_store(|s| s.entries_for_rule(lan.id).len()), 6);
    assert_eq!(derived_blocks(&engine, master).len(), 2);
    // The membership is gone with its template
    assert!(engine.with_store(|s| s.membership_for(ConfigId(1), VpnId(1)).is_none()));
}

#[tokio::test]
async fn test_vpn_without_subnet_is_ignored() {
    let (engine, sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("10.0.0.0/24").unwrap(),
        "master",
        Some(OrgId(1)),
    );
    engine.register_vpn(VpnServer {
        id: VpnId(1),
        name: "wg0".to_string(),
        subnet: None,
        organization: Some(OrgId(1)),
    });
    engine.register_template(Template {
        id: TemplateId(1),
        name: "wg-client".to_string(),
        vpn: Some(VpnId(1)),
        organization: Some(OrgId(1)),
    });
    vpn_rule(&engine, master, "VPN_OW", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;

    assert!(derived_blocks(&engine, master).is_empty());
    assert!(engine.export_context(ConfigId(1)).is_empty());
    assert!(sink.take().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_targets_get_disjoint_blocks() {
    let (engine, _sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("10.0.0.0/24").unwrap(),
        "master",
        Some(OrgId(1)),
    );
    device_rule(&engine, master, "LAN", Some(OrgId(1)));

    let handles: Vec<_> = (1..=4)
        .map(|id| {
            engine.dispatch(TriggerEvent::DeviceRegistered {
                config: DeviceConfig {
                    id: ConfigId(id),
                    name: format!("ap-{id:02}"),
                    organization: OrgId(1),
                },
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let blocks = derived_blocks(&engine, master);
    assert_eq!(blocks.len(), 8, "two sub-blocks per device");
    let unique: std::collections::HashSet<&String> = blocks.iter().collect();
    assert_eq!(unique.len(), 8, "overlapping sub-blocks: {blocks:?}");
    for id in 1..=4 {
        assert_eq!(
            engine.with_store(|s| s.entries_for_config(ConfigId(id)).len()),
            6
        );
    }
}

#[tokio::test]
async fn test_ipv6_rule_end_to_end() {
    let (engine, _sink) = engine_with_sink();
    let master = engine.add_master_block(
        Cidr::new("fd12:3456:7890::/48").unwrap(),
        "master-v6",
        Some(OrgId(1)),
    );
    engine
        .create_rule(NewRule {
            label: "TUN6".to_string(),
            kind: RuleKind::Device,
            master_block: master,
            size: 128,
            number_of_subnets: 1,
            number_of_ips: 1,
            organization: Some(OrgId(1)),
        })
        .unwrap();
    register_device(&engine, 1, OrgId(1)).await;

    let context = engine.export_context(ConfigId(1));
    assert_eq!(context.get("TUN6_prefixlen").unwrap(), "128");
    assert_eq!(context.get("TUN6_subnet1").unwrap(), "fd12:3456:7890::1/128");
    assert_eq!(context.get("TUN6_subnet1_ip1").unwrap(), "fd12:3456:7890::1");
}

#[tokio::test]
async fn test_device_deletion_removes_vpn_scopes_too() {
    let (engine, _sink) = engine_with_sink();
    let master = vpn_fixture(&engine, "10.0.0.0/24", Some(OrgId(1)));
    let lan = device_rule(&engine, master, "LAN", Some(OrgId(1)));
    let vpn = vpn_rule(&engine, master, "VPN", Some(OrgId(1)));
    register_device(&engine, 1, OrgId(1)).await;
    attach_template(&engine, 1).await;
    assert_eq!(derived_blocks(&engine, master).len(), 4);

    engine
        .dispatch(TriggerEvent::DeviceDeleted {
            config: ConfigId(1),
        })
        .await
        .unwrap();

    assert!(engine.with_store(|s| s.entries_for_rule(lan.id).is_empty()));
    assert!(engine.with_store(|s| s.entries_for_rule(vpn.id).is_empty()));
    assert!(derived_blocks(&engine, master).is_empty());
    assert!(engine.with_store(|s| s.membership_for(ConfigId(1), VpnId(1)).is_none()));
}
