use std::error::Error;

use subnet_division::models::{
    ConfigId, DeviceConfig, OrgId, Template, TemplateId, VpnId, VpnServer,
};
use subnet_division::output::render_context;
use subnet_division::{Cidr, Engine, LogNotificationSink, NewRule, RuleKind, TriggerEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Do as little as possible in main.rs as it can't contain any tests
    log4rs::init_file("log4rs.yml", Default::default()).expect("Error initializing log4rs");
    log::info!("#Start main()");

    let engine = Engine::new(Box::new(LogNotificationSink));
    let org = OrgId(1);

    // A master block with one Device rule and one VPN rule over it
    let lan_pool = engine.add_master_block(Cidr::new("10.0.0.0/24")?, "branch-pool", Some(org));
    let wg_pool = engine.add_master_block(Cidr::new("10.8.0.0/24")?, "wireguard-pool", Some(org));
    let lan_rule = engine.create_rule(NewRule {
        label: "LAN".to_string(),
        kind: RuleKind::Device,
        master_block: lan_pool,
        size: 28,
        number_of_subnets: 2,
        number_of_ips: 2,
        organization: Some(org),
    })?;
    let vpn_rule = engine.create_rule(NewRule {
        label: "VPN".to_string(),
        kind: RuleKind::Vpn,
        master_block: wg_pool,
        size: 32,
        number_of_subnets: 1,
        number_of_ips: 1,
        organization: Some(org),
    })?;
    engine.register_vpn(VpnServer {
        id: VpnId(1),
        name: "wg0".to_string(),
        subnet: Some(wg_pool),
        organization: Some(org),
    });
    engine.register_template(Template {
        id: TemplateId(1),
        name: "wireguard-client".to_string(),
        vpn: Some(VpnId(1)),
        organization: Some(org),
    });

    // Register a device, then attach the VPN template to its configuration
    let config = ConfigId(1);
    let handles = vec![
        engine.dispatch(TriggerEvent::RuleCreated { rule: lan_rule.id }),
        engine.dispatch(TriggerEvent::RuleCreated { rule: vpn_rule.id }),
        engine.dispatch(TriggerEvent::DeviceRegistered {
            config: DeviceConfig {
                id: config,
                name: "ap-01".to_string(),
                organization: org,
            },
        }),
    ];
    for result in futures::future::join_all(handles).await {
        result?;
    }
    engine
        .dispatch(TriggerEvent::TemplateAttached {
            config,
            template: TemplateId(1),
        })
        .await?;

    print!("{}", render_context("ap-01", &engine.export_context(config)));
    Ok(())
}
