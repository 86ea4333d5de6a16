//! Resource records owned and indexed by the subdivision engine.
//!
//! [`Block`] and [`Address`] are the allocated address-space resources;
//! [`IndexEntry`] maps a keyword to them within a `(rule, target)` scope.
//! The remaining structs mirror just enough collaborator state (device
//! configurations, VPN servers, templates, memberships) to resolve targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use super::Cidr;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a subdivision rule.
    RuleId
);
id_type!(
    /// Identifier of an address block (master or derived).
    BlockId
);
id_type!(
    /// Identifier of a provisioned host address.
    AddressId
);
id_type!(
    /// Identifier of an index entry.
    EntryId
);
id_type!(
    /// Identifier of a tenant organization.
    OrgId
);
id_type!(
    /// Identifier of a registered device configuration.
    ConfigId
);
id_type!(
    /// Identifier of a VPN server.
    VpnId
);
id_type!(
    /// Identifier of a configuration template.
    TemplateId
);
id_type!(
    /// Identifier of a VPN membership (a configuration using a VPN).
    MembershipId
);

/// An address block. Master blocks have no `master` and no `rule`; derived
/// blocks carry both, plus the organization of the target they were
/// provisioned for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub cidr: Cidr,
    pub name: String,
    pub description: String,
    pub organization: Option<OrgId>,
    /// The master block this one was carved from, if any.
    pub master: Option<BlockId>,
    /// The rule that provisioned this block, if any.
    pub rule: Option<RuleId>,
    /// Marks the permanently excluded sub-block at index 0.
    pub reserved: bool,
    pub created: DateTime<Utc>,
}

/// A host address provisioned inside a derived block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub ip: IpAddr,
    pub block: BlockId,
    pub organization: Option<OrgId>,
    pub rule: Option<RuleId>,
    pub created: DateTime<Utc>,
}

/// The entity a rule provisions resources for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// A registered device configuration (Device rules).
    Config(ConfigId),
    /// A (configuration, VPN membership) pair (VPN rules).
    Membership {
        config: ConfigId,
        membership: MembershipId,
    },
}

impl Target {
    /// The device configuration both target shapes belong to.
    pub fn config_id(&self) -> ConfigId {
        match self {
            Target::Config(id) => *id,
            Target::Membership { config, .. } => *config,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Config(id) => write!(f, "config {id}"),
            Target::Membership { config, membership } => {
                write!(f, "config {config} (membership {membership})")
            }
        }
    }
}

/// Keyword -> resource mapping within a `(rule, target)` scope.
///
/// References a block, or a block plus one of its addresses; the required
/// `block` field makes "neither" unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: EntryId,
    /// Unique within `(rule, target)`.
    pub keyword: String,
    pub rule: RuleId,
    pub target: Target,
    pub block: BlockId,
    pub address: Option<AddressId>,
    pub created: DateTime<Utc>,
}

/// A registered device's configuration, as reported by the registration
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: ConfigId,
    /// Device name, used in notification messages.
    pub name: String,
    pub organization: OrgId,
}

/// A VPN server whose network maps to a master block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnServer {
    pub id: VpnId,
    pub name: String,
    /// The master block backing this VPN's network, if configured.
    pub subnet: Option<BlockId>,
    pub organization: Option<OrgId>,
}

/// A configuration template; attaching one with a VPN creates a membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub vpn: Option<VpnId>,
    pub organization: Option<OrgId>,
}

/// A configuration's membership of a VPN, created on template attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnMembership {
    pub id: MembershipId,
    pub config: ConfigId,
    pub vpn: VpnId,
    /// Tunnel address assigned by the VPN rule handler after provisioning.
    pub address: Option<AddressId>,
    pub created: DateTime<Utc>,
}
