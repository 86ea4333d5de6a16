//! Domain models for the subdivision engine.
//!
//! This module contains the core data structures used throughout the crate:
//! - [`Cidr`] - IPv4/IPv6 block with CIDR arithmetic
//! - [`SubdivisionRule`] and [`RuleKind`] - declarative rule configuration
//! - [`Block`], [`Address`], [`IndexEntry`], [`Target`] - allocated
//!   resources and the keyword index over them
//! - Inventory mirrors of collaborator state ([`DeviceConfig`],
//!   [`VpnServer`], [`Template`], [`VpnMembership`])

mod cidr;
mod resources;
mod rule;

// Re-export public types
pub use cidr::{max_prefix, Cidr, MAX_LENGTH_V4, MAX_LENGTH_V6};
pub use resources::{
    Address, AddressId, Block, BlockId, ConfigId, DeviceConfig, EntryId, IndexEntry, MembershipId,
    OrgId, RuleId, Target, Template, TemplateId, VpnId, VpnMembership, VpnServer,
};
pub use rule::{RuleKind, SubdivisionRule};
