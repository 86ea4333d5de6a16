//! Subdivision rule model and validation.
//!
//! A [`SubdivisionRule`] declares how a master block is partitioned: the
//! sub-block prefix length, how many sub-blocks and addresses each target
//! receives, and the keyword prefix they are exposed under. Validation is
//! field-specific and blocks the save; see [`SubdivisionRule::validate`].

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::allocator;
use crate::errors::ValidationError;
use crate::models::{Block, BlockId, OrgId, RuleId};

lazy_static! {
    static ref LABEL_RE: Regex = Regex::new(r"^[A-Za-z0-9_]+$").expect("Invalid Regex?");
}

/// Selects the rule-type handler a rule is driven by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Provisions per (configuration, VPN membership) pair.
    Vpn,
    /// Provisions per registered device configuration.
    Device,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Vpn => write!(f, "VPN"),
            RuleKind::Device => write!(f, "Device"),
        }
    }
}

/// Declarative configuration for one subdivision rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdivisionRule {
    pub id: RuleId,
    /// Keyword prefix; alphanumeric characters and underscores only.
    pub label: String,
    pub kind: RuleKind,
    /// The master block being subdivided.
    pub master_block: BlockId,
    /// Prefix length of each derived sub-block. Immutable after creation.
    pub size: u8,
    /// Sub-blocks provisioned per target. Immutable after creation.
    pub number_of_subnets: u32,
    /// Addresses provisioned inside each sub-block. May only increase.
    pub number_of_ips: u32,
    /// Tenant scope; `None` means the rule is shared.
    pub organization: Option<OrgId>,
}

impl SubdivisionRule {
    /// Validate the rule against its master block.
    ///
    /// Returns the first failing field with a message meant for whoever is
    /// editing the rule.
    pub fn validate(&self, master: &Block) -> Result<(), ValidationError> {
        if !LABEL_RE.is_match(&self.label) {
            return Err(ValidationError::new(
                "label",
                "Only alphanumeric characters and underscores are allowed.",
            ));
        }
        if self.number_of_subnets < 1 {
            return Err(ValidationError::new(
                "number_of_subnets",
                "Ensure this value is greater than or equal to 1.",
            ));
        }
        if self.number_of_ips < 1 {
            return Err(ValidationError::new(
                "number_of_ips",
                "Ensure this value is greater than or equal to 1.",
            ));
        }
        let max = master.cidr.max_prefix();
        if self.size > max || self.size < master.cidr.prefix {
            return Err(ValidationError::new(
                "size",
                format!(
                    "Master block cannot accommodate sub-blocks of size /{}",
                    self.size
                ),
            ));
        }
        if !allocator::fits(&master.cidr, self.size, self.number_of_subnets) {
            return Err(ValidationError::new(
                "number_of_subnets",
                "The master block is too small to accommodate the requested number \
                 of sub-blocks plus the reserved sub-block, please increase the \
                 size of the master block or decrease the size of the sub-blocks.",
            ));
        }
        let host_len = max - self.size;
        let capacity = if host_len >= 128 {
            u128::MAX
        } else {
            1u128 << host_len
        };
        if self.number_of_ips as u128 > capacity {
            return Err(ValidationError::new(
                "number_of_ips",
                format!(
                    "Derived sub-blocks of size /{} cannot accommodate {} addresses.",
                    self.size, self.number_of_ips
                ),
            ));
        }
        if let Some(master_org) = master.organization {
            if self.organization != Some(master_org) {
                return Err(ValidationError::new(
                    "organization",
                    "Organization should be same as the master block",
                ));
            }
        }
        Ok(())
    }

    /// Validate an edit against the stored state: `size` and
    /// `number_of_subnets` are structural and immutable once any allocation
    /// may exist; `number_of_ips` may only grow.
    pub fn validate_update(&self, old: &SubdivisionRule) -> Result<(), ValidationError> {
        if self.size != old.size {
            return Err(ValidationError::new(
                "size",
                "Sub-block size cannot be changed",
            ));
        }
        if self.number_of_subnets != old.number_of_subnets {
            return Err(ValidationError::new(
                "number_of_subnets",
                "Number of sub-blocks cannot be changed",
            ));
        }
        if self.number_of_ips < old.number_of_ips {
            return Err(ValidationError::new(
                "number_of_ips",
                "Number of addresses cannot be decreased",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SubdivisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}
