//! Error types for the subdivision engine.
//!
//! Three conditions are expected control flow and carry their own types:
//! [`ValidationError`] (blocks a rule save), [`CapacityError`] (master block
//! exhausted, degraded to a notification) and [`NotFoundError`] (stale
//! background task). Everything else is a bug, not control flow.

use thiserror::Error;

use crate::models::{Cidr, RuleId};

/// Invalid CIDR input or address arithmetic out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    /// Input was not in `addr/prefix` form.
    #[error("invalid CIDR format: {0}")]
    Format(String),
    /// The address part did not parse.
    #[error("invalid IP address: {0}")]
    Address(String),
    /// Prefix length exceeds the address-family maximum.
    #[error("network length /{prefix} is too long (max /{max})")]
    PrefixTooLong { prefix: u8, max: u8 },
    /// An address offset or next-block step left the block or address space.
    #[error("address arithmetic out of range")]
    OutOfRange,
}

/// A rule failed field validation. Surfaced synchronously to whoever edits
/// the rule; the save must not proceed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// The rule field the message belongs to.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError {
            field,
            message: message.into(),
        }
    }
}

/// A block cannot fit the requested sub-blocks or addresses.
///
/// At rule-definition time this becomes a [`ValidationError`]; at
/// provisioning time the engine catches it, logs an error and emits a
/// notification instead of failing the triggering workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct CapacityError {
    /// The exhausted block.
    pub block: Cidr,
    pub detail: String,
}

impl CapacityError {
    pub fn new(block: Cidr, detail: impl Into<String>) -> Self {
        CapacityError {
            block,
            detail: detail.into(),
        }
    }
}

/// A background task referenced a rule that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subdivision rule with id \"{rule}\" does not exist")]
pub struct NotFoundError {
    pub rule: RuleId,
}

/// Engine-level error surface for the rule CRUD API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error(transparent)]
    Cidr(#[from] CidrError),
}
