//! Pure CIDR subdivision planning.
//!
//! Splits a master block into consecutive sub-blocks of a fixed prefix
//! length and selects host addresses within a sub-block. No I/O and no
//! store access; callers pass in the blocks already persisted under the
//! master and persist the results themselves.

use std::net::IpAddr;

use crate::errors::{CapacityError, CidrError};
use crate::models::Cidr;

/// Whether `master` can fit `count` sub-blocks of `size` plus the reserved
/// sub-block at index 0. Used by rule validation.
pub fn fits(master: &Cidr, size: u8, count: u32) -> bool {
    if size > master.max_prefix() || size < master.prefix {
        return false;
    }
    let diff = size - master.prefix;
    let slots = if diff >= 128 { u128::MAX } else { 1u128 << diff };
    slots >= count as u128 + 1
}

/// The sub-block at index 0 of the master's walk. Permanently reserved,
/// never allocated to any target.
pub fn reserved_block(master: &Cidr, size: u8) -> Result<Cidr, CidrError> {
    Cidr::from_parts(master.network(), size)
}

fn exhausted(master: &Cidr, size: u8) -> CapacityError {
    CapacityError::new(
        *master,
        format!("no space left in {master} for /{size} sub-blocks"),
    )
}

/// Plan `count` sub-blocks of `size` inside `master`.
///
/// Walks the master in consecutive sub-blocks starting at its base address.
/// Index 0 is always reserved and never returned; candidates overlapping a
/// block in `used` are skipped, so concurrent targets sharing the master end
/// up on disjoint ranges. Returns `(index, block)` pairs in address order.
pub fn plan_blocks(
    master: &Cidr,
    size: u8,
    count: u32,
    used: &[Cidr],
) -> Result<Vec<(u32, Cidr)>, CapacityError> {
    if size > master.max_prefix() || size < master.prefix {
        return Err(CapacityError::new(
            *master,
            format!("{master} cannot be divided into /{size} sub-blocks"),
        ));
    }
    let mut candidate = reserved_block(master, size).map_err(|_| exhausted(master, size))?;
    let mut index = 0u32;
    let mut planned = Vec::with_capacity(count as usize);

    while planned.len() < count as usize {
        candidate = candidate
            .next_block()
            .map_err(|_| exhausted(master, size))?;
        index += 1;
        if !master.contains(&candidate.network()) {
            return Err(exhausted(master, size));
        }
        if used.iter().any(|u| u.overlaps(&candidate)) {
            continue;
        }
        planned.push((index, candidate));
    }
    Ok(planned)
}

/// Select `count` host addresses inside `block`, in ascending order.
///
/// When `count` equals the block's full capacity, every address is returned
/// starting at the base address (appropriate for point-to-point and tunnel
/// pools, and what makes a /32 or /128 block behave as "the address
/// itself"). Otherwise the base address is treated as reserved and the
/// sequence starts at base+1.
pub fn select_hosts(block: &Cidr, count: u32) -> Result<Vec<IpAddr>, CapacityError> {
    let capacity = block.capacity();
    if count as u128 > capacity {
        return Err(CapacityError::new(
            *block,
            format!("{block} cannot accommodate {count} addresses"),
        ));
    }
    let start: u128 = if count as u128 == capacity { 0 } else { 1 };
    (0..count as u128)
        .map(|i| {
            block
                .nth(start + i)
                .map_err(|_| CapacityError::new(*block, format!("{block} has no address left")))
        })
        .collect()
}

/// The addresses `old_count+1 ..= new_count` of the sequence already chosen
/// by [`select_hosts`] for `old_count`, without disturbing existing
/// assignments. `old_count` must have been a partial selection (a full one
/// cannot grow past validation).
pub fn extend_hosts(
    block: &Cidr,
    old_count: u32,
    new_count: u32,
) -> Result<Vec<IpAddr>, CapacityError> {
    if new_count as u128 > block.capacity() {
        return Err(CapacityError::new(
            *block,
            format!("{block} cannot accommodate {new_count} addresses"),
        ));
    }
    (old_count as u128 + 1..=new_count as u128)
        .map(|m| {
            block
                .nth(m)
                .map_err(|_| CapacityError::new(*block, format!("{block} has no address left")))
        })
        .collect()
}
