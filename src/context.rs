//! Keyword -> value export for configuration rendering.
//!
//! The rendering collaborator consumes one flat string mapping per
//! configuration; this module builds it from the index entries. Deterministic
//! and side-effect free, safe to call repeatedly.

use itertools::Itertools;
use std::collections::BTreeMap;

use crate::models::ConfigId;
use crate::store::Store;

/// Build the template context for `config`: one `{label}_prefixlen` entry
/// per applicable rule, plus each index keyword mapped to the block's or
/// address's textual form.
pub fn export(store: &Store, config: ConfigId) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    let by_rule = store
        .entries_for_config(config)
        .into_iter()
        .into_group_map_by(|e| e.rule);

    for (rule_id, entries) in by_rule {
        if let Some(rule) = store.rule(rule_id) {
            context.insert(format!("{}_prefixlen", rule.label), rule.size.to_string());
        } else {
            log::warn!("Index entries reference unknown rule id {rule_id}");
        }
        for entry in entries {
            let value = match entry.address {
                Some(address) => match store.address(address) {
                    Some(address) => address.ip.to_string(),
                    None => {
                        log::warn!("Index entry {} references a missing address", entry.keyword);
                        continue;
                    }
                },
                None => match store.block(entry.block) {
                    Some(block) => block.cidr.to_string(),
                    None => {
                        log::warn!("Index entry {} references a missing block", entry.keyword);
                        continue;
                    }
                },
            };
            context.insert(entry.keyword.clone(), value);
        }
    }
    context
}
