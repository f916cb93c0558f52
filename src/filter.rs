//! User-selected inclusion/exclusion rules, applied after deduplication.
//!
//! Order is fixed: address range, bad bytes, only/filter mnemonics, regex.
//! Every stage is a pure predicate, so running the pipeline twice with the
//! same config is a no-op the second time.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::SearchConfig;
use crate::rop::Gadget;

/// Whether `addr`, encoded little-endian in `width` bytes, avoids `bad_bytes`.
pub fn address_is_clean(addr: u64, width: usize, bad_bytes: &BTreeSet<u8>) -> bool {
    if bad_bytes.is_empty() {
        return true;
    }
    addr.to_le_bytes()
        .iter()
        .take(width.min(8))
        .all(|b| !bad_bytes.contains(b))
}

fn in_range(gadget: &Gadget, config: &SearchConfig) -> bool {
    config
        .address_range
        .map_or(true, |r| r.contains(gadget.virtual_address))
}

fn clean_address(gadget: &Gadget, config: &SearchConfig, width: usize) -> bool {
    address_is_clean(config.rebase(gadget.virtual_address), width, &config.bad_bytes)
}

fn mnemonics_allowed(gadget: &Gadget, config: &SearchConfig) -> bool {
    if let Some(only) = &config.only_mnemonics {
        return gadget
            .instructions
            .iter()
            .all(|i| only.contains(i.base_mnemonic()));
    }
    if !config.filter_mnemonics.is_empty() {
        return !gadget
            .instructions
            .iter()
            .any(|i| config.filter_mnemonics.contains(i.base_mnemonic()));
    }
    true
}

fn matches_regex(gadget: &Gadget, config: &SearchConfig) -> bool {
    config
        .regex
        .as_ref()
        .map_or(true, |re| re.is_match(gadget.text()))
}

/// Apply every configured filter in order.
///
/// `address_width` is the target's pointer width in bytes, used for the
/// bad-byte check on the rebased address.
pub fn apply(gadgets: Vec<Gadget>, config: &SearchConfig, address_width: usize) -> Vec<Gadget> {
    let before = gadgets.len();
    let kept: Vec<Gadget> = gadgets
        .into_iter()
        .filter(|g| in_range(g, config))
        .filter(|g| clean_address(g, config, address_width))
        .filter(|g| mnemonics_allowed(g, config))
        .filter(|g| matches_regex(g, config))
        .collect();
    debug!(before, after = kept.len(), "filtered gadgets");
    kept
}
