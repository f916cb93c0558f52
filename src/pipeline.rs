//! End-to-end gadget search: clip, scan, clean, dedup, filter, sort.

use std::cmp::Ordering;

use tracing::{info, warn};

use crate::config::SearchConfig;
use crate::disasm::InstructionDecoder;
use crate::filter;
use crate::rop::{Gadget, GadgetSearchEngine};
use crate::section::Section;
use crate::validate;

/// Total order used for the final listing: text, then address.
pub fn gadget_order(a: &Gadget, b: &Gadget) -> Ordering {
    a.text()
        .cmp(b.text())
        .then(a.virtual_address.cmp(&b.virtual_address))
}

/// Sort into the deterministic listing order.
pub fn sort(gadgets: &mut [Gadget]) {
    gadgets.sort_by(gadget_order);
}

/// Run a full search over `sections` with one config snapshot.
///
/// Non-executable sections are skipped. The result replaces any previous
/// gadget list; nothing is carried over between calls.
pub fn find_gadgets<D: InstructionDecoder + ?Sized>(
    sections: &[Section<'_>],
    decoder: &D,
    config: &SearchConfig,
) -> Vec<Gadget> {
    if config.thumb_mode {
        warn!(arch = %decoder.arch(), "thumb mode only applies to ARM targets, ignoring");
    }

    let clipped: Vec<Section<'_>> = sections
        .iter()
        .filter(|s| s.is_executable)
        .filter_map(|s| s.clip(config.address_range))
        .collect();

    let engine = GadgetSearchEngine::new(decoder, config.depth);
    let raw = engine.search_all(&clipped, &config.kinds());
    let cleaned = validate::clean(raw, config.allow_multi_branch);
    let unique = validate::dedup(cleaned, config.keep_all_duplicates);
    let mut gadgets = filter::apply(unique, config, decoder.arch().address_width());
    sort(&mut gadgets);

    info!(
        sections = clipped.len(),
        gadgets = gadgets.len(),
        "gadget search finished"
    );
    gadgets
}
