//! Candidate cleaning and deduplication.

use std::collections::HashSet;

use tracing::debug;

use crate::disasm::Flow;
use crate::rop::Gadget;

/// Mnemonics that make a gadget useless no matter where they appear.
const BLACKLISTED_MNEMONICS: &[&str] = &["int3", "hlt"];

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    /// Undefined opcode or a blacklisted instruction.
    Undefined,
    /// The last instruction does not end a gadget of this kind.
    BadTerminator,
    /// A control transfer before the terminator while multi-branch is off.
    MultiBranch,
    /// More than one return in the sequence.
    MultiReturn,
}

/// Check one raw candidate.
pub fn check(gadget: &Gadget, allow_multi_branch: bool) -> Result<(), Rejection> {
    let Some((last, body)) = gadget.instructions.split_last() else {
        return Err(Rejection::Empty);
    };

    let undefined = gadget.instructions.iter().any(|i| {
        i.flow == Flow::Undefined || BLACKLISTED_MNEMONICS.contains(&i.base_mnemonic())
    });
    if undefined {
        return Err(Rejection::Undefined);
    }
    if !last.flow.terminates(gadget.kind) {
        return Err(Rejection::BadTerminator);
    }
    if body.iter().any(|i| i.flow == Flow::Return) {
        return Err(Rejection::MultiReturn);
    }
    if !allow_multi_branch && body.iter().any(|i| i.flow.is_control_transfer()) {
        return Err(Rejection::MultiBranch);
    }
    Ok(())
}

/// Keep the candidates that pass [`check`], preserving order.
pub fn clean(gadgets: Vec<Gadget>, allow_multi_branch: bool) -> Vec<Gadget> {
    let before = gadgets.len();
    let kept: Vec<Gadget> = gadgets
        .into_iter()
        .filter(|g| check(g, allow_multi_branch).is_ok())
        .collect();
    debug!(before, after = kept.len(), "cleaned candidates");
    kept
}

/// Collapse gadgets with identical instruction text, keeping the first seen.
///
/// The address is not part of the key, so the same byte sequence found at
/// several call sites is reported once.
pub fn dedup(gadgets: Vec<Gadget>, keep_all: bool) -> Vec<Gadget> {
    if keep_all {
        return gadgets;
    }
    let before = gadgets.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(gadgets.len());
    let kept: Vec<Gadget> = gadgets
        .into_iter()
        .filter(|g| seen.insert(g.text().to_string()))
        .collect();
    debug!(before, after = kept.len(), "deduplicated gadgets");
    kept
}
