//! Gadget classes for one-instruction gadgets.
//!
//! A class table maps an instruction, keyed by `(mnemonic, operand1,
//! operand2)`, to the set of class names it belongs to. Tables are plain
//! text: a `classname <name>` line opens a class and each following line is
//! an instruction. Only gadgets made of a single instruction plus a return
//! are classified.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::error::{Error, Result};
use crate::rop::Gadget;

/// The table shipped with the crate.
pub const BUNDLED: &str = include_str!("../data/classes.txt");

type Key = (String, String, String);

fn key(mnemonic: &str, op1: &str, op2: &str) -> Key {
    (mnemonic.to_string(), op1.to_string(), op2.to_string())
}

/// Split `mov eax, ebx` into `("mov", "eax", "ebx")`.
///
/// Instructions with more than two operands have no key.
fn split_instruction(text: &str) -> Option<Key> {
    let text = text.trim();
    let (mnemonic, rest) = match text.split_once(' ') {
        Some((m, rest)) => (m, rest.trim()),
        None => (text, ""),
    };
    let mut operands = rest.split(',').map(str::trim).filter(|s| !s.is_empty());
    let op1 = operands.next().unwrap_or("");
    let op2 = operands.next().unwrap_or("");
    if operands.next().is_some() {
        return None;
    }
    Some(key(mnemonic, op1, op2))
}

/// Lookup from instruction to class names.
#[derive(Debug, Clone, Default)]
pub struct GadgetClasses {
    table: HashMap<Key, BTreeSet<String>>,
}

impl GadgetClasses {
    /// Parse a class table. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table: HashMap<Key, BTreeSet<String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix("classname ") {
                current = Some(name.trim().to_string());
                continue;
            }
            let Some(class) = &current else {
                return Err(Error::Config(format!(
                    "class table line {}: instruction before any classname",
                    lineno + 1
                )));
            };
            let key = split_instruction(line).ok_or_else(|| {
                Error::Config(format!("class table line {}: too many operands", lineno + 1))
            })?;
            table.entry(key).or_default().insert(class.clone());
        }

        debug!(instructions = table.len(), "parsed gadget class table");
        Ok(Self { table })
    }

    pub fn bundled() -> Result<Self> {
        Self::parse(BUNDLED)
    }

    /// Classes of one instruction; empty when the table has no entry.
    pub fn lookup(&self, mnemonic: &str, op1: &str, op2: &str) -> BTreeSet<&str> {
        self.table
            .get(&key(mnemonic, op1, op2))
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Classes of a gadget, if it is one instruction followed by a return.
    pub fn classes_of(&self, gadget: &Gadget) -> BTreeSet<&str> {
        let [insn, last] = gadget.instructions.as_slice() else {
            return BTreeSet::new();
        };
        if !last.base_mnemonic().starts_with('r') {
            return BTreeSet::new();
        }
        match split_instruction(&insn.to_string()) {
            Some((m, op1, op2)) => self.lookup(&m, &op1, &op2),
            None => BTreeSet::new(),
        }
    }

    /// Gadgets grouped by class name, in input order within each class.
    pub fn group<'g>(&self, gadgets: &'g [Gadget]) -> BTreeMap<String, Vec<&'g Gadget>> {
        let mut groups: BTreeMap<String, Vec<&'g Gadget>> = BTreeMap::new();
        for gadget in gadgets {
            for class in self.classes_of(gadget) {
                groups.entry(class.to_string()).or_default().push(gadget);
            }
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
