//! Text rendering for gadget listings and search results.
//!
//! Every listing line starts with an address formatted to the target's
//! pointer width (`0x%08x` or `0x%016x`) and rebased by the configured
//! offset.

use std::collections::BTreeMap;

use colored::{ColoredString, Colorize};

use crate::config::SearchConfig;
use crate::rop::Gadget;
use crate::rop_chain::{Chain, GadgetSummary};
use crate::strings::{is_printable_ascii, ByteMatch, MemByte};
use crate::types::Arch;

const RULE: &str = "============================================================";

/// Listing formatter for one target.
#[derive(Debug, Clone)]
pub struct Printer {
    arch: Arch,
    offset: u64,
    dump: bool,
    color: bool,
}

impl Printer {
    pub fn new(arch: Arch, config: &SearchConfig) -> Self {
        Self {
            arch,
            offset: config.offset,
            dump: false,
            color: false,
        }
    }

    /// Append raw gadget bytes as ` // <hex>`.
    pub fn dump(mut self, enabled: bool) -> Self {
        self.dump = enabled;
        self
    }

    pub fn color(mut self, enabled: bool) -> Self {
        self.color = enabled;
        self
    }

    fn paint<F: Fn(&str) -> ColoredString>(&self, text: &str, style: F) -> String {
        if self.color {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }

    /// Already-rebased address.
    fn addr(&self, addr: u64) -> String {
        self.paint(&self.arch.format_addr(addr), |s| s.bold())
    }

    fn header(&self, title: &str) -> String {
        format!("{}\n{}\n", self.paint(title, |s| s.bold()), RULE)
    }

    pub fn gadget_line(&self, gadget: &Gadget) -> String {
        let mut line = format!(
            "{} : {}",
            self.addr(gadget.virtual_address.wrapping_add(self.offset)),
            self.paint(gadget.text(), |s| s.cyan())
        );
        if self.dump {
            line.push_str(" // ");
            line.push_str(&gadget.hex_bytes());
        }
        line
    }

    /// Full listing with header and unique-gadget count.
    pub fn gadgets(&self, gadgets: &[Gadget]) -> String {
        let mut out = self.header("Gadgets information");
        for gadget in gadgets {
            out.push_str(&self.gadget_line(gadget));
            out.push('\n');
        }
        out.push_str(&format!("\nUnique gadgets found: {}\n", gadgets.len()));
        out
    }

    /// Bare lines, used by console `search`.
    pub fn gadget_lines<'g>(&self, gadgets: impl IntoIterator<Item = &'g Gadget>) -> String {
        gadgets
            .into_iter()
            .map(|g| format!("{}\n", self.gadget_line(g)))
            .collect()
    }

    pub fn byte_matches(&self, title: &str, matches: &[ByteMatch]) -> String {
        let mut out = self.header(title);
        for m in matches {
            out.push_str(&format!("{} : {}\n", self.addr(m.address), m.content));
        }
        out
    }

    pub fn memstr(&self, found: &[MemByte]) -> String {
        let mut out = self.header("Memory bytes information");
        for entry in found {
            let shown = if is_printable_ascii(entry.byte) {
                format!("'{}'", entry.byte as char)
            } else {
                format!("'\\x{:02x}'", entry.byte)
            };
            match entry.address {
                Some(addr) => out.push_str(&format!("{} : {}\n", self.addr(addr), shown)),
                None => out.push_str(&format!(
                    "{}\n",
                    self.paint(&format!("{} not found", shown), |s| s.yellow())
                )),
            }
        }
        out
    }

    /// Gadgets grouped per class, then the satisfied-class and gadget counts.
    pub fn classes(&self, groups: &BTreeMap<String, Vec<&Gadget>>, total: usize) -> String {
        let mut out = self.header("Gadgets information");
        for (class, members) in groups {
            out.push_str(&format!("\n{}\n{}\n{}\n", RULE, self.paint(class, |s| s.green()), RULE));
            out.push_str(&self.gadget_lines(members.iter().copied()));
        }
        out.push_str(&format!("\n{} Classes Satisfied\n", groups.len()));
        out.push_str(&format!("\nUnique gadgets found: {}\n", total));
        out
    }

    pub fn function_counts(&self, counts: &[(String, usize)]) -> String {
        let mut out = String::new();
        for (name, count) in counts {
            out.push_str(&format!("{} has {} gadgets\n", self.paint(name, |s| s.green()), count));
        }
        out
    }

    pub fn chain_summary(&self, summary: &GadgetSummary) -> String {
        let regs = |list: &[crate::rop_chain::Reg]| {
            list.iter()
                .map(|r| r.name(self.arch))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let moves = summary
            .moves
            .iter()
            .map(|(dst, src)| format!("{}<-{}", dst.name(self.arch), src.name(self.arch)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "  loadable registers: {}\n  register moves:     {}\n  memory loads:       {}\n  write primitives:   {}\n  syscall gadgets:    {}\n  stack pivots:       {}\n",
            regs(&summary.loadable),
            moves,
            regs(&summary.memory_loads),
            summary.write_primitives,
            summary.traps,
            summary.stack_pivots
        )
    }

    /// Annotated chain listing followed by the payload script.
    pub fn chain(&self, chain: &Chain) -> String {
        let mut out = self.header("ROP chain generation");
        out.push_str(&chain.render());
        out.push_str(&format!("\n{} bytes\n\n", chain.size()));
        out.push_str(&chain.to_python());
        out
    }
}
