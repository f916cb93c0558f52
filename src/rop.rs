//! Gadget search engine.
//!
//! Finds every byte offset in an executable section that decodes to a
//! gadget terminator, then walks backwards from each terminator trying
//! every start offset within `depth * max_instruction_length` bytes. A
//! start offset yields a candidate when a straight decode from it lands
//! exactly on the terminator within `depth` instructions.
//!
//! Work is split into one unit per (section, class) pair and fanned out with
//! rayon; units share only immutable inputs and are merged in unit order.

use std::fmt;

use rayon::prelude::*;
use tracing::debug;

use crate::disasm::{Flow, Instruction, InstructionDecoder};
use crate::section::Section;
use crate::types::{Arch, GadgetKind};

/// A discovered gadget.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gadget {
    /// Address of the first instruction (not rebased).
    pub virtual_address: u64,
    pub arch: Arch,
    /// Instructions in execution order; the last one is the terminator.
    pub instructions: Vec<Instruction>,
    pub raw_bytes: Vec<u8>,
    pub kind: GadgetKind,
    text: String,
}

impl Gadget {
    pub fn new(
        virtual_address: u64,
        arch: Arch,
        instructions: Vec<Instruction>,
        raw_bytes: Vec<u8>,
        kind: GadgetKind,
    ) -> Self {
        let text = render(&instructions);
        Self {
            virtual_address,
            arch,
            instructions,
            raw_bytes,
            kind,
            text,
        }
    }

    /// Instruction text, e.g. `pop ebx ; ret`. Also the dedup/sort key.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// `raw_bytes` as lowercase hex, used by `--dump`.
    pub fn hex_bytes(&self) -> String {
        self.raw_bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.arch.format_addr(self.virtual_address), self.text)
    }
}

fn render(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ; ")
}

/// Brute-force backward gadget search over one decoder.
pub struct GadgetSearchEngine<'d, D: InstructionDecoder + ?Sized> {
    decoder: &'d D,
    depth: usize,
}

impl<'d, D: InstructionDecoder + ?Sized> GadgetSearchEngine<'d, D> {
    /// `depth` is the maximum instruction count per gadget, terminator included.
    pub fn new(decoder: &'d D, depth: usize) -> Self {
        Self { decoder, depth }
    }

    /// Search every (section, class) pair in parallel.
    ///
    /// The result is ordered by section, then by class in `kinds` order,
    /// then by scan order within the unit.
    pub fn search_all(&self, sections: &[Section<'_>], kinds: &[GadgetKind]) -> Vec<Gadget> {
        let units: Vec<(&Section<'_>, GadgetKind)> = sections
            .iter()
            .flat_map(|s| kinds.iter().map(move |&k| (s, k)))
            .collect();

        units
            .par_iter()
            .map(|(section, kind)| self.search(section, *kind))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    }

    /// Raw candidates of one class in one section.
    pub fn search(&self, section: &Section<'_>, kind: GadgetKind) -> Vec<Gadget> {
        let decoded = self.decode_section(section);
        let mut gadgets = Vec::new();

        for (tail, entry) in decoded.iter().enumerate() {
            let Some((tail_len, flow)) = *entry else {
                continue;
            };
            if !flow.terminates(kind) {
                continue;
            }
            self.gadgets_ending_at(section, &decoded, tail, tail_len, kind, &mut gadgets);
        }

        debug!(
            section = %section.name,
            kind = %kind,
            candidates = gadgets.len(),
            "scanned section"
        );
        gadgets
    }

    /// Decode once at every offset; entries are `None` where decoding fails.
    fn decode_section(&self, section: &Section<'_>) -> Vec<Option<(usize, Flow)>> {
        let bytes = section.bytes;
        (0..bytes.len())
            .map(|off| {
                self.decoder
                    .decode_flow(&bytes[off..], section.virtual_address + off as u64)
                    .ok()
            })
            .collect()
    }

    fn gadgets_ending_at(
        &self,
        section: &Section<'_>,
        decoded: &[Option<(usize, Flow)>],
        tail: usize,
        tail_len: usize,
        kind: GadgetKind,
        out: &mut Vec<Gadget>,
    ) {
        let window = self.depth.saturating_mul(self.decoder.max_instruction_length());
        let max_back = window.min(tail);

        for back in 1..=max_back {
            let start = tail - back;
            if !self.lands_on(decoded, start, tail) {
                continue;
            }
            if let Some(gadget) = self.build(section, start, tail + tail_len, kind) {
                out.push(gadget);
            }
        }
    }

    /// Whether a straight decode from `start` reaches `tail` exactly with
    /// room left for the terminator.
    fn lands_on(&self, decoded: &[Option<(usize, Flow)>], start: usize, tail: usize) -> bool {
        let mut off = start;
        let mut count = 0;
        while off < tail {
            let Some((len, _)) = decoded[off] else {
                return false;
            };
            off += len;
            count += 1;
            if count >= self.depth {
                return false;
            }
        }
        off == tail
    }

    fn build(&self, section: &Section<'_>, start: usize, end: usize, kind: GadgetKind) -> Option<Gadget> {
        let bytes = section.bytes;
        let mut instructions = Vec::new();
        let mut off = start;
        while off < end {
            let mut insn = self
                .decoder
                .decode_one(&bytes[off..], section.virtual_address + off as u64)
                .ok()?;
            insn.offset_in_gadget = off - start;
            off += insn.encoded_length;
            instructions.push(insn);
        }
        if off != end {
            return None;
        }

        Some(Gadget::new(
            section.virtual_address + start as u64,
            self.decoder.arch(),
            instructions,
            bytes[start..end].to_vec(),
            kind,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::X86Decoder;

    fn search(arch: Arch, bytes: &[u8], depth: usize, kind: GadgetKind) -> Vec<Gadget> {
        let decoder = X86Decoder::new(arch);
        let section = Section::code(".text", 0x1000, 0, bytes);
        GadgetSearchEngine::new(&decoder, depth).search(&section, kind)
    }

    #[test]
    fn pop_ebx_ret() {
        let gadgets = search(Arch::X86, &[0x5b, 0xc3], 2, GadgetKind::Rop);
        assert_eq!(gadgets.len(), 1);
        assert_eq!(gadgets[0].virtual_address, 0x1000);
        assert_eq!(gadgets[0].text(), "pop ebx ; ret");
        assert_eq!(gadgets[0].raw_bytes, vec![0x5b, 0xc3]);
        assert_eq!(gadgets[0].kind, GadgetKind::Rop);
    }

    #[test]
    fn multi_pop_ret_all_suffixes() {
        // pop rsi; pop rdi; ret
        let gadgets = search(Arch::X86_64, &[0x5e, 0x5f, 0xc3], 5, GadgetKind::Rop);
        let texts: Vec<&str> = gadgets.iter().map(Gadget::text).collect();
        assert_eq!(texts, vec!["pop rdi ; ret", "pop rsi ; pop rdi ; ret"]);
        assert_eq!(gadgets[1].virtual_address, 0x1000);
    }

    #[test]
    fn depth_bounds_instruction_count() {
        // pop rax; pop rbx; pop rcx; pop rdx; pop rsi; pop rdi; ret
        let bytes = [0x58, 0x5b, 0x59, 0x5a, 0x5e, 0x5f, 0xc3];
        let gadgets = search(Arch::X86_64, &bytes, 3, GadgetKind::Rop);
        assert_eq!(gadgets.len(), 2);
        assert!(gadgets.iter().all(|g| g.len() <= 3));
    }

    #[test]
    fn huge_depth_is_bounded_by_section() {
        let gadgets = search(Arch::X86_64, &[0x5e, 0x5f, 0xc3], usize::MAX, GadgetKind::Rop);
        let texts: Vec<&str> = gadgets.iter().map(Gadget::text).collect();
        assert_eq!(texts, vec!["pop rdi ; ret", "pop rsi ; pop rdi ; ret"]);
    }

    #[test]
    fn instruction_lengths_cover_raw_bytes() {
        // mov rdi, rax; ret
        let gadgets = search(Arch::X86_64, &[0x48, 0x89, 0xc7, 0xc3], 4, GadgetKind::Rop);
        for g in &gadgets {
            let total: usize = g.instructions.iter().map(|i| i.encoded_length).sum();
            assert_eq!(total, g.raw_bytes.len());
            let last = g.instructions.last().unwrap();
            assert_eq!(last.offset_in_gadget + last.encoded_length, g.raw_bytes.len());
        }
        assert!(gadgets.iter().any(|g| g.text() == "mov rdi, rax ; ret"));
    }

    #[test]
    fn misaligned_entry_points_are_found() {
        // mov eax, 0xc35f5e00 hides "pop esi ; pop edi ; ret" inside the immediate.
        let bytes = [0x90, 0xb8, 0x00, 0x5e, 0x5f, 0xc3];
        let gadgets = search(Arch::X86, &bytes, 4, GadgetKind::Rop);
        assert!(gadgets.iter().any(|g| g.text() == "pop esi ; pop edi ; ret"
            && g.virtual_address == 0x1003));
    }

    #[test]
    fn jop_and_sys_classes() {
        // pop rax; jmp rax
        let jop = search(Arch::X86_64, &[0x58, 0xff, 0xe0], 3, GadgetKind::Jop);
        assert_eq!(jop.len(), 1);
        assert_eq!(jop[0].text(), "pop rax ; jmp rax");

        // pop eax; int 0x80
        let sys = search(Arch::X86, &[0x58, 0xcd, 0x80], 3, GadgetKind::Sys);
        assert_eq!(sys.len(), 1);
        assert_eq!(sys[0].text(), "pop eax ; int 0x80");
        assert_eq!(sys[0].kind, GadgetKind::Sys);
    }

    #[test]
    fn class_specific_terminators() {
        let bytes = [0x5b, 0xc3];
        assert!(search(Arch::X86, &bytes, 3, GadgetKind::Jop).is_empty());
        assert!(search(Arch::X86, &bytes, 3, GadgetKind::Sys).is_empty());
    }

    #[test]
    fn no_decode_past_section_end() {
        // Trailing b8 would need four more bytes.
        let gadgets = search(Arch::X86, &[0x5b, 0xc3, 0xb8], 3, GadgetKind::Rop);
        assert_eq!(gadgets.len(), 1);
    }

    #[test]
    fn empty_section() {
        assert!(search(Arch::X86_64, &[], 3, GadgetKind::Rop).is_empty());
    }

    #[test]
    fn addresses_stay_in_section() {
        let bytes = [0x90, 0x58, 0x5b, 0xc3, 0x90, 0x5f, 0xc3, 0xff, 0xe0];
        let decoder = X86Decoder::new(Arch::X86_64);
        let section = Section::code(".text", 0x400000, 0, &bytes);
        let engine = GadgetSearchEngine::new(&decoder, 4);
        let gadgets = engine.search_all(std::slice::from_ref(&section), &GadgetKind::ALL);
        assert!(!gadgets.is_empty());
        for g in &gadgets {
            assert!(section.contains(g.virtual_address));
            assert!(g.len() <= 4);
        }
    }

    #[test]
    fn parallel_search_is_ordered() {
        let bytes = [0x90, 0x58, 0x5b, 0xc3, 0x90, 0x5f, 0xc3, 0xff, 0xe0];
        let decoder = X86Decoder::new(Arch::X86_64);
        let sections = vec![
            Section::code("a", 0x1000, 0, &bytes),
            Section::code("b", 0x2000, 0x100, &bytes),
        ];
        let engine = GadgetSearchEngine::new(&decoder, 4);
        let first = engine.search_all(&sections, &GadgetKind::ALL);
        let second = engine.search_all(&sections, &GadgetKind::ALL);
        assert_eq!(first, second);
        assert!(first[0].virtual_address < 0x2000);
    }
}
