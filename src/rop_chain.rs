//! Automated ROP chain synthesis.
//!
//! Gadgets ending in a plain `ret` are summarized by running their body over
//! a small symbolic register model (which register ends up holding a stack
//! word, a constant, another register's entry value, or a value loaded from
//! memory). A chain goal is reduced to memory writes, register values and a
//! final trap; each requirement is met greedily with the shortest plan that
//! does not clobber a register satisfied earlier.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use tracing::debug;

use crate::disasm::Instruction;
use crate::error::{Error, Result};
use crate::rop::Gadget;
use crate::types::Arch;

/// Filler for stack words a gadget pops but the chain does not care about.
pub const PADDING: u64 = 0x4141_4141_4141_4141;

/// Longest register-move path tried when no direct load exists.
const MAX_MOVE_HOPS: usize = 3;

/// General-purpose register families, named by their 64-bit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reg {
    Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rbp, Rsp,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
    /// 64-bit or 32-bit register names.
    pub fn parse(name: &str) -> Option<Self> {
        let reg = match name {
            "rax" | "eax" => Reg::Rax,
            "rbx" | "ebx" => Reg::Rbx,
            "rcx" | "ecx" => Reg::Rcx,
            "rdx" | "edx" => Reg::Rdx,
            "rsi" | "esi" => Reg::Rsi,
            "rdi" | "edi" => Reg::Rdi,
            "rbp" | "ebp" => Reg::Rbp,
            "rsp" | "esp" => Reg::Rsp,
            "r8" | "r8d" => Reg::R8,
            "r9" | "r9d" => Reg::R9,
            "r10" | "r10d" => Reg::R10,
            "r11" | "r11d" => Reg::R11,
            "r12" | "r12d" => Reg::R12,
            "r13" | "r13d" => Reg::R13,
            "r14" | "r14d" => Reg::R14,
            "r15" | "r15d" => Reg::R15,
            _ => return None,
        };
        Some(reg)
    }

    /// 8- and 16-bit sub-registers, which only ever clobber their family.
    fn parse_partial(name: &str) -> Option<Self> {
        let reg = match name {
            "ax" | "al" | "ah" => Reg::Rax,
            "bx" | "bl" | "bh" => Reg::Rbx,
            "cx" | "cl" | "ch" => Reg::Rcx,
            "dx" | "dl" | "dh" => Reg::Rdx,
            "si" | "sil" => Reg::Rsi,
            "di" | "dil" => Reg::Rdi,
            "bp" | "bpl" => Reg::Rbp,
            "sp" | "spl" => Reg::Rsp,
            "r8w" | "r8b" => Reg::R8,
            "r9w" | "r9b" => Reg::R9,
            "r10w" | "r10b" => Reg::R10,
            "r11w" | "r11b" => Reg::R11,
            "r12w" | "r12b" => Reg::R12,
            "r13w" | "r13b" => Reg::R13,
            "r14w" | "r14b" => Reg::R14,
            "r15w" | "r15b" => Reg::R15,
            _ => return None,
        };
        Some(reg)
    }

    /// Register name as written for `arch`.
    pub fn name(self, arch: Arch) -> &'static str {
        let (long, short) = match self {
            Reg::Rax => ("rax", "eax"),
            Reg::Rbx => ("rbx", "ebx"),
            Reg::Rcx => ("rcx", "ecx"),
            Reg::Rdx => ("rdx", "edx"),
            Reg::Rsi => ("rsi", "esi"),
            Reg::Rdi => ("rdi", "edi"),
            Reg::Rbp => ("rbp", "ebp"),
            Reg::Rsp => ("rsp", "esp"),
            Reg::R8 => ("r8", "r8d"),
            Reg::R9 => ("r9", "r9d"),
            Reg::R10 => ("r10", "r10d"),
            Reg::R11 => ("r11", "r11d"),
            Reg::R12 => ("r12", "r12d"),
            Reg::R13 => ("r13", "r13d"),
            Reg::R14 => ("r14", "r14d"),
            Reg::R15 => ("r15", "r15d"),
        };
        match arch {
            Arch::X86_64 => long,
            Arch::X86 | Arch::X86_16 => short,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name(Arch::X86_64))
    }
}

/// Linux system-call register convention.
#[derive(Debug, Clone, Copy)]
pub struct SyscallAbi {
    pub number: Reg,
    pub args: &'static [Reg],
    pub execve: u64,
}

impl SyscallAbi {
    pub fn for_arch(arch: Arch) -> Option<Self> {
        match arch {
            Arch::X86_64 => Some(Self {
                number: Reg::Rax,
                args: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::R10, Reg::R8, Reg::R9],
                execve: 59,
            }),
            Arch::X86 => Some(Self {
                number: Reg::Rax,
                args: &[Reg::Rbx, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::Rbp],
                execve: 11,
            }),
            Arch::X86_16 => None,
        }
    }
}

/// Whether `insn` is the kernel trap used by `arch`.
fn is_trap(insn: &Instruction, arch: Arch) -> bool {
    match arch {
        Arch::X86_64 => insn.base_mnemonic() == "syscall",
        Arch::X86 => insn.base_mnemonic() == "int" && insn.operands == "0x80",
        Arch::X86_16 => false,
    }
}

/// Symbolic value of a register after a gadget body runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Unchanged: the register's value on entry.
    Entry(Reg),
    /// Low 32 bits of a register's entry value, zero-extended.
    Low32(Reg),
    /// The n-th stack word after the gadget's address.
    Stack(usize),
    Const(u64),
    /// Word in memory at the entry value of a register.
    Deref(Reg),
    /// Zero-extended dword in memory at the entry value of a register.
    Deref32(Reg),
    Unknown,
}

/// What a gadget body does to registers, memory and the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Effect {
    /// Final value of every register the body touches.
    pub writes: BTreeMap<Reg, Value>,
    /// `(address, value)` memory stores, in order.
    pub stores: Vec<(Value, Value)>,
    /// Stack words consumed before the terminator.
    pub stack_words: usize,
}

impl Effect {
    /// Registers whose value differs from entry.
    pub fn clobbers(&self) -> BTreeSet<Reg> {
        self.writes
            .iter()
            .filter(|(reg, value)| **value != Value::Entry(**reg))
            .map(|(reg, _)| *reg)
            .collect()
    }

    /// True when the body only shuffles registers and the stack.
    pub fn is_pure(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Why a gadget body cannot be modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unusable {
    /// The body moves the stack pointer.
    StackPivot,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    /// 64- or 32-bit register and its width in bytes.
    Reg(Reg, usize),
    Partial(Reg),
    Imm(u64),
    /// `base` is the register of a plain `[reg]` operand and `None` for any
    /// index, displacement or segment. `size` comes from the `ptr` keyword.
    Mem { base: Option<Reg>, size: Option<usize> },
    Other,
}

fn register_width(name: &str) -> usize {
    // rax..r15 are 64-bit; eax..edi and r8d..r15d are 32-bit.
    if name.starts_with('r') && !name.ends_with('d') {
        8
    } else {
        4
    }
}

fn memory_size(keyword: &str) -> Option<usize> {
    match keyword {
        "byte" => Some(1),
        "word" => Some(2),
        "dword" => Some(4),
        "qword" => Some(8),
        _ => None,
    }
}

fn parse_operand(text: &str) -> Operand {
    let text = text.trim();
    if let Some(open) = text.find('[') {
        let prefix = &text[..open];
        let size = prefix.split_whitespace().next().and_then(memory_size);
        let base = if prefix.contains(':') {
            None
        } else {
            Reg::parse(text[open + 1..].trim_end_matches(']').trim())
        };
        return Operand::Mem { base, size };
    }
    if let Some(reg) = Reg::parse(text) {
        return Operand::Reg(reg, register_width(text));
    }
    if let Some(reg) = Reg::parse_partial(text) {
        return Operand::Partial(reg);
    }
    let imm = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    };
    imm.map_or(Operand::Other, Operand::Imm)
}

/// Instructions that write their first operand and nothing else we track.
const CLOBBERING: &[&str] = &[
    "add", "sub", "and", "or", "xor", "adc", "sbb", "inc", "dec", "neg", "not", "shl", "shr",
    "sar", "sal", "rol", "ror", "lea", "movzx", "movsx", "movsxd", "xchg", "imul", "bswap",
    "cmovne", "cmove", "setne", "sete",
];

struct Machine {
    /// Pointer width in bytes; narrower register writes zero-extend.
    width: usize,
    regs: BTreeMap<Reg, Value>,
    stores: Vec<(Value, Value)>,
    words: usize,
}

impl Machine {
    fn new(arch: Arch) -> Self {
        Self {
            width: arch.address_width(),
            regs: BTreeMap::new(),
            stores: Vec::new(),
            words: 0,
        }
    }

    fn value(&self, reg: Reg) -> Value {
        self.regs.get(&reg).cloned().unwrap_or(Value::Entry(reg))
    }

    /// What a 32-bit copy of `src` leaves in a 64-bit register.
    fn low32(&self, src: Reg) -> Value {
        match self.value(src) {
            Value::Entry(reg) | Value::Low32(reg) => Value::Low32(reg),
            Value::Const(c) => Value::Const(c & 0xffff_ffff),
            _ => Value::Unknown,
        }
    }

    /// Record a store; only full-word stores have a known value.
    fn store(&mut self, base: Reg, size: Option<usize>, value: Value) {
        let value = if size == Some(self.width) {
            value
        } else {
            Value::Unknown
        };
        let store = (self.value(base), value);
        self.stores.push(store);
    }

    fn set(&mut self, reg: Reg, value: Value) -> std::result::Result<(), Unusable> {
        if reg == Reg::Rsp {
            return Err(Unusable::StackPivot);
        }
        self.regs.insert(reg, value);
        Ok(())
    }

    fn step(&mut self, insn: &Instruction) -> std::result::Result<(), Unusable> {
        let ops: Vec<Operand> = insn.operand_list().into_iter().map(parse_operand).collect();
        let mnemonic = insn.base_mnemonic();
        match (mnemonic, ops.as_slice()) {
            ("nop" | "endbr64" | "endbr32" | "cmp" | "test", _) => Ok(()),
            ("leave", _) => Err(Unusable::StackPivot),
            ("pop", [Operand::Reg(reg, width)]) if *width >= self.width => {
                let slot = self.words;
                self.set(*reg, Value::Stack(slot))?;
                self.words += 1;
                Ok(())
            }
            ("mov", [Operand::Reg(dst, width), Operand::Reg(src, _)]) => {
                let value = if *width >= self.width {
                    self.value(*src)
                } else {
                    self.low32(*src)
                };
                self.set(*dst, value)
            }
            ("mov", [Operand::Reg(dst, _), Operand::Imm(imm)]) => self.set(*dst, Value::Const(*imm)),
            ("mov", [Operand::Reg(dst, width), Operand::Mem { base: Some(base), .. }]) => {
                let loaded = if self.value(*base) != Value::Entry(*base) {
                    Value::Unknown
                } else if *width >= self.width {
                    Value::Deref(*base)
                } else {
                    Value::Deref32(*base)
                };
                self.set(*dst, loaded)
            }
            ("mov", [Operand::Mem { base: Some(base), size }, Operand::Reg(src, _)]) => {
                let value = self.value(*src);
                self.store(*base, *size, value);
                Ok(())
            }
            ("mov", [Operand::Mem { base: Some(base), size }, Operand::Imm(imm)]) => {
                self.store(*base, *size, Value::Const(*imm));
                Ok(())
            }
            ("xor", [Operand::Reg(dst, _), Operand::Reg(src, _)]) if dst == src => {
                self.set(*dst, Value::Const(0))
            }
            (m, [Operand::Reg(dst, _) | Operand::Partial(dst), rest @ ..]) if CLOBBERING.contains(&m) => {
                self.set(*dst, Value::Unknown)?;
                if m == "xchg" {
                    if let Some(Operand::Reg(other, _) | Operand::Partial(other)) = rest.first() {
                        self.set(*other, Value::Unknown)?;
                    }
                }
                Ok(())
            }
            _ => Err(Unusable::Unsupported),
        }
    }
}

/// Summarize a straight-line instruction sequence decoded for `arch`.
pub fn analyze(instructions: &[Instruction], arch: Arch) -> std::result::Result<Effect, Unusable> {
    let mut machine = Machine::new(arch);
    for insn in instructions {
        machine.step(insn)?;
    }
    Ok(Effect {
        writes: machine.regs,
        stores: machine.stores,
        stack_words: machine.words,
    })
}

/// Effect of a gadget ending in a plain `ret`; `None` for anything else.
pub fn classify_gadget(gadget: &Gadget) -> Option<std::result::Result<Effect, Unusable>> {
    let (last, body) = gadget.instructions.split_last()?;
    if last.base_mnemonic() != "ret" || !last.operands.is_empty() {
        return None;
    }
    Some(analyze(body, gadget.arch))
}

/// Why a gadget sits at a given spot in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    SetRegister { reg: Reg, value: u64 },
    MoveRegister { dst: Reg, src: Reg },
    WriteMemory { address: u64 },
    LoadMemory { reg: Reg },
    Trap,
}

/// One gadget in a synthesized chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStep {
    /// Rebased address written into the payload.
    pub address: u64,
    pub gadget: Gadget,
    pub role: Role,
}

/// A literal stack word consumed by the preceding gadget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainData {
    pub value: u64,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainItem {
    Gadget(ChainStep),
    Data(ChainData),
}

/// An ordered payload: gadget addresses interleaved with data words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub arch: Arch,
    pub items: Vec<ChainItem>,
}

impl Chain {
    fn mask(&self, value: u64) -> u64 {
        match self.arch.address_width() {
            8 => value,
            width => value & ((1u64 << (width * 8)) - 1),
        }
    }

    pub fn steps(&self) -> impl Iterator<Item = &ChainStep> {
        self.items.iter().filter_map(|item| match item {
            ChainItem::Gadget(step) => Some(step),
            ChainItem::Data(_) => None,
        })
    }

    /// Every stack word in order, truncated to the pointer width.
    pub fn words(&self) -> Vec<u64> {
        self.items
            .iter()
            .map(|item| match item {
                ChainItem::Gadget(step) => self.mask(step.address),
                ChainItem::Data(data) => self.mask(data.value),
            })
            .collect()
    }

    /// Raw little-endian stack bytes.
    pub fn payload(&self) -> Vec<u8> {
        let width = self.arch.address_width();
        self.words()
            .into_iter()
            .flat_map(|w| w.to_le_bytes().into_iter().take(width))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.items.len() * self.arch.address_width()
    }

    /// Annotated address/data listing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                ChainItem::Gadget(step) => {
                    out.push_str(&format!(
                        "{} : {}    # {}\n",
                        self.arch.format_addr(self.mask(step.address)),
                        step.gadget.text(),
                        step.role
                    ));
                }
                ChainItem::Data(data) => {
                    out.push_str(&format!(
                        "{}      {}\n",
                        self.arch.format_addr(self.mask(data.value)),
                        data.note
                    ));
                }
            }
        }
        out
    }

    /// Python script that rebuilds the payload with `struct.pack`.
    pub fn to_python(&self) -> String {
        let fmt = match self.arch.address_width() {
            8 => "<Q",
            4 => "<I",
            _ => "<H",
        };
        let mut out = String::from("#!/usr/bin/env python3\nfrom struct import pack\n\np = b''\n");
        for item in &self.items {
            let (value, note) = match item {
                ChainItem::Gadget(step) => (step.address, step.gadget.text().to_string()),
                ChainItem::Data(data) => (data.value, data.note.clone()),
            };
            out.push_str(&format!(
                "p += pack('{}', {}) # {}\n",
                fmt,
                self.arch.format_addr(self.mask(value)),
                note
            ));
        }
        out
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::SetRegister { reg, value } => write!(f, "{} = {:#x}", reg, value),
            Role::MoveRegister { dst, src } => write!(f, "{} <- {}", dst, src),
            Role::WriteMemory { address } => write!(f, "write [{:#x}]", address),
            Role::LoadMemory { reg } => write!(f, "load {}", reg),
            Role::Trap => write!(f, "trap"),
        }
    }
}

/// Everything a chain must establish before trapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    /// `(address, word)` stores, performed first.
    pub memory: Vec<(u64, u64)>,
    /// Register values, satisfied in order.
    pub registers: Vec<(Reg, u64)>,
    /// End with the architecture's system-call trap.
    pub trap: bool,
}

/// A named exploitation objective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainGoal {
    /// Invoke system call `number` with register arguments.
    Syscall { number: u64, args: Vec<u64> },
    /// `execve(path, NULL, NULL)` with `path` staged at `scratch`.
    Execve { path: Vec<u8>, scratch: u64 },
    Custom(Requirements),
}

impl ChainGoal {
    /// Lower the goal to concrete requirements for `arch`.
    pub fn requirements(&self, arch: Arch) -> Result<Requirements> {
        let abi = || {
            SyscallAbi::for_arch(arch)
                .ok_or_else(|| Error::synthesis(format!("no syscall convention for {}", arch)))
        };

        match self {
            ChainGoal::Custom(req) => Ok(req.clone()),
            ChainGoal::Syscall { number, args } => {
                let abi = abi()?;
                if args.len() > abi.args.len() {
                    return Err(Error::synthesis(format!(
                        "{} syscalls take at most {} arguments",
                        arch,
                        abi.args.len()
                    )));
                }
                // Number last: argument loaders often clobber the accumulator.
                let mut registers: Vec<(Reg, u64)> =
                    abi.args.iter().copied().zip(args.iter().copied()).collect();
                registers.push((abi.number, *number));
                Ok(Requirements {
                    memory: Vec::new(),
                    registers,
                    trap: true,
                })
            }
            ChainGoal::Execve { path, scratch } => {
                let abi = abi()?;
                let width = arch.address_width();
                let mut bytes = path.clone();
                // At least one NUL, then pad to whole words.
                bytes.push(0);
                while bytes.len() % width != 0 {
                    bytes.push(0);
                }
                let memory = bytes
                    .chunks(width)
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut word = [0u8; 8];
                        word[..chunk.len()].copy_from_slice(chunk);
                        (scratch + (i * width) as u64, u64::from_le_bytes(word))
                    })
                    .collect();
                let registers = vec![
                    (abi.args[0], *scratch),
                    (abi.args[1], 0),
                    (abi.args[2], 0),
                    (abi.number, abi.execve),
                ];
                Ok(Requirements {
                    memory,
                    registers,
                    trap: true,
                })
            }
        }
    }
}

/// A gadget with a modelled effect.
#[derive(Debug, Clone)]
pub struct ClassifiedGadget {
    pub gadget: Gadget,
    pub effect: Effect,
}

/// Partial chain plus the registers it overwrites.
#[derive(Debug, Clone, Default)]
struct Plan {
    items: Vec<ChainItem>,
    clobbers: BTreeSet<Reg>,
}

impl Plan {
    fn then(mut self, other: Plan) -> Plan {
        self.items.extend(other.items);
        self.clobbers.extend(other.clobbers);
        self
    }

    fn clobbers_outside(&self, target: Reg, protected: &BTreeSet<Reg>) -> bool {
        self.clobbers
            .iter()
            .any(|reg| *reg != target && protected.contains(reg))
    }
}

/// A gadget that copies or loads into a register from `reg`.
#[derive(Debug, Clone, Copy)]
struct Source {
    gadget: usize,
    reg: Reg,
    /// Only the low 32 bits arrive, zero-extended.
    narrow: bool,
}

impl Source {
    fn carries(&self, value: u64) -> bool {
        !self.narrow || value <= u64::from(u32::MAX)
    }
}

/// Slot number to `(value, note)` for a gadget's popped words.
type Slots = BTreeMap<usize, (u64, String)>;

/// Counts of what the gadget set can do, for reporting.
#[derive(Debug, Clone, Default)]
pub struct GadgetSummary {
    pub loadable: Vec<Reg>,
    pub moves: Vec<(Reg, Reg)>,
    pub memory_loads: Vec<Reg>,
    pub write_primitives: usize,
    pub traps: usize,
    pub stack_pivots: usize,
}

/// Greedy chain builder over a final gadget list.
pub struct ChainSynthesizer {
    arch: Arch,
    offset: u64,
    scratch: Option<u64>,
    classified: Vec<ClassifiedGadget>,
    /// Gadgets putting a constant or stack word in a register.
    load_index: HashMap<Reg, Vec<usize>>,
    /// `dst <- src` register copies, keyed by destination.
    move_index: HashMap<Reg, Vec<Source>>,
    /// `reg <- [base]` memory loads, keyed by destination.
    mem_load_index: HashMap<Reg, Vec<Source>>,
    /// Gadgets with exactly one full-word memory store.
    write_indices: Vec<usize>,
    /// Gadgets containing the trap, with the effect of what precedes it.
    traps: Vec<(Gadget, Effect)>,
    stack_pivots: usize,
}

impl ChainSynthesizer {
    /// Classify `gadgets` for `arch`.
    pub fn new(gadgets: &[Gadget], arch: Arch) -> Self {
        let mut classified = Vec::new();
        let mut traps = Vec::new();
        let mut stack_pivots = 0;

        for gadget in gadgets {
            if let Some(pos) = gadget.instructions.iter().position(|i| is_trap(i, arch)) {
                if let Ok(effect) = analyze(&gadget.instructions[..pos], arch) {
                    traps.push((gadget.clone(), effect));
                }
            }
            match classify_gadget(gadget) {
                Some(Ok(effect)) => classified.push(ClassifiedGadget {
                    gadget: gadget.clone(),
                    effect,
                }),
                Some(Err(Unusable::StackPivot)) => stack_pivots += 1,
                _ => {}
            }
        }

        // Shortest first, so the first acceptable candidate is the best one.
        let cost = |g: &Gadget, e: &Effect| (g.len(), e.stack_words, g.virtual_address);
        classified.sort_by_key(|c| cost(&c.gadget, &c.effect));
        traps.sort_by_key(|(g, e)| cost(g, e));

        let mut load_index: HashMap<Reg, Vec<usize>> = HashMap::new();
        let mut move_index: HashMap<Reg, Vec<Source>> = HashMap::new();
        let mut mem_load_index: HashMap<Reg, Vec<Source>> = HashMap::new();
        let mut write_indices = Vec::new();

        for (i, cg) in classified.iter().enumerate() {
            let effect = &cg.effect;
            if let [(_, value)] = effect.stores.as_slice() {
                if *value != Value::Unknown {
                    write_indices.push(i);
                }
                continue;
            }
            if !effect.is_pure() {
                continue;
            }
            for (reg, value) in &effect.writes {
                let source = |src: Reg, narrow: bool| Source {
                    gadget: i,
                    reg: src,
                    narrow,
                };
                match value {
                    Value::Const(_) | Value::Stack(_) => {
                        load_index.entry(*reg).or_default().push(i);
                    }
                    Value::Entry(src) if src != reg => {
                        move_index.entry(*reg).or_default().push(source(*src, false));
                    }
                    Value::Low32(src) if src != reg => {
                        move_index.entry(*reg).or_default().push(source(*src, true));
                    }
                    Value::Deref(base) => {
                        mem_load_index.entry(*reg).or_default().push(source(*base, false));
                    }
                    Value::Deref32(base) => {
                        mem_load_index.entry(*reg).or_default().push(source(*base, true));
                    }
                    _ => {}
                }
            }
        }

        debug!(
            usable = classified.len(),
            traps = traps.len(),
            pivots = stack_pivots,
            "classified gadgets for chain synthesis"
        );

        Self {
            arch,
            offset: 0,
            scratch: None,
            classified,
            load_index,
            move_index,
            mem_load_index,
            write_indices,
            traps,
            stack_pivots,
        }
    }

    /// Rebase every gadget address written into the chain.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Writable address used to stage values through memory.
    pub fn with_scratch(mut self, scratch: u64) -> Self {
        self.scratch = Some(scratch);
        self
    }

    pub fn summary(&self) -> GadgetSummary {
        let mut loadable: Vec<Reg> = self.load_index.keys().copied().collect();
        loadable.sort();
        let mut moves: Vec<(Reg, Reg)> = self
            .move_index
            .iter()
            .flat_map(|(dst, srcs)| srcs.iter().map(move |src| (*dst, src.reg)))
            .collect();
        moves.sort();
        moves.dedup();
        let mut memory_loads: Vec<Reg> = self.mem_load_index.keys().copied().collect();
        memory_loads.sort();
        GadgetSummary {
            loadable,
            moves,
            memory_loads,
            write_primitives: self.write_indices.len(),
            traps: self.traps.len(),
            stack_pivots: self.stack_pivots,
        }
    }

    /// Build a chain for `goal`. Fails without emitting anything if any
    /// requirement has no candidate.
    pub fn synthesize(&self, goal: &ChainGoal) -> Result<Chain> {
        let req = goal.requirements(self.arch)?;
        let mut plan = Plan::default();

        for (address, word) in &req.memory {
            let write = self
                .write_word(*address, *word, &BTreeSet::new())
                .ok_or_else(|| {
                    Error::synthesis(format!(
                        "no write primitive to store {:#x} at {:#x}",
                        word, address
                    ))
                })?;
            plan = plan.then(write);
        }

        let mut satisfied: BTreeMap<Reg, u64> = BTreeMap::new();
        for (reg, value) in &req.registers {
            let protected: BTreeSet<Reg> = satisfied.keys().copied().collect();
            let step = self
                .plan_register(*reg, *value, &protected, true)
                .ok_or_else(|| {
                    Error::synthesis(format!(
                        "no gadget sets {} = {:#x}",
                        reg.name(self.arch),
                        value
                    ))
                })?;
            plan = plan.then(step);
            satisfied.insert(*reg, *value);
        }

        if req.trap {
            let trap = self.plan_trap(&satisfied).ok_or_else(|| {
                let name = match self.arch {
                    Arch::X86_64 => "syscall",
                    _ => "int 0x80",
                };
                Error::synthesis(format!("no {} gadget", name))
            })?;
            plan = plan.then(trap);
        }

        Ok(Chain {
            arch: self.arch,
            items: plan.items,
        })
    }

    /// Convenience for `ChainGoal::Syscall`.
    pub fn build_syscall(&self, number: u64, args: &[u64]) -> Result<Chain> {
        self.synthesize(&ChainGoal::Syscall {
            number,
            args: args.to_vec(),
        })
    }

    /// Gadget address followed by its popped words.
    fn emit(&self, gadget: &Gadget, effect: &Effect, slots: &Slots, role: Role) -> Plan {
        let mut items = vec![ChainItem::Gadget(ChainStep {
            address: gadget.virtual_address.wrapping_add(self.offset),
            gadget: gadget.clone(),
            role,
        })];
        for slot in 0..effect.stack_words {
            let data = match slots.get(&slot) {
                Some((value, note)) => ChainData {
                    value: *value,
                    note: note.clone(),
                },
                None => ChainData {
                    value: PADDING,
                    note: "padding".into(),
                },
            };
            items.push(ChainItem::Data(data));
        }
        Plan {
            items,
            clobbers: effect.clobbers(),
        }
    }

    fn plan_register(
        &self,
        reg: Reg,
        value: u64,
        protected: &BTreeSet<Reg>,
        allow_stage: bool,
    ) -> Option<Plan> {
        self.direct_load(reg, value, protected)
            .or_else(|| self.move_chain(reg, value, protected))
            .or_else(|| {
                if allow_stage {
                    self.staged_load(reg, value, protected)
                } else {
                    None
                }
            })
    }

    /// One gadget that pops `value` into `reg` or loads it as a constant.
    fn direct_load(&self, reg: Reg, value: u64, protected: &BTreeSet<Reg>) -> Option<Plan> {
        self.load_index.get(&reg)?.iter().find_map(|&i| {
            let cg = &self.classified[i];
            let mut slots = Slots::new();
            match cg.effect.writes.get(&reg)? {
                Value::Const(c) if *c == value => {}
                Value::Stack(slot) => {
                    slots.insert(*slot, (value, format!("{} = {:#x}", reg.name(self.arch), value)));
                }
                _ => return None,
            }
            let plan = self.emit(&cg.gadget, &cg.effect, &slots, Role::SetRegister { reg, value });
            (!plan.clobbers_outside(reg, protected)).then_some(plan)
        })
    }

    /// Load `value` into some register, then copy it over to `target`.
    fn move_chain(&self, target: Reg, value: u64, protected: &BTreeSet<Reg>) -> Option<Plan> {
        let mut queue: VecDeque<(Reg, Vec<(usize, Reg, Reg)>)> = VecDeque::new();
        let mut visited = BTreeSet::new();
        queue.push_back((target, Vec::new()));
        visited.insert(target);

        while let Some((current, path)) = queue.pop_front() {
            if current != target {
                if let Some(load) = self.direct_load(current, value, &BTreeSet::new()) {
                    let mut plan = load;
                    for &(idx, dst, src) in &path {
                        let cg = &self.classified[idx];
                        plan = plan.then(self.emit(
                            &cg.gadget,
                            &cg.effect,
                            &Slots::new(),
                            Role::MoveRegister { dst, src },
                        ));
                    }
                    if !plan.clobbers_outside(target, protected) {
                        return Some(plan);
                    }
                }
            }
            if path.len() >= MAX_MOVE_HOPS {
                continue;
            }
            for src in self.move_index.get(&current).into_iter().flatten() {
                if src.carries(value) && visited.insert(src.reg) {
                    let mut next = vec![(src.gadget, current, src.reg)];
                    next.extend_from_slice(&path);
                    queue.push_back((src.reg, next));
                }
            }
        }
        None
    }

    /// Write `value` to scratch memory and load it back into `reg`.
    fn staged_load(&self, reg: Reg, value: u64, protected: &BTreeSet<Reg>) -> Option<Plan> {
        let scratch = self.scratch?;
        self.mem_load_index.get(&reg)?.iter().find_map(|src| {
            if !src.carries(value) {
                return None;
            }
            let write = self.write_word(scratch, value, protected)?;
            let set_base = self.plan_register(src.reg, scratch, protected, false)?;
            let cg = &self.classified[src.gadget];
            let load = self.emit(&cg.gadget, &cg.effect, &Slots::new(), Role::LoadMemory { reg });
            let plan = write.then(set_base).then(load);
            (!plan.clobbers_outside(reg, protected)).then_some(plan)
        })
    }

    /// Store one word with a write primitive, setting up its operands first.
    fn write_word(&self, address: u64, value: u64, protected: &BTreeSet<Reg>) -> Option<Plan> {
        self.write_indices
            .iter()
            .find_map(|&idx| self.try_writer(idx, address, value, protected))
    }

    fn try_writer(&self, idx: usize, address: u64, value: u64, protected: &BTreeSet<Reg>) -> Option<Plan> {
        let cg = &self.classified[idx];
        let (dst, src) = cg.effect.stores.first()?;
        let mut slots = Slots::new();
        let mut setup: Vec<(Reg, u64)> = Vec::new();

        for (operand, wanted, what) in [(dst, address, "address"), (src, value, "value")] {
            match operand {
                Value::Stack(slot) => {
                    if let Some((existing, _)) = slots.get(slot) {
                        if *existing != wanted {
                            return None;
                        }
                    }
                    slots.insert(*slot, (wanted, format!("{} {:#x}", what, wanted)));
                }
                Value::Entry(reg) => {
                    if setup.iter().any(|(r, v)| r == reg && *v != wanted) {
                        return None;
                    }
                    setup.push((*reg, wanted));
                }
                Value::Const(c) if *c == wanted => {}
                _ => return None,
            }
        }

        let mut plan = Plan::default();
        let mut guard = protected.clone();
        for (reg, wanted) in setup {
            if guard.contains(&reg) {
                return None;
            }
            plan = plan.then(self.plan_register(reg, wanted, &guard, false)?);
            guard.insert(reg);
        }
        let store = self.emit(&cg.gadget, &cg.effect, &slots, Role::WriteMemory { address });
        let plan = plan.then(store);
        if plan.clobbers.iter().any(|r| protected.contains(r)) {
            return None;
        }
        Some(plan)
    }

    /// A trap gadget whose preceding instructions keep satisfied registers.
    fn plan_trap(&self, satisfied: &BTreeMap<Reg, u64>) -> Option<Plan> {
        self.traps.iter().find_map(|(gadget, effect)| {
            if !effect.is_pure() {
                return None;
            }
            let mut slots = Slots::new();
            for reg in effect.clobbers() {
                let Some(&wanted) = satisfied.get(&reg) else {
                    continue;
                };
                match effect.writes.get(&reg)? {
                    Value::Stack(slot) => {
                        slots.insert(*slot, (wanted, format!("{} = {:#x}", reg.name(self.arch), wanted)));
                    }
                    Value::Const(c) if *c == wanted => {}
                    _ => return None,
                }
            }
            Some(self.emit(gadget, effect, &slots, Role::Trap))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{InstructionDecoder, X86Decoder};
    use crate::types::GadgetKind;

    fn make_gadget(arch: Arch, addr: u64, bytes: &[u8]) -> Gadget {
        let decoder = X86Decoder::new(arch);
        let mut instructions = Vec::new();
        let mut off = 0;
        while off < bytes.len() {
            let mut insn = decoder.decode_one(&bytes[off..], addr + off as u64).unwrap();
            insn.offset_in_gadget = off;
            off += insn.encoded_length;
            instructions.push(insn);
        }
        let kind = match instructions.last().map(|i| i.flow) {
            Some(crate::disasm::Flow::Syscall) => GadgetKind::Sys,
            Some(crate::disasm::Flow::Return) => GadgetKind::Rop,
            _ => GadgetKind::Jop,
        };
        Gadget::new(addr, arch, instructions, bytes.to_vec(), kind)
    }

    fn x64(addr: u64, bytes: &[u8]) -> Gadget {
        make_gadget(Arch::X86_64, addr, bytes)
    }

    fn x86(addr: u64, bytes: &[u8]) -> Gadget {
        make_gadget(Arch::X86, addr, bytes)
    }

    fn effect_of(g: &Gadget) -> Effect {
        classify_gadget(g).unwrap().unwrap()
    }

    #[test]
    fn classify_pop_rdi_ret() {
        let e = effect_of(&x64(0x1000, &[0x5f, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rdi), Some(&Value::Stack(0)));
        assert_eq!(e.stack_words, 1);
    }

    #[test]
    fn classify_pop_rsi_pop_r15_ret() {
        let e = effect_of(&x64(0x2000, &[0x5e, 0x41, 0x5f, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rsi), Some(&Value::Stack(0)));
        assert_eq!(e.writes.get(&Reg::R15), Some(&Value::Stack(1)));
        assert_eq!(e.stack_words, 2);
    }

    #[test]
    fn classify_xor_eax_eax_ret() {
        let e = effect_of(&x64(0x3000, &[0x31, 0xc0, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rax), Some(&Value::Const(0)));
    }

    #[test]
    fn classify_mov_imm() {
        // mov eax, 5; ret
        let e = effect_of(&x86(0x3000, &[0xb8, 0x05, 0, 0, 0, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rax), Some(&Value::Const(5)));
    }

    #[test]
    fn classify_mov_rdi_rax_ret() {
        let e = effect_of(&x64(0x6000, &[0x48, 0x89, 0xc7, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rdi), Some(&Value::Entry(Reg::Rax)));
    }

    #[test]
    fn classify_memory_ops() {
        // mov qword ptr [rdi], rax; ret
        let e = effect_of(&x64(0x7000, &[0x48, 0x89, 0x07, 0xc3]));
        assert_eq!(e.stores, vec![(Value::Entry(Reg::Rdi), Value::Entry(Reg::Rax))]);
        // mov rax, qword ptr [rdx]; ret
        let e = effect_of(&x64(0x7100, &[0x48, 0x8b, 0x02, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rax), Some(&Value::Deref(Reg::Rdx)));
    }

    #[test]
    fn classify_32bit_operations_on_x64() {
        // mov edi, eax; ret
        let e = effect_of(&x64(0x7200, &[0x89, 0xc7, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rdi), Some(&Value::Low32(Reg::Rax)));
        // mov eax, dword ptr [rdx]; ret
        let e = effect_of(&x64(0x7300, &[0x8b, 0x02, 0xc3]));
        assert_eq!(e.writes.get(&Reg::Rax), Some(&Value::Deref32(Reg::Rdx)));
        // mov dword ptr [rdi], eax; ret
        let e = effect_of(&x64(0x7400, &[0x89, 0x07, 0xc3]));
        assert_eq!(e.stores, vec![(Value::Entry(Reg::Rdi), Value::Unknown)]);
        // On x86 the same store is a full word.
        let e = effect_of(&x86(0x7400, &[0x89, 0x07, 0xc3]));
        assert_eq!(e.stores, vec![(Value::Entry(Reg::Rdi), Value::Entry(Reg::Rax))]);
    }

    #[test]
    fn dword_store_cannot_stage_a_qword_path() {
        let gadgets = vec![
            x64(0x1000, &[0x5f, 0xc3]),       // pop rdi
            x64(0x1100, &[0x58, 0xc3]),       // pop rax
            x64(0x1200, &[0x5e, 0xc3]),       // pop rsi
            x64(0x1300, &[0x5a, 0xc3]),       // pop rdx
            x64(0x1400, &[0x89, 0x07, 0xc3]), // mov dword ptr [rdi], eax
            x64(0x1500, &[0x0f, 0x05]),       // syscall
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        assert_eq!(synth.summary().write_primitives, 0);
        let goal = ChainGoal::Execve {
            path: b"/bin//sh".to_vec(),
            scratch: 0x601000,
        };
        match synth.synthesize(&goal) {
            Err(Error::Synthesis { requirement }) => {
                assert!(requirement.contains("write primitive"))
            }
            other => panic!("expected synthesis failure, got {:?}", other),
        }
    }

    #[test]
    fn dword_copy_only_carries_32bit_values() {
        let gadgets = vec![
            x64(0x1000, &[0x58, 0xc3]),       // pop rax
            x64(0x2000, &[0x89, 0xc7, 0xc3]), // mov edi, eax
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let wide = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rdi, 0x5555_0000_1000)],
            trap: false,
        });
        match synth.synthesize(&wide) {
            Err(Error::Synthesis { requirement }) => assert!(requirement.contains("rdi")),
            other => panic!("expected synthesis failure, got {:?}", other),
        }

        let narrow = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rdi, 0x1000)],
            trap: false,
        });
        let chain = synth.synthesize(&narrow).unwrap();
        assert_eq!(chain.words(), vec![0x1000, 0x1000, 0x2000]);
    }

    #[test]
    fn stack_pivots_are_unusable() {
        // pop rsp; ret
        let g = x64(0x8000, &[0x5c, 0xc3]);
        assert_eq!(classify_gadget(&g), Some(Err(Unusable::StackPivot)));
        // leave; ret
        let g = x64(0x8100, &[0xc9, 0xc3]);
        assert_eq!(classify_gadget(&g), Some(Err(Unusable::StackPivot)));
    }

    #[test]
    fn non_ret_gadgets_are_not_classified() {
        assert!(classify_gadget(&x64(0x9000, &[0x58, 0xff, 0xe0])).is_none());
        // ret 8
        assert!(classify_gadget(&x64(0x9100, &[0x58, 0xc2, 0x08, 0x00])).is_none());
    }

    #[test]
    fn set_register_then_syscall() {
        // mov eax, 5; ret   and   syscall; ret
        let gadgets = vec![
            x64(0x1000, &[0xb8, 0x05, 0, 0, 0, 0xc3]),
            x64(0x2000, &[0x0f, 0x05, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rax, 5)],
            trap: true,
        });
        let chain = synth.synthesize(&goal).unwrap();
        let steps: Vec<&ChainStep> = chain.steps().collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].address, 0x1000);
        assert_eq!(steps[0].role, Role::SetRegister { reg: Reg::Rax, value: 5 });
        assert_eq!(steps[1].address, 0x2000);
        assert_eq!(steps[1].role, Role::Trap);
        assert_eq!(chain.words(), vec![0x1000, 0x2000]);
    }

    #[test]
    fn missing_syscall_is_reported() {
        let gadgets = vec![x64(0x1000, &[0xb8, 0x05, 0, 0, 0, 0xc3])];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rax, 5)],
            trap: true,
        });
        match synth.synthesize(&goal) {
            Err(Error::Synthesis { requirement }) => assert!(requirement.contains("syscall")),
            other => panic!("expected synthesis failure, got {:?}", other),
        }
    }

    #[test]
    fn build_execve_style_syscall() {
        let gadgets = vec![
            x64(0x1000, &[0x5f, 0xc3]),
            x64(0x2000, &[0x58, 0xc3]),
            x64(0x3000, &[0x5e, 0xc3]),
            x64(0x4000, &[0x5a, 0xc3]),
            x64(0x5000, &[0x0f, 0x05, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let chain = synth.build_syscall(59, &[0x402000, 0, 0]).unwrap();
        assert_eq!(
            chain.words(),
            vec![0x1000, 0x402000, 0x3000, 0, 0x4000, 0, 0x2000, 59, 0x5000]
        );
        assert_eq!(chain.payload().len(), 9 * 8);
    }

    #[test]
    fn missing_register_loader_fails_whole_chain() {
        let gadgets = vec![x64(0x1000, &[0x5f, 0xc3]), x64(0x5000, &[0x0f, 0x05, 0xc3])];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        match synth.build_syscall(59, &[0x402000]) {
            Err(Error::Synthesis { requirement }) => assert!(requirement.contains("rax")),
            other => panic!("expected synthesis failure, got {:?}", other),
        }
    }

    #[test]
    fn multi_hop_move() {
        // Only pop rax; mov rdi, rax carries the value over.
        let gadgets = vec![
            x64(0x1000, &[0x58, 0xc3]),
            x64(0x2000, &[0x48, 0x89, 0xc7, 0xc3]),
            x64(0x3000, &[0x0f, 0x05, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rdi, 0x402000), (Reg::Rax, 1)],
            trap: true,
        });
        let chain = synth.synthesize(&goal).unwrap();
        assert_eq!(
            chain.words(),
            vec![0x1000, 0x402000, 0x2000, 0x1000, 1, 0x3000]
        );
    }

    #[test]
    fn clobbering_loader_is_skipped() {
        // pop rdi; pop rax; ret would overwrite rax set earlier.
        let gadgets = vec![
            x64(0x1000, &[0x5f, 0x58, 0xc3]),
            x64(0x2000, &[0x58, 0xc3]),
            x64(0x3000, &[0x0f, 0x05, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rax, 1), (Reg::Rdi, 2)],
            trap: false,
        });
        match synth.synthesize(&goal) {
            Err(Error::Synthesis { requirement }) => assert!(requirement.contains("rdi")),
            other => panic!("expected synthesis failure, got {:?}", other),
        }

        // The other order works, with the pop rax slot padded.
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rdi, 2), (Reg::Rax, 1)],
            trap: false,
        });
        let chain = synth.synthesize(&goal).unwrap();
        assert_eq!(chain.words(), vec![0x1000, 2, PADDING, 0x2000, 1]);
    }

    #[test]
    fn extra_pop_padding() {
        let gadgets = vec![
            x64(0x1000, &[0x58, 0xc3]),
            x64(0x2000, &[0x5e, 0x41, 0x5f, 0xc3]),
            x64(0x3000, &[0x0f, 0x05, 0xc3]),
            x64(0x4000, &[0x5f, 0xc3]),
            x64(0x5000, &[0x5a, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let chain = synth.build_syscall(1, &[1, 0x402000, 0x100]).unwrap();
        assert!(chain.items.iter().any(|item| matches!(
            item,
            ChainItem::Data(ChainData { note, .. }) if note == "padding"
        )));
    }

    #[test]
    fn staged_load_through_memory() {
        // No rax loader; only mov rax, [rdx] plus a write primitive.
        let gadgets = vec![
            x64(0x1000, &[0x5f, 0xc3]),             // pop rdi
            x64(0x1100, &[0x5e, 0xc3]),             // pop rsi
            x64(0x1200, &[0x5a, 0xc3]),             // pop rdx
            x64(0x1300, &[0x48, 0x89, 0x37, 0xc3]), // mov [rdi], rsi
            x64(0x1400, &[0x48, 0x8b, 0x02, 0xc3]), // mov rax, [rdx]
            x64(0x1500, &[0x0f, 0x05, 0xc3]),       // syscall
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64).with_scratch(0x601000);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rax, 60)],
            trap: true,
        });
        let chain = synth.synthesize(&goal).unwrap();
        assert_eq!(
            chain.words(),
            vec![
                0x1000, 0x601000, // rdi = scratch
                0x1100, 60,       // rsi = value
                0x1300,           // mov [rdi], rsi
                0x1200, 0x601000, // rdx = scratch
                0x1400,           // mov rax, [rdx]
                0x1500,
            ]
        );

        // Without scratch memory there is no fallback.
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        assert!(synth.synthesize(&goal).is_err());
    }

    #[test]
    fn execve_goal_stages_path() {
        // x86: pop edx; pop eax; mov [edx], eax; pop ebx; pop ecx; xor eax, eax; int 0x80
        let gadgets = vec![
            x86(0x8048000, &[0x5a, 0xc3]),       // pop edx
            x86(0x8048010, &[0x58, 0xc3]),       // pop eax
            x86(0x8048020, &[0x89, 0x02, 0xc3]), // mov [edx], eax
            x86(0x8048030, &[0x5b, 0xc3]),       // pop ebx
            x86(0x8048040, &[0x59, 0xc3]),       // pop ecx
            x86(0x8048050, &[0xcd, 0x80, 0xc3]), // int 0x80
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86);
        let goal = ChainGoal::Execve {
            path: b"/bin//sh".to_vec(),
            scratch: 0x80ea000,
        };
        let chain = synth.synthesize(&goal).unwrap();
        let words = chain.words();
        // "/bin", "//sh", NUL word written at consecutive addresses.
        assert!(words.contains(&u64::from(u32::from_le_bytes(*b"/bin"))));
        assert!(words.contains(&u64::from(u32::from_le_bytes(*b"//sh"))));
        assert!(words.contains(&0x80ea008));
        assert_eq!(chain.steps().last().unwrap().role, Role::Trap);
        assert!(chain.steps().any(|s| s.role == Role::SetRegister { reg: Reg::Rax, value: 11 }));
        assert_eq!(chain.payload().len(), words.len() * 4);
    }

    #[test]
    fn trap_with_prefix_pop_feeds_requirement() {
        // pop eax; int 0x80 can supply eax itself.
        let gadgets = vec![
            x86(0x1000, &[0x5b, 0xc3]),       // pop ebx
            x86(0x2000, &[0x58, 0xcd, 0x80]), // pop eax; int 0x80
            x86(0x3000, &[0x58, 0xc3]),       // pop eax
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86);
        let chain = synth.build_syscall(1, &[7]).unwrap();
        assert_eq!(chain.words(), vec![0x1000, 7, 0x3000, 1, 0x2000, 1]);
    }

    #[test]
    fn offset_rebases_gadget_addresses() {
        let gadgets = vec![
            x64(0x1000, &[0xb8, 0x05, 0, 0, 0, 0xc3]),
            x64(0x2000, &[0x0f, 0x05, 0xc3]),
        ];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64).with_offset(0x5555_0000_0000);
        let goal = ChainGoal::Custom(Requirements {
            memory: Vec::new(),
            registers: vec![(Reg::Rax, 5)],
            trap: true,
        });
        let chain = synth.synthesize(&goal).unwrap();
        assert_eq!(chain.words(), vec![0x5555_0000_1000, 0x5555_0000_2000]);
    }

    #[test]
    fn renders_listing_and_python() {
        let gadgets = vec![x64(0x1000, &[0x5f, 0xc3]), x64(0x2000, &[0x58, 0xc3]), x64(0x3000, &[0x0f, 0x05, 0xc3])];
        let synth = ChainSynthesizer::new(&gadgets, Arch::X86_64);
        let chain = synth.build_syscall(60, &[0]).unwrap();
        let listing = chain.render();
        assert!(listing.contains("0x0000000000001000 : pop rdi ; ret"));
        let script = chain.to_python();
        assert!(script.contains("p += pack('<Q', 0x0000000000003000) # syscall ; ret"));
    }

    #[test]
    fn summary_counts() {
        let gadgets = vec![
            x64(0x1000, &[0x5f, 0xc3]),
            x64(0x2000, &[0x48, 0x89, 0xc7, 0xc3]),
            x64(0x3000, &[0x48, 0x89, 0x07, 0xc3]),
            x64(0x4000, &[0x5c, 0xc3]),
            x64(0x5000, &[0x0f, 0x05, 0xc3]),
        ];
        let summary = ChainSynthesizer::new(&gadgets, Arch::X86_64).summary();
        assert_eq!(summary.loadable, vec![Reg::Rdi]);
        assert_eq!(summary.moves, vec![(Reg::Rdi, Reg::Rax)]);
        assert_eq!(summary.write_primitives, 1);
        assert_eq!(summary.stack_pivots, 1);
        assert_eq!(summary.traps, 1);
    }

    #[test]
    fn too_many_syscall_args() {
        let synth = ChainSynthesizer::new(&[], Arch::X86_64);
        assert!(synth.build_syscall(0, &[0; 7]).is_err());
    }
}
