//! Single-instruction decoding.
//!
//! The search engine only needs one primitive from a disassembler: decode
//! one instruction at an address and say how it transfers control. That
//! primitive is the [`InstructionDecoder`] trait; [`X86Decoder`] provides it
//! for 16/32/64-bit x86 using iced-x86.

use std::cell::RefCell;
use std::fmt;

use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, FormatMnemonicOptions, Formatter,
    FormatterOutput, FormatterTextKind, IntelFormatter, MemorySizeOptions, Mnemonic, OpKind,
    Register,
};

use crate::types::{Arch, GadgetKind};

/// How an instruction hands off control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Falls through to the next instruction.
    Sequential,
    /// `ret`, `ret imm16`, `retf`.
    Return,
    /// `jmp reg` / `jmp [mem]`.
    IndirectJump,
    /// `call reg` / `call [mem]`.
    IndirectCall,
    /// `syscall`, `sysenter`, `int 0x80`.
    Syscall,
    /// Direct or conditional branch/call with a fixed target.
    Branch,
    /// Other interrupts and privileged returns (`int3`, `iret`, `sysret`).
    Interrupt,
    /// Architecturally undefined instruction (`ud2` and friends).
    Undefined,
}

impl Flow {
    pub fn is_control_transfer(self) -> bool {
        self != Flow::Sequential
    }

    /// Whether an instruction with this flow ends a gadget of `kind`.
    pub fn terminates(self, kind: GadgetKind) -> bool {
        matches!(
            (kind, self),
            (GadgetKind::Rop, Flow::Return)
                | (GadgetKind::Jop, Flow::IndirectJump | Flow::IndirectCall)
                | (GadgetKind::Sys, Flow::Syscall)
        )
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Byte offset from the first byte of the owning gadget.
    pub offset_in_gadget: usize,
    /// Mnemonic including any prefixes (`rep stosd` renders `rep stosd`).
    pub mnemonic: String,
    /// Operand text, empty for operand-less instructions.
    pub operands: String,
    pub encoded_length: usize,
    pub flow: Flow,
}

impl Instruction {
    /// Mnemonic with prefixes stripped (`rep stosd` -> `stosd`).
    pub fn base_mnemonic(&self) -> &str {
        self.mnemonic
            .rsplit(' ')
            .next()
            .unwrap_or(self.mnemonic.as_str())
    }

    /// Operands split on the `, ` separator.
    pub fn operand_list(&self) -> Vec<&str> {
        if self.operands.is_empty() {
            Vec::new()
        } else {
            self.operands.split(", ").collect()
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Why a single decode failed. Always local to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no bytes to decode")]
    Empty,
    #[error("instruction runs past the end of the buffer")]
    Truncated,
    #[error("invalid opcode")]
    Invalid,
}

/// Single-instruction disassembly primitive.
pub trait InstructionDecoder: Sync {
    fn arch(&self) -> Arch;

    /// Longest possible encoding, bounds the backward search window.
    fn max_instruction_length(&self) -> usize;

    /// Decode and render the instruction at the start of `bytes`.
    ///
    /// Never reads past the end of `bytes`; an instruction that would is
    /// reported as [`DecodeError::Truncated`].
    fn decode_one(&self, bytes: &[u8], address: u64) -> Result<Instruction, DecodeError>;

    /// Length and flow only. The scan loop calls this on every byte, so
    /// implementations may skip rendering.
    fn decode_flow(&self, bytes: &[u8], address: u64) -> Result<(usize, Flow), DecodeError> {
        self.decode_one(bytes, address)
            .map(|insn| (insn.encoded_length, insn.flow))
    }
}

/// iced-x86 backed decoder.
#[derive(Debug, Clone, Copy)]
pub struct X86Decoder {
    arch: Arch,
}

impl X86Decoder {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    fn decode_raw(&self, bytes: &[u8], address: u64) -> Result<iced_x86::Instruction, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut decoder = Decoder::with_ip(self.arch.bitness(), bytes, address, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => self.classify_short(bytes, address),
                _ => DecodeError::Invalid,
            });
        }
        Ok(insn)
    }

    /// iced reports `NoMoreBytes` for an invalid opcode at the end of a
    /// short buffer too. Zero-padding to the maximum length tells the two
    /// apart: only a genuinely truncated instruction decodes then.
    fn classify_short(&self, bytes: &[u8], address: u64) -> DecodeError {
        let mut padded = [0u8; X86_MAX_INSTRUCTION_LENGTH];
        let len = bytes.len().min(X86_MAX_INSTRUCTION_LENGTH);
        padded[..len].copy_from_slice(&bytes[..len]);
        let mut decoder = Decoder::with_ip(self.arch.bitness(), &padded, address, DecoderOptions::NONE);
        if decoder.decode().is_invalid() {
            DecodeError::Invalid
        } else {
            DecodeError::Truncated
        }
    }
}

const X86_MAX_INSTRUCTION_LENGTH: usize = 15;

impl InstructionDecoder for X86Decoder {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn max_instruction_length(&self) -> usize {
        X86_MAX_INSTRUCTION_LENGTH
    }

    fn decode_one(&self, bytes: &[u8], address: u64) -> Result<Instruction, DecodeError> {
        let insn = self.decode_raw(bytes, address)?;
        let (mnemonic, operands) = FORMATTER.with(|cell| {
            let mut guard = cell.borrow_mut();
            let (formatter, output) = &mut *guard;
            output.clear();
            formatter.format_mnemonic_options(&insn, output, FormatMnemonicOptions::NONE);
            let mnemonic = output.text().to_string();
            output.clear();
            formatter.format_all_operands(&insn, output);
            (mnemonic, output.text().to_string())
        });
        Ok(Instruction {
            offset_in_gadget: 0,
            mnemonic,
            operands,
            encoded_length: insn.len(),
            flow: flow_of(&insn),
        })
    }

    fn decode_flow(&self, bytes: &[u8], address: u64) -> Result<(usize, Flow), DecodeError> {
        let insn = self.decode_raw(bytes, address)?;
        Ok((insn.len(), flow_of(&insn)))
    }
}

fn flow_of(insn: &iced_x86::Instruction) -> Flow {
    match insn.mnemonic() {
        Mnemonic::Syscall | Mnemonic::Sysenter => return Flow::Syscall,
        Mnemonic::Int if insn.immediate8() == 0x80 => return Flow::Syscall,
        Mnemonic::Iret
        | Mnemonic::Iretd
        | Mnemonic::Iretq
        | Mnemonic::Sysret
        | Mnemonic::Sysretq
        | Mnemonic::Sysexit
        | Mnemonic::Sysexitq => return Flow::Interrupt,
        _ => {}
    }
    match insn.flow_control() {
        FlowControl::Next => Flow::Sequential,
        FlowControl::Return => Flow::Return,
        FlowControl::IndirectBranch if is_controlled_target(insn) => Flow::IndirectJump,
        FlowControl::IndirectCall if is_controlled_target(insn) => Flow::IndirectCall,
        FlowControl::IndirectBranch
        | FlowControl::IndirectCall
        | FlowControl::UnconditionalBranch
        | FlowControl::ConditionalBranch
        | FlowControl::Call
        | FlowControl::XbeginXabortXend => Flow::Branch,
        FlowControl::Interrupt => Flow::Interrupt,
        FlowControl::Exception => Flow::Undefined,
    }
}

/// Register targets and non-RIP-relative memory targets can be steered.
fn is_controlled_target(insn: &iced_x86::Instruction) -> bool {
    match insn.op0_kind() {
        OpKind::Register => true,
        OpKind::Memory => !matches!(insn.memory_base(), Register::RIP | Register::EIP),
        _ => false,
    }
}

fn intel_formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    let options = formatter.options_mut();
    options.set_hex_prefix("0x");
    options.set_hex_suffix("");
    options.set_space_after_operand_separator(true);
    options.set_branch_leading_zeroes(false);
    options.set_uppercase_hex(false);
    options.set_rip_relative_addresses(true);
    options.set_memory_size_options(MemorySizeOptions::Always);
    formatter
}

thread_local! {
    static FORMATTER: RefCell<(IntelFormatter, FormatterOutputBuffer)> =
        RefCell::new((intel_formatter(), FormatterOutputBuffer::new()));
}

/// Internal buffer for iced-x86 formatter output.
struct FormatterOutputBuffer {
    text: String,
}

impl FormatterOutputBuffer {
    fn new() -> Self {
        Self { text: String::new() }
    }

    fn clear(&mut self) {
        self.text.clear();
    }

    fn text(&self) -> &str {
        &self.text
    }
}

impl FormatterOutput for FormatterOutputBuffer {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}
