//! ropsmith: ROP/JOP/SYS gadget finder and syscall chain builder for x86
//! binaries, written in Rust.
//!
//! Scans the executable sections of ELF, PE, Mach-O or raw images backward
//! from every control-transfer terminator, keeps the instruction sequences
//! that decode cleanly up to it, and filters, deduplicates and sorts them
//! into a stable listing. A chain synthesizer turns the listing into a
//! stack payload that sets registers and traps into the kernel.
//!
//! # Module overview
//!
//! ## Core
//!
//! - [`error`]: Error types used throughout the crate.
//! - [`types`]: Core types: `VirtAddr`, `Arch`, `GadgetKind`.
//! - [`config`]: Immutable `SearchConfig` snapshot and its builder.
//! - [`section`]: Byte regions and range clipping.
//! - [`binary`]: ELF/PE/Mach-O/raw loading via goblin.
//!
//! ## Gadget search
//!
//! - [`disasm`]: x86 decoding using iced-x86.
//! - [`rop`]: Terminator-anchored backward gadget search.
//! - [`validate`]: Rejection of malformed gadgets and text-keyed dedup.
//! - [`filter`]: Range, bad-byte, mnemonic and regex filters.
//! - [`pipeline`]: End-to-end search: clip, scan, clean, dedup, filter, sort.
//!
//! ## Analysis
//!
//! - [`strings`]: String, opcode and memory-byte searches.
//! - [`classes`]: Gadget classes for one-instruction gadgets.
//! - [`symbols`]: Symbol sources (`nm`, `object`) and per-function counts.
//! - [`rop_chain`]: Gadget effect analysis and syscall chain synthesis.
//!
//! ## Front end
//!
//! - [`output`]: Listing formatter.
//! - [`command`]: Console command parsing.
//! - [`console`]: Interactive session state.

pub mod error;
pub mod types;
pub mod config;
pub mod section;
pub mod binary;
pub mod disasm;
pub mod rop;
pub mod validate;
pub mod filter;
pub mod pipeline;
pub mod strings;
pub mod classes;
pub mod symbols;
pub mod rop_chain;
pub mod output;
pub mod command;
pub mod console;
