//! Symbol tables and per-function gadget attribution.
//!
//! Two sources provide address-ordered symbols: the external `nm -a -n`
//! tool and an in-process reader built on `object` over a memory-mapped
//! file. Consecutive symbol addresses form half-open function intervals
//! `[start_i, start_{i+1})`; a gadget belongs to the interval containing
//! its address.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use memmap2::Mmap;
use object::{Object, ObjectSymbol, SymbolKind};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rop::Gadget;
use crate::types::VirtAddr;

/// Classification of symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Function,
    Data,
    Other,
}

impl SymbolType {
    /// From an `nm` type letter.
    fn from_nm(letter: char) -> Self {
        match letter.to_ascii_lowercase() {
            't' | 'w' | 'i' => SymbolType::Function,
            'd' | 'b' | 'r' | 'g' | 's' | 'v' => SymbolType::Data,
            _ => SymbolType::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: VirtAddr,
    pub kind: SymbolType,
}

/// Anything that can list a binary's symbols in address order.
pub trait SymbolSource {
    /// Short name for diagnostics.
    fn name(&self) -> &str;
    fn symbols(&self) -> Result<Vec<Symbol>>;
}

/// Symbols from the `nm` tool.
pub struct NmSymbols {
    program: PathBuf,
    binary: PathBuf,
}

impl NmSymbols {
    pub fn new(binary: &Path) -> Self {
        Self::with_program(Path::new("nm"), binary)
    }

    pub fn with_program(program: &Path, binary: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            binary: binary.to_path_buf(),
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::CollaboratorUnavailable {
            tool: self.program.display().to_string(),
            reason: reason.into(),
        }
    }
}

impl SymbolSource for NmSymbols {
    fn name(&self) -> &str {
        "nm"
    }

    fn symbols(&self) -> Result<Vec<Symbol>> {
        let output = Command::new(&self.program)
            .args(["-a", "-n"])
            .arg(&self.binary)
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => self.unavailable("not installed"),
                _ => self.unavailable(e.to_string()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(parse_nm_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `nm -n` lines (`<hex address> <type> <name>`).
///
/// Undefined symbols and symbols at address zero are skipped.
pub fn parse_nm_output(text: &str) -> Vec<Symbol> {
    let Ok(line_re) = Regex::new(r"^([0-9a-fA-F]+)\s+(\w)\s+(\S+)") else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let caps = line_re.captures(line)?;
            let addr = u64::from_str_radix(&caps[1], 16).ok()?;
            if addr == 0 {
                return None;
            }
            let letter = caps[2].chars().next()?;
            Some(Symbol {
                name: caps[3].to_string(),
                addr: VirtAddr(addr),
                kind: SymbolType::from_nm(letter),
            })
        })
        .collect()
}

/// Symbols read in-process from the binary's symbol tables.
pub struct ObjectSymbols {
    path: PathBuf,
}

impl ObjectSymbols {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SymbolSource for ObjectSymbols {
    fn name(&self) -> &str {
        "object"
    }

    fn symbols(&self) -> Result<Vec<Symbol>> {
        let file = std::fs::File::open(&self.path)?;
        // SAFETY: read-only mapping, dropped before returning.
        let mmap = unsafe { Mmap::map(&file) }?;
        let obj = object::File::parse(&*mmap)
            .map_err(|e| Error::Loader(format!("parse '{}': {}", self.path.display(), e)))?;

        let mut symbols: Vec<Symbol> = obj
            .symbols()
            .chain(obj.dynamic_symbols())
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() || sym.address() == 0 {
                    return None;
                }
                Some(Symbol {
                    name: name.to_string(),
                    addr: VirtAddr(sym.address()),
                    kind: match sym.kind() {
                        SymbolKind::Text => SymbolType::Function,
                        SymbolKind::Data => SymbolType::Data,
                        _ => SymbolType::Other,
                    },
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.addr);
        Ok(symbols)
    }
}

/// Address-ordered function intervals.
#[derive(Debug, Clone, Default)]
pub struct FunctionMap {
    /// One entry per distinct start address; the last symbol listed at an
    /// address wins.
    starts: Vec<Symbol>,
}

impl FunctionMap {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.addr);
        let mut starts: Vec<Symbol> = Vec::with_capacity(symbols.len());
        for sym in symbols {
            match starts.last_mut() {
                Some(last) if last.addr == sym.addr => *last = sym,
                _ => starts.push(sym),
            }
        }
        Self { starts }
    }

    /// Build from `source`, logging and propagating failure.
    pub fn from_source(source: &dyn SymbolSource) -> Result<Self> {
        match source.symbols() {
            Ok(symbols) => {
                debug!(source = source.name(), symbols = symbols.len(), "loaded symbols");
                Ok(Self::new(symbols))
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "function attribution disabled");
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// The symbol whose interval contains `addr`.
    ///
    /// The last symbol has no end and never matches.
    pub fn attribute(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.starts.partition_point(|s| s.addr.addr() <= addr);
        if idx == 0 || idx == self.starts.len() {
            return None;
        }
        Some(&self.starts[idx - 1])
    }

    /// Gadget counts per function, in address order, omitting zeros.
    pub fn counts(&self, gadgets: &[Gadget]) -> Vec<(String, usize)> {
        let mut by_start: HashMap<u64, usize> = HashMap::new();
        for gadget in gadgets {
            if let Some(sym) = self.attribute(gadget.virtual_address) {
                *by_start.entry(sym.addr.addr()).or_default() += 1;
            }
        }
        self.starts
            .iter()
            .filter_map(|s| {
                by_start
                    .get(&s.addr.addr())
                    .map(|count| (s.name.clone(), *count))
            })
            .collect()
    }
}
