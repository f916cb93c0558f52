use std::fmt;

/// Virtual address as reported by the loader (before any user rebasing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Instruction-set mode of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_16,
    X86,
    X86_64,
}

impl Arch {
    /// Decoder bitness for this mode.
    pub fn bitness(self) -> u32 {
        match self {
            Arch::X86_16 => 16,
            Arch::X86 => 32,
            Arch::X86_64 => 64,
        }
    }

    /// Width of a code pointer in bytes.
    pub fn address_width(self) -> usize {
        (self.bitness() / 8) as usize
    }

    /// Parse the names accepted by `--arch` / raw mode.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "x86-16" | "x86_16" | "16" => Some(Arch::X86_16),
            "x86" | "i386" | "x86-32" | "32" => Some(Arch::X86),
            "x86-64" | "x86_64" | "x64" | "amd64" | "64" => Some(Arch::X86_64),
            _ => None,
        }
    }

    /// Format an address zero-padded to the listing width of this mode.
    pub fn format_addr(self, addr: u64) -> String {
        match self {
            Arch::X86_64 => format!("0x{:016x}", addr),
            Arch::X86 | Arch::X86_16 => format!("0x{:08x}", addr),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Arch::X86_16 => "x86-16",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86-64",
        };
        write!(f, "{}", s)
    }
}

/// Gadget class, named by how the gadget hands control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GadgetKind {
    /// Ends with a return (`ret`, `ret imm16`, `retf`).
    Rop,
    /// Ends with an indirect `jmp`/`call` through a register or memory.
    Jop,
    /// Ends with a system-call trap.
    Sys,
}

impl GadgetKind {
    pub const ALL: [GadgetKind; 3] = [GadgetKind::Rop, GadgetKind::Jop, GadgetKind::Sys];
}

impl fmt::Display for GadgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GadgetKind::Rop => "ROP",
            GadgetKind::Jop => "JOP",
            GadgetKind::Sys => "SYS",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_widths() {
        assert_eq!(Arch::X86_16.address_width(), 2);
        assert_eq!(Arch::X86.address_width(), 4);
        assert_eq!(Arch::X86_64.address_width(), 8);
    }

    #[test]
    fn arch_names() {
        assert_eq!(Arch::from_name("amd64"), Some(Arch::X86_64));
        assert_eq!(Arch::from_name("X86"), Some(Arch::X86));
        assert_eq!(Arch::from_name("arm"), None);
    }

    #[test]
    fn listing_address_width() {
        assert_eq!(Arch::X86.format_addr(0x1000), "0x00001000");
        assert_eq!(Arch::X86_64.format_addr(0x401000), "0x0000000000401000");
    }

    #[test]
    fn virt_addr_display() {
        assert_eq!(format!("{}", VirtAddr(0xdead)), "0xdead");
    }
}
