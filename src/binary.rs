//! Executable loading.
//!
//! Parses ELF, PE and Mach-O images with goblin and exposes their executable
//! and data regions as [`Section`]s borrowing the loaded bytes. Raw mode maps
//! the whole file as one executable section at address 0 for a caller-chosen
//! architecture.

use std::fmt;
use std::path::{Path, PathBuf};

use goblin::Object;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::section::Section;
use crate::types::Arch;

/// Container format of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Elf,
    Pe,
    MachO,
    Raw,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Elf => "ELF",
            Format::Pe => "PE",
            Format::MachO => "Mach-O",
            Format::Raw => "raw",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
struct Region {
    name: String,
    virtual_address: u64,
    file_offset: u64,
    size: u64,
    executable: bool,
}

/// A loaded executable image.
pub struct Binary {
    path: PathBuf,
    data: Vec<u8>,
    format: Format,
    arch: Arch,
    regions: Vec<Region>,
    writable: Option<u64>,
}

impl Binary {
    /// Read and parse `path`. `raw_arch` forces raw mode.
    pub fn open(path: &Path, raw_arch: Option<Arch>) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Loader(format!("read '{}': {}", path.display(), e)))?;
        Self::from_bytes(path, data, raw_arch)
    }

    pub fn from_bytes(path: &Path, data: Vec<u8>, raw_arch: Option<Arch>) -> Result<Self> {
        let parsed = match raw_arch {
            Some(arch) => Parsed::raw(arch, data.len()),
            None => Parsed::detect(&data)?,
        };
        debug!(
            path = %path.display(),
            format = %parsed.format,
            arch = %parsed.arch,
            regions = parsed.regions.len(),
            "loaded binary"
        );
        Ok(Self {
            path: path.to_path_buf(),
            data,
            format: parsed.format,
            arch: parsed.arch,
            regions: parsed.regions,
            writable: parsed.writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn address_width(&self) -> usize {
        self.arch.address_width()
    }

    /// Start of a writable data region, used as chain scratch memory.
    pub fn writable_address(&self) -> Option<u64> {
        self.writable
    }

    /// Executable regions. An image without any is a loader error.
    pub fn exec_sections(&self) -> Result<Vec<Section<'_>>> {
        let sections = self.sections(true);
        if sections.is_empty() {
            return Err(Error::Loader(format!(
                "no executable sections in '{}'",
                self.path.display()
            )));
        }
        Ok(sections)
    }

    /// Allocated, non-executable regions with file contents.
    pub fn data_sections(&self) -> Vec<Section<'_>> {
        self.sections(false)
    }

    fn sections(&self, executable: bool) -> Vec<Section<'_>> {
        self.regions
            .iter()
            .filter(|r| r.executable == executable && r.size > 0)
            .filter_map(|r| {
                let start = usize::try_from(r.file_offset).ok()?;
                let end = start.checked_add(usize::try_from(r.size).ok()?)?;
                let Some(bytes) = self.data.get(start..end) else {
                    warn!(section = %r.name, "section extends past end of file, skipping");
                    return None;
                };
                let section = if executable {
                    Section::code(r.name.clone(), r.virtual_address, r.file_offset, bytes)
                } else {
                    Section::data(r.name.clone(), r.virtual_address, r.file_offset, bytes)
                };
                Some(section)
            })
            .collect()
    }
}

struct Parsed {
    format: Format,
    arch: Arch,
    regions: Vec<Region>,
    writable: Option<u64>,
}

impl Parsed {
    fn raw(arch: Arch, len: usize) -> Self {
        Self {
            format: Format::Raw,
            arch,
            regions: vec![Region {
                name: "raw".into(),
                virtual_address: 0,
                file_offset: 0,
                size: len as u64,
                executable: true,
            }],
            writable: None,
        }
    }

    fn detect(data: &[u8]) -> Result<Self> {
        let object = Object::parse(data).map_err(|e| Error::Loader(format!("parse: {}", e)))?;
        match object {
            Object::Elf(elf) => Self::elf(&elf),
            Object::PE(pe) => Self::pe(&pe),
            Object::Mach(goblin::mach::Mach::Binary(macho)) => Self::macho(&macho),
            Object::Mach(goblin::mach::Mach::Fat(_)) => {
                Err(Error::Loader("fat Mach-O archives are not supported".into()))
            }
            _ => Err(Error::Loader(
                "unsupported binary format (use raw mode with an architecture)".into(),
            )),
        }
    }

    fn elf(elf: &goblin::elf::Elf) -> Result<Self> {
        use goblin::elf::header::{EM_386, EM_X86_64};
        use goblin::elf::program_header::{PF_X, PT_LOAD};
        use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS};

        let arch = match elf.header.e_machine {
            EM_X86_64 => Arch::X86_64,
            EM_386 => Arch::X86,
            other => {
                return Err(Error::Loader(format!("unsupported ELF machine {:#x}", other)));
            }
        };

        // Executable code comes from loadable segments.
        let mut regions: Vec<Region> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
            .map(|ph| Region {
                name: "PT_LOAD".into(),
                virtual_address: ph.p_vaddr,
                file_offset: ph.p_offset,
                size: ph.p_filesz,
                executable: true,
            })
            .collect();

        let mut writable = None;
        for sh in &elf.section_headers {
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("<unknown>");
            let alloc_write = u64::from(SHF_ALLOC | SHF_WRITE);
            if sh.sh_flags & alloc_write == alloc_write && (writable.is_none() || name == ".data") {
                writable = Some(sh.sh_addr);
            }
            if sh.sh_flags & u64::from(SHF_ALLOC) == 0
                || sh.sh_flags & u64::from(SHF_EXECINSTR) != 0
                || sh.sh_type == SHT_NOBITS
            {
                continue;
            }
            regions.push(Region {
                name: name.to_string(),
                virtual_address: sh.sh_addr,
                file_offset: sh.sh_offset,
                size: sh.sh_size,
                executable: false,
            });
        }

        Ok(Self {
            format: Format::Elf,
            arch,
            regions,
            writable,
        })
    }

    fn pe(pe: &goblin::pe::PE) -> Result<Self> {
        use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
        use goblin::pe::section_table::{
            IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE,
        };

        let arch = match pe.header.coff_header.machine {
            COFF_MACHINE_X86_64 => Arch::X86_64,
            COFF_MACHINE_X86 => Arch::X86,
            other => return Err(Error::Loader(format!("unsupported PE machine {:#x}", other))),
        };
        let image_base = pe.image_base as u64;
        let writable = pe
            .sections
            .iter()
            .find(|s| s.characteristics & IMAGE_SCN_MEM_WRITE != 0)
            .map(|s| image_base + u64::from(s.virtual_address));

        let regions = pe
            .sections
            .iter()
            .filter_map(|s| {
                let executable = s.characteristics & IMAGE_SCN_MEM_EXECUTE != 0;
                if !executable && s.characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA == 0 {
                    return None;
                }
                Some(Region {
                    name: s.name().unwrap_or("<unknown>").to_string(),
                    virtual_address: image_base + u64::from(s.virtual_address),
                    file_offset: u64::from(s.pointer_to_raw_data),
                    size: u64::from(s.size_of_raw_data),
                    executable,
                })
            })
            .collect();

        Ok(Self {
            format: Format::Pe,
            arch,
            regions,
            writable,
        })
    }

    fn macho(macho: &goblin::mach::MachO) -> Result<Self> {
        use goblin::mach::constants::{S_ATTR_PURE_INSTRUCTIONS, S_ATTR_SOME_INSTRUCTIONS};
        use goblin::mach::cputype::{CPU_TYPE_I386, CPU_TYPE_X86_64};

        let arch = match macho.header.cputype {
            CPU_TYPE_X86_64 => Arch::X86_64,
            CPU_TYPE_I386 => Arch::X86,
            other => return Err(Error::Loader(format!("unsupported Mach-O cpu {:#x}", other))),
        };

        let mut regions = Vec::new();
        let mut writable = None;
        for segment in macho.segments.iter() {
            let sections = segment
                .sections()
                .map_err(|e| Error::Loader(format!("Mach-O sections: {}", e)))?;
            for (section, _) in sections {
                if section.name().map_or(false, |n| n == "__data") {
                    writable = Some(section.addr);
                }
                if section.offset == 0 {
                    continue;
                }
                let executable =
                    section.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0;
                regions.push(Region {
                    name: section.name().unwrap_or("<unknown>").to_string(),
                    virtual_address: section.addr,
                    file_offset: u64::from(section.offset),
                    size: section.size,
                    executable,
                });
            }
        }

        Ok(Self {
            format: Format::MachO,
            arch,
            regions,
            writable,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn raw_mode_maps_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x5b, 0xc3, 0x90]).unwrap();

        let bin = Binary::open(file.path(), Some(Arch::X86)).unwrap();
        assert_eq!(bin.format(), Format::Raw);
        assert_eq!(bin.arch(), Arch::X86);
        assert_eq!(bin.address_width(), 4);

        let exec = bin.exec_sections().unwrap();
        assert_eq!(exec.len(), 1);
        assert_eq!(exec[0].virtual_address, 0);
        assert_eq!(exec[0].bytes, &[0x5b, 0xc3, 0x90]);
        assert!(bin.data_sections().is_empty());
        assert!(bin.writable_address().is_none());
    }

    #[test]
    fn empty_raw_file_has_no_code() {
        let bin = Binary::from_bytes(Path::new("empty"), Vec::new(), Some(Arch::X86_64)).unwrap();
        assert!(matches!(bin.exec_sections(), Err(Error::Loader(_))));
        assert!(bin.data_sections().is_empty());
    }

    #[test]
    fn unknown_format_needs_raw_mode() {
        let err = Binary::from_bytes(Path::new("junk"), vec![0x5b, 0xc3, 0x00, 0x00], None);
        assert!(matches!(err, Err(Error::Loader(_))));
    }

    #[test]
    fn missing_file_is_loader_error() {
        let err = Binary::open(Path::new("/nonexistent/definitely/not/here"), None);
        assert!(matches!(err, Err(Error::Loader(_))));
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn loads_own_test_binary() {
        let exe = std::env::current_exe().unwrap();
        let bin = Binary::open(&exe, None).unwrap();
        assert_eq!(bin.format(), Format::Elf);
        assert_eq!(bin.arch(), Arch::X86_64);

        let exec = bin.exec_sections().unwrap();
        assert!(exec.iter().all(|s| s.is_executable && !s.bytes.is_empty()));

        let data = bin.data_sections();
        assert!(data.iter().any(|s| s.name == ".rodata"));
        assert!(data.iter().all(|s| s.is_data));
        assert!(bin.writable_address().is_some());
    }
}
