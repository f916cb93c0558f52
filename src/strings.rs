//! Byte searches over loaded sections: strings, opcode patterns and
//! per-character memory lookups.
//!
//! Each search clips its sections to the configured address range first.
//! Clipping is pure, so running several searches over the same section
//! list never compounds truncation.

use regex::bytes::Regex;

use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::section::Section;

/// One hit of a byte search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteMatch {
    /// Rebased virtual address of the first matched byte.
    pub address: u64,
    /// Section the match was found in.
    pub section: String,
    /// Display form of what matched.
    pub content: String,
}

/// First location of one byte of a `memstr` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemByte {
    pub byte: u8,
    /// Rebased address, `None` if no section holds the byte.
    pub address: Option<u64>,
}

/// Literal byte pattern for a byte-oriented regex.
fn byte_pattern(needle: &[u8]) -> String {
    let mut pattern = String::from("(?-u)");
    for b in needle {
        pattern.push_str(&format!("\\x{:02x}", b));
    }
    pattern
}

/// Non-overlapping occurrences of `needle` in the clipped `sections`.
fn find_all<F>(sections: &[Section<'_>], needle: &[u8], config: &SearchConfig, render: F) -> Vec<ByteMatch>
where
    F: Fn(&[u8]) -> String,
{
    if needle.is_empty() {
        return Vec::new();
    }
    let Ok(re) = Regex::new(&byte_pattern(needle)) else {
        return Vec::new();
    };

    sections
        .iter()
        .filter_map(|s| s.clip(config.address_range))
        .flat_map(|s| {
            re.find_iter(s.bytes)
                .map(|m| ByteMatch {
                    address: config.rebase(s.virtual_address + m.start() as u64),
                    section: s.name.clone(),
                    content: render(m.as_bytes()),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Occurrences of a literal string, usually over data sections.
pub fn find_string(sections: &[Section<'_>], needle: &str, config: &SearchConfig) -> Vec<ByteMatch> {
    find_all(sections, needle.as_bytes(), config, |bytes| {
        String::from_utf8_lossy(bytes).into_owned()
    })
}

/// Parse a hex opcode pattern such as `c3` or `5fc3`.
pub fn parse_opcode(hex: &str) -> Result<Vec<u8>> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    let hex = hex.replace("\\x", "");
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(Error::Config(format!("invalid opcode pattern '{}'", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::Config(format!("invalid opcode pattern '{}'", hex)))
        })
        .collect()
}

/// Occurrences of a hex opcode pattern, usually over executable sections.
pub fn find_opcode(sections: &[Section<'_>], hex: &str, config: &SearchConfig) -> Result<Vec<ByteMatch>> {
    let pattern = parse_opcode(hex)?;
    let label = pattern.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    Ok(find_all(sections, &pattern, config, |_| label.clone()))
}

/// For each byte of `memstr`, the first address in `sections` holding it.
pub fn find_memstr(sections: &[Section<'_>], memstr: &str, config: &SearchConfig) -> Vec<MemByte> {
    let clipped: Vec<Section<'_>> = sections
        .iter()
        .filter_map(|s| s.clip(config.address_range))
        .collect();

    memstr
        .bytes()
        .map(|byte| {
            let address = clipped.iter().find_map(|s| {
                s.bytes
                    .iter()
                    .position(|&b| b == byte)
                    .map(|pos| config.rebase(s.virtual_address + pos as u64))
            });
            MemByte { byte, address }
        })
        .collect()
}

/// Check if a byte is a printable ASCII character.
pub fn is_printable_ascii(b: u8) -> bool {
    matches!(b, 0x20..=0x7e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressRange;

    const RODATA: &[u8] = b"\x00/bin/sh\x00Hello\x00/bin/sh\x00";
    const TEXT: &[u8] = &[0x90, 0x5f, 0xc3, 0x90, 0x5f, 0xc3];

    fn data() -> Vec<Section<'static>> {
        vec![Section::data(".rodata", 0x2000, 0x2000, RODATA)]
    }

    fn code() -> Vec<Section<'static>> {
        vec![Section::code(".text", 0x1000, 0x1000, TEXT)]
    }

    #[test]
    fn string_search_finds_every_occurrence() {
        let hits = find_string(&data(), "/bin/sh", &SearchConfig::default());
        let addrs: Vec<u64> = hits.iter().map(|m| m.address).collect();
        assert_eq!(addrs, vec![0x2001, 0x200f]);
        assert_eq!(hits[0].content, "/bin/sh");
        assert_eq!(hits[0].section, ".rodata");
    }

    #[test]
    fn string_search_respects_range_and_offset() {
        let config = SearchConfig::builder()
            .address_range(AddressRange::parse("0x2008-0x2020").unwrap())
            .offset(0x10000)
            .build()
            .unwrap();
        let hits = find_string(&data(), "/bin/sh", &config);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address, 0x1200f);
    }

    #[test]
    fn repeated_searches_do_not_compound_clipping() {
        let config = SearchConfig::builder()
            .address_range(AddressRange::parse("0x2001-0x2020").unwrap())
            .build()
            .unwrap();
        let sections = data();
        let first = find_string(&sections, "/bin/sh", &config);
        let second = find_string(&sections, "/bin/sh", &config);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn opcode_search() {
        let hits = find_opcode(&code(), "5fc3", &SearchConfig::default()).unwrap();
        let addrs: Vec<u64> = hits.iter().map(|m| m.address).collect();
        assert_eq!(addrs, vec![0x1001, 0x1004]);
        assert_eq!(hits[0].content, "5fc3");
    }

    #[test]
    fn opcode_pattern_parsing() {
        assert_eq!(parse_opcode("5f c3").unwrap(), vec![0x5f, 0xc3]);
        assert_eq!(parse_opcode("\\x5f\\xc3").unwrap(), vec![0x5f, 0xc3]);
        assert!(matches!(parse_opcode("5"), Err(Error::Config(_))));
        assert!(matches!(parse_opcode("zz"), Err(Error::Config(_))));
        assert!(matches!(parse_opcode(""), Err(Error::Config(_))));
    }

    #[test]
    fn memstr_reports_first_address_per_byte() {
        let mut sections = code();
        sections.extend(data());
        let found = find_memstr(&sections, "/s!", &SearchConfig::default());
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], MemByte { byte: b'/', address: Some(0x2001) });
        assert_eq!(found[1], MemByte { byte: b's', address: Some(0x2006) });
        assert_eq!(found[2], MemByte { byte: b'!', address: None });
    }

    #[test]
    fn printable() {
        assert!(is_printable_ascii(b'A'));
        assert!(is_printable_ascii(b'~'));
        assert!(!is_printable_ascii(0x00));
        assert!(!is_printable_ascii(0x80));
    }
}
