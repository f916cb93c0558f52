//! Immutable search settings.
//!
//! A [`SearchConfig`] is a snapshot: every change goes through
//! [`SearchConfig::to_builder`] and yields a new value, so a running search
//! always sees one consistent set of options.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::GadgetKind;

/// Default maximum number of instructions per gadget.
pub const DEFAULT_DEPTH: usize = 10;

/// Half-open address window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    /// Parse `start-end` where both sides are hex (`0x` prefix optional).
    ///
    /// `0x0-0x0` is the conventional spelling of "no range" and yields `None`.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("range must be <start>-<end>, got '{}'", s)))?;
        let start = parse_hex(start)?;
        let end = parse_hex(end)?;
        if start > end {
            return Err(Error::Config(format!(
                "range start {:#x} is greater than end {:#x}",
                start, end
            )));
        }
        if start == 0 && end == 0 {
            return Ok(None);
        }
        Ok(Some(Self { start, end }))
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

/// Parse a hex number with or without a `0x` prefix.
pub fn parse_hex(s: &str) -> Result<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::Config(format!("'{}' is not a hexadecimal value", s)))
}

/// Parse a `|`-separated list of hex bytes, e.g. `00|0a|0d`.
pub fn parse_bad_bytes(s: &str) -> Result<BTreeSet<u8>> {
    let mut out = BTreeSet::new();
    for part in s.split('|').map(str::trim).filter(|p| !p.is_empty()) {
        let value = parse_hex(part)?;
        let byte = u8::try_from(value)
            .map_err(|_| Error::Config(format!("bad byte '{}' does not fit in one byte", part)))?;
        out.insert(byte);
    }
    Ok(out)
}

/// Parse a `|`-separated mnemonic list, e.g. `pop|ret`.
pub fn parse_mnemonics(s: &str) -> BTreeSet<String> {
    s.split('|')
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .collect()
}

/// One consistent set of search options.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub depth: usize,
    pub bad_bytes: BTreeSet<u8>,
    pub filter_mnemonics: BTreeSet<String>,
    pub only_mnemonics: Option<BTreeSet<String>>,
    pub regex: Option<Regex>,
    pub address_range: Option<AddressRange>,
    pub allow_multi_branch: bool,
    pub keep_all_duplicates: bool,
    pub thumb_mode: bool,
    pub rop: bool,
    pub jop: bool,
    pub sys: bool,
    /// Added to every reported address.
    pub offset: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            bad_bytes: BTreeSet::new(),
            filter_mnemonics: BTreeSet::new(),
            only_mnemonics: None,
            regex: None,
            address_range: None,
            allow_multi_branch: false,
            keep_all_duplicates: false,
            thumb_mode: false,
            rop: true,
            jop: true,
            sys: true,
            offset: 0,
        }
    }
}

impl SearchConfig {
    pub fn builder() -> SearchConfigBuilder {
        SearchConfigBuilder::from(&SearchConfig::default())
    }

    /// Start a new snapshot from this one.
    pub fn to_builder(&self) -> SearchConfigBuilder {
        SearchConfigBuilder::from(self)
    }

    /// Gadget classes enabled for this search, in scan order.
    pub fn kinds(&self) -> Vec<GadgetKind> {
        GadgetKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                GadgetKind::Rop => self.rop,
                GadgetKind::Jop => self.jop,
                GadgetKind::Sys => self.sys,
            })
            .collect()
    }

    /// Address as it should be reported to the user.
    pub fn rebase(&self, addr: u64) -> u64 {
        addr.wrapping_add(self.offset)
    }
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items.into_iter().map(String::as_str).collect::<Vec<_>>().join("|")
}

impl fmt::Display for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bad: Vec<String> = self.bad_bytes.iter().map(|b| format!("{:02x}", b)).collect();
        writeln!(f, "All:         {}", self.keep_all_duplicates)?;
        writeln!(f, "Badbytes:    {}", bad.join("|"))?;
        writeln!(f, "Depth:       {}", self.depth)?;
        writeln!(f, "Filter:      {}", join(&self.filter_mnemonics))?;
        writeln!(f, "MultiBr:     {}", self.allow_multi_branch)?;
        writeln!(f, "NoJOP:       {}", !self.jop)?;
        writeln!(f, "NoROP:       {}", !self.rop)?;
        writeln!(f, "NoSYS:       {}", !self.sys)?;
        writeln!(f, "Offset:      {:#x}", self.offset)?;
        match &self.only_mnemonics {
            Some(only) => writeln!(f, "Only:        {}", join(only))?,
            None => writeln!(f, "Only:        none")?,
        }
        match &self.address_range {
            Some(r) => writeln!(f, "Range:       {}", r)?,
            None => writeln!(f, "Range:       0x0-0x0")?,
        }
        match &self.regex {
            Some(r) => writeln!(f, "Re:          {}", r.as_str())?,
            None => writeln!(f, "Re:          none")?,
        }
        write!(f, "Thumb:       {}", self.thumb_mode)
    }
}

/// Collects option changes and validates them into a [`SearchConfig`].
#[derive(Debug, Clone)]
pub struct SearchConfigBuilder {
    depth: usize,
    bad_bytes: BTreeSet<u8>,
    filter_mnemonics: BTreeSet<String>,
    only_mnemonics: Option<BTreeSet<String>>,
    regex: Option<String>,
    address_range: Option<AddressRange>,
    allow_multi_branch: bool,
    keep_all_duplicates: bool,
    thumb_mode: bool,
    rop: bool,
    jop: bool,
    sys: bool,
    offset: u64,
}

impl From<&SearchConfig> for SearchConfigBuilder {
    fn from(config: &SearchConfig) -> Self {
        Self {
            depth: config.depth,
            bad_bytes: config.bad_bytes.clone(),
            filter_mnemonics: config.filter_mnemonics.clone(),
            only_mnemonics: config.only_mnemonics.clone(),
            regex: config.regex.as_ref().map(|r| r.as_str().to_string()),
            address_range: config.address_range,
            allow_multi_branch: config.allow_multi_branch,
            keep_all_duplicates: config.keep_all_duplicates,
            thumb_mode: config.thumb_mode,
            rop: config.rop,
            jop: config.jop,
            sys: config.sys,
            offset: config.offset,
        }
    }
}

impl SearchConfigBuilder {
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn bad_bytes(mut self, bytes: BTreeSet<u8>) -> Self {
        self.bad_bytes = bytes;
        self
    }

    pub fn filter_mnemonics(mut self, mnemonics: BTreeSet<String>) -> Self {
        self.filter_mnemonics = mnemonics;
        self
    }

    pub fn only_mnemonics(mut self, mnemonics: Option<BTreeSet<String>>) -> Self {
        self.only_mnemonics = mnemonics;
        self
    }

    pub fn regex(mut self, pattern: Option<String>) -> Self {
        self.regex = pattern;
        self
    }

    pub fn address_range(mut self, range: Option<AddressRange>) -> Self {
        self.address_range = range;
        self
    }

    pub fn allow_multi_branch(mut self, enabled: bool) -> Self {
        self.allow_multi_branch = enabled;
        self
    }

    pub fn keep_all_duplicates(mut self, enabled: bool) -> Self {
        self.keep_all_duplicates = enabled;
        self
    }

    pub fn thumb_mode(mut self, enabled: bool) -> Self {
        self.thumb_mode = enabled;
        self
    }

    pub fn rop(mut self, enabled: bool) -> Self {
        self.rop = enabled;
        self
    }

    pub fn jop(mut self, enabled: bool) -> Self {
        self.jop = enabled;
        self
    }

    pub fn sys(mut self, enabled: bool) -> Self {
        self.sys = enabled;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self) -> Result<SearchConfig> {
        if self.depth == 0 {
            return Err(Error::Config("depth must be greater than 0".into()));
        }
        if let Some(range) = &self.address_range {
            if range.start > range.end {
                return Err(Error::Config(format!(
                    "range start {:#x} is greater than end {:#x}",
                    range.start, range.end
                )));
            }
        }
        let regex = match self.regex {
            Some(pattern) => Some(
                Regex::new(&pattern)
                    .map_err(|e| Error::Config(format!("invalid regex '{}': {}", pattern, e)))?,
            ),
            None => None,
        };

        Ok(SearchConfig {
            depth: self.depth,
            bad_bytes: self.bad_bytes,
            filter_mnemonics: self.filter_mnemonics,
            only_mnemonics: self.only_mnemonics,
            regex,
            address_range: self.address_range,
            allow_multi_branch: self.allow_multi_branch,
            keep_all_duplicates: self.keep_all_duplicates,
            thumb_mode: self.thumb_mode,
            rop: self.rop,
            jop: self.jop,
            sys: self.sys,
            offset: self.offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range() {
        let r = AddressRange::parse("0x1000-0x2000").unwrap().unwrap();
        assert_eq!(r, AddressRange { start: 0x1000, end: 0x2000 });
        assert!(r.contains(0x1000));
        assert!(!r.contains(0x2000));
    }

    #[test]
    fn zero_range_means_unbounded() {
        assert_eq!(AddressRange::parse("0x0-0x0").unwrap(), None);
    }

    #[test]
    fn reversed_range_is_config_error() {
        let err = AddressRange::parse("0x3000-0x2000").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_range() {
        assert!(AddressRange::parse("0x1000").is_err());
        assert!(AddressRange::parse("zz-0x10").is_err());
    }

    #[test]
    fn hex_values() {
        assert_eq!(parse_hex("0x10").unwrap(), 16);
        assert_eq!(parse_hex("ff").unwrap(), 255);
        assert!(parse_hex("0xg").is_err());
    }

    #[test]
    fn bad_byte_list() {
        let set = parse_bad_bytes("00|0a|0D").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![0x00, 0x0a, 0x0d]);
        assert!(parse_bad_bytes("100").is_err());
    }

    #[test]
    fn mnemonic_list() {
        let set = parse_mnemonics("POP| ret |");
        assert!(set.contains("pop"));
        assert!(set.contains("ret"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn builder_rejects_zero_depth() {
        assert!(SearchConfig::builder().depth(0).build().is_err());
    }

    #[test]
    fn builder_rejects_bad_regex() {
        let err = SearchConfig::builder()
            .regex(Some("(".into()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn snapshots_are_independent() {
        let base = SearchConfig::default();
        let next = base.to_builder().depth(3).rop(false).build().unwrap();
        assert_eq!(base.depth, DEFAULT_DEPTH);
        assert!(base.rop);
        assert_eq!(next.depth, 3);
        assert_eq!(next.kinds(), vec![GadgetKind::Jop, GadgetKind::Sys]);
    }

    #[test]
    fn regex_survives_round_trip_through_builder() {
        let base = SearchConfig::builder()
            .regex(Some("^pop".into()))
            .build()
            .unwrap();
        let next = base.to_builder().depth(4).build().unwrap();
        assert_eq!(next.regex.unwrap().as_str(), "^pop");
    }

    #[test]
    fn settings_listing() {
        let text = SearchConfig::default().to_string();
        assert!(text.contains("Depth:       10"));
        assert!(text.contains("Range:       0x0-0x0"));
    }
}
