//! Console commands.
//!
//! [`Command::parse`] turns one input line into a closed set of commands
//! without touching any state. Settings commands produce a new
//! [`SearchConfig`] through [`Command::apply`]; a command that fails to
//! parse or apply leaves the previous snapshot untouched.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::config::{parse_bad_bytes, parse_hex, parse_mnemonics, AddressRange, SearchConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Binary(PathBuf),
    Load,
    Display,
    Count,
    /// Keep gadgets containing every `with` keyword and no `without` one.
    Search { with: Vec<String>, without: Vec<String> },
    Depth(usize),
    BadBytes(BTreeSet<u8>),
    Filter(BTreeSet<String>),
    Only(Option<BTreeSet<String>>),
    Range(Option<AddressRange>),
    Re(Option<String>),
    MultiBranch(bool),
    All(bool),
    NoJop(bool),
    NoRop(bool),
    NoSys(bool),
    Thumb(bool),
    Offset(u64),
    Settings,
    RopChain,
    Help(Option<String>),
    Quit,
}

/// Name and one-line syntax of every command.
pub const COMMANDS: &[(&str, &str)] = &[
    ("binary", "binary <file> -- Load a binary"),
    ("load", "load -- Load all gadgets"),
    ("display", "display -- Display all gadgets loaded"),
    ("count", "count -- Show the number of loaded gadgets"),
    ("search", "search <kw1 kw2 !kw3...> -- Filter with (kw) or without (!kw) keywords"),
    ("depth", "depth <value> -- Set the depth search engine"),
    ("badbytes", "badbytes <b1|b2...> -- Reject gadget addresses containing these bytes"),
    ("filter", "filter <mn1|mn2...|none> -- Suppress specific instructions"),
    ("only", "only <mn1|mn2...|none> -- Only show specific instructions"),
    ("range", "range <start-end> -- Search between two addresses (0x...-0x...)"),
    ("re", "re <pattern|none> -- Regular expression on gadget text"),
    ("multibr", "multibr <enable|disable> -- Enable/Disable multiple branch gadgets"),
    ("all", "all <enable|disable> -- Show all gadgets (disable removing duplicates)"),
    ("nojop", "nojop <enable|disable> -- Disable JOP search engine"),
    ("norop", "norop <enable|disable> -- Disable ROP search engine"),
    ("nosys", "nosys <enable|disable> -- Disable SYS search engine"),
    ("thumb", "thumb <enable|disable> -- Thumb mode (ARM only, ignored on x86)"),
    ("offset", "offset <hex> -- Rebase reported addresses"),
    ("settings", "settings -- Display current settings"),
    ("ropchain", "ropchain -- Build an execve chain from loaded gadgets"),
    ("help", "help [command] -- Show help"),
    ("quit", "quit -- Leave the console"),
];

fn usage(name: &str) -> Error {
    let syntax = COMMANDS
        .iter()
        .find(|(n, _)| *n == name)
        .map_or("unknown command", |(_, s)| *s);
    Error::Config(format!("Syntax: {}", syntax))
}

fn toggle(name: &str, arg: &str) -> Result<bool> {
    match arg {
        "enable" => Ok(true),
        "disable" => Ok(false),
        _ => Err(usage(name)),
    }
}

fn first_word<'a>(name: &str, arg: &'a str) -> Result<&'a str> {
    arg.split_whitespace().next().ok_or_else(|| usage(name))
}

impl Command {
    /// Parse one console line. Empty input is an error.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (line, ""),
        };

        let cmd = match name {
            "" => return Err(Error::Config("empty command".into())),
            // Paths may contain spaces, so keep the whole argument.
            "binary" if arg.is_empty() => return Err(usage(name)),
            "binary" => Command::Binary(PathBuf::from(arg)),
            "load" => Command::Load,
            "display" => Command::Display,
            "count" => Command::Count,
            "search" => {
                if arg.is_empty() {
                    return Err(usage(name));
                }
                let (without, with): (Vec<&str>, Vec<&str>) =
                    arg.split_whitespace().partition(|kw| kw.starts_with('!'));
                Command::Search {
                    with: with.into_iter().map(String::from).collect(),
                    without: without.into_iter().map(|kw| kw[1..].to_string()).collect(),
                }
            }
            "depth" => {
                let depth: usize = first_word(name, arg)?
                    .parse()
                    .map_err(|_| usage(name))?;
                if depth == 0 {
                    return Err(Error::Config("The depth value must be > 0".into()));
                }
                Command::Depth(depth)
            }
            "badbytes" => Command::BadBytes(parse_bad_bytes(first_word(name, arg)?)?),
            "filter" => match first_word(name, arg)? {
                w if w.eq_ignore_ascii_case("none") => Command::Filter(BTreeSet::new()),
                w => Command::Filter(parse_mnemonics(w)),
            },
            "only" => match first_word(name, arg)? {
                w if w.eq_ignore_ascii_case("none") => Command::Only(None),
                w => Command::Only(Some(parse_mnemonics(w))),
            },
            "range" => Command::Range(AddressRange::parse(first_word(name, arg)?)?),
            "re" => {
                if arg.is_empty() {
                    return Err(usage(name));
                }
                if arg.eq_ignore_ascii_case("none") {
                    Command::Re(None)
                } else {
                    Command::Re(Some(arg.to_string()))
                }
            }
            "multibr" => Command::MultiBranch(toggle(name, arg)?),
            "all" => Command::All(toggle(name, arg)?),
            "nojop" => Command::NoJop(toggle(name, arg)?),
            "norop" => Command::NoRop(toggle(name, arg)?),
            "nosys" => Command::NoSys(toggle(name, arg)?),
            "thumb" => Command::Thumb(toggle(name, arg)?),
            "offset" => Command::Offset(parse_hex(first_word(name, arg)?)?),
            "settings" => Command::Settings,
            "ropchain" => Command::RopChain,
            "help" => Command::Help(arg.split_whitespace().next().map(String::from)),
            "quit" | "exit" | "EOF" => Command::Quit,
            other => return Err(Error::Config(format!("unknown command '{}'", other))),
        };
        Ok(cmd)
    }

    /// Whether this command changes search settings.
    pub fn is_setting(&self) -> bool {
        matches!(
            self,
            Command::Depth(_)
                | Command::BadBytes(_)
                | Command::Filter(_)
                | Command::Only(_)
                | Command::Range(_)
                | Command::Re(_)
                | Command::MultiBranch(_)
                | Command::All(_)
                | Command::NoJop(_)
                | Command::NoRop(_)
                | Command::NoSys(_)
                | Command::Thumb(_)
                | Command::Offset(_)
        )
    }

    /// New snapshot with this command's setting applied. Other commands
    /// return an unchanged copy.
    pub fn apply(&self, config: &SearchConfig) -> Result<SearchConfig> {
        let builder = config.to_builder();
        let builder = match self {
            Command::Depth(depth) => builder.depth(*depth),
            Command::BadBytes(bytes) => builder.bad_bytes(bytes.clone()),
            Command::Filter(mnemonics) => builder.filter_mnemonics(mnemonics.clone()),
            Command::Only(mnemonics) => builder.only_mnemonics(mnemonics.clone()),
            Command::Range(range) => builder.address_range(*range),
            Command::Re(pattern) => builder.regex(pattern.clone()),
            Command::MultiBranch(on) => builder.allow_multi_branch(*on),
            Command::All(on) => builder.keep_all_duplicates(*on),
            Command::NoJop(on) => builder.jop(!*on),
            Command::NoRop(on) => builder.rop(!*on),
            Command::NoSys(on) => builder.sys(!*on),
            Command::Thumb(on) => builder.thumb_mode(*on),
            Command::Offset(offset) => builder.offset(*offset),
            _ => return Ok(config.clone()),
        };
        builder.build()
    }

    /// Confirmation printed after a setting changes.
    pub fn confirmation(&self) -> Option<&'static str> {
        let msg = match self {
            Command::Depth(_) => "Depth updated",
            Command::BadBytes(_) => "Bad bytes updated",
            Command::Filter(_) => "Filter set",
            Command::Only(_) => "Only set",
            Command::Range(_) => "Range set",
            Command::Re(_) => "Re set",
            Command::MultiBranch(true) => "Multiple branch gadgets enabled",
            Command::MultiBranch(false) => "Multiple branch gadgets disabled",
            Command::All(true) => "Showing all gadgets enabled",
            Command::All(false) => "Showing all gadgets disabled",
            Command::NoJop(true) => "NoJOP enabled",
            Command::NoJop(false) => "NoJOP disabled",
            Command::NoRop(true) => "NoROP enabled",
            Command::NoRop(false) => "NoROP disabled",
            Command::NoSys(true) => "NoSYS enabled",
            Command::NoSys(false) => "NoSYS disabled",
            Command::Thumb(true) => "Thumb enabled",
            Command::Thumb(false) => "Thumb disabled",
            Command::Offset(_) => "Offset updated",
            _ => return None,
        };
        Some(msg)
    }
}

/// Help text for one command, or the whole table.
pub fn help(topic: Option<&str>) -> String {
    match topic {
        Some(name) => COMMANDS
            .iter()
            .find(|(n, _)| *n == name)
            .map_or_else(|| format!("No help for '{}'", name), |(_, s)| format!("Syntax: {}", s)),
        None => COMMANDS
            .iter()
            .map(|(_, s)| format!("  {}\n", s))
            .collect(),
    }
}

/// Keyword match used by `search`: every `with` and no `without` keyword
/// occurs in `text`.
pub fn search_matches(text: &str, with: &[String], without: &[String]) -> bool {
    with.iter().all(|kw| text.contains(kw.as_str()))
        && !without.iter().any(|kw| text.contains(kw.as_str()))
}
