//! Interactive session state.
//!
//! A [`Session`] owns the loaded binary, the current config snapshot and the
//! last gadget list. Every operation either succeeds and replaces state as a
//! whole or fails and leaves it as it was.

use std::path::Path;

use tracing::info;

use crate::binary::Binary;
use crate::classes::GadgetClasses;
use crate::command::{help, search_matches, Command};
use crate::config::SearchConfig;
use crate::disasm::X86Decoder;
use crate::error::{Error, Result};
use crate::output::Printer;
use crate::pipeline::find_gadgets;
use crate::rop::Gadget;
use crate::rop_chain::{Chain, ChainGoal, ChainSynthesizer};
use crate::strings;
use crate::symbols::{FunctionMap, SymbolSource};
use crate::types::Arch;

/// Offset from the path string to the word used for staged loads.
const STAGING_OFFSET: u64 = 0x40;

/// Result of running one console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Output(String),
    Quit,
}

pub struct Session {
    config: SearchConfig,
    raw_arch: Option<Arch>,
    binary: Option<Binary>,
    gadgets: Vec<Gadget>,
    dump: bool,
    color: bool,
}

impl Session {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            raw_arch: None,
            binary: None,
            gadgets: Vec::new(),
            dump: false,
            color: false,
        }
    }

    /// Load every binary in raw mode for `arch`.
    pub fn raw_arch(mut self, arch: Option<Arch>) -> Self {
        self.raw_arch = arch;
        self
    }

    pub fn dump(mut self, enabled: bool) -> Self {
        self.dump = enabled;
        self
    }

    pub fn color(mut self, enabled: bool) -> Self {
        self.color = enabled;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn gadgets(&self) -> &[Gadget] {
        &self.gadgets
    }

    pub fn binary(&self) -> Option<&Binary> {
        self.binary.as_ref()
    }

    fn require_binary(&self) -> Result<&Binary> {
        self.binary
            .as_ref()
            .ok_or_else(|| Error::Config("no binary loaded".into()))
    }

    fn printer(&self) -> Result<Printer> {
        let arch = self.require_binary()?.arch();
        Ok(Printer::new(arch, &self.config).dump(self.dump).color(self.color))
    }

    /// Replace the loaded binary. Gadgets from the previous one are dropped.
    pub fn load_binary(&mut self, path: &Path) -> Result<()> {
        let binary = Binary::open(path, self.raw_arch)?;
        info!(path = %path.display(), format = %binary.format(), arch = %binary.arch(), "binary loaded");
        self.binary = Some(binary);
        self.gadgets.clear();
        Ok(())
    }

    /// Run a fresh search with the current config, replacing the gadget list.
    pub fn load_gadgets(&mut self) -> Result<usize> {
        let gadgets = {
            let binary = self.require_binary()?;
            let sections = binary.exec_sections()?;
            let decoder = X86Decoder::new(binary.arch());
            find_gadgets(&sections, &decoder, &self.config)
        };
        self.gadgets = gadgets;
        Ok(self.gadgets.len())
    }

    pub fn listing(&self) -> Result<String> {
        Ok(self.printer()?.gadgets(&self.gadgets))
    }

    pub fn string_search(&self, needle: &str) -> Result<String> {
        let binary = self.require_binary()?;
        let matches = strings::find_string(&binary.data_sections(), needle, &self.config);
        Ok(self.printer()?.byte_matches("Strings information", &matches))
    }

    pub fn opcode_search(&self, hex: &str) -> Result<String> {
        let binary = self.require_binary()?;
        let matches = strings::find_opcode(&binary.exec_sections()?, hex, &self.config)?;
        Ok(self.printer()?.byte_matches("Opcodes information", &matches))
    }

    pub fn memstr_search(&self, memstr: &str) -> Result<String> {
        let binary = self.require_binary()?;
        let mut sections = binary.exec_sections()?;
        sections.extend(binary.data_sections());
        let found = strings::find_memstr(&sections, memstr, &self.config);
        Ok(self.printer()?.memstr(&found))
    }

    pub fn class_listing(&self, classes: &GadgetClasses) -> Result<String> {
        let groups = classes.group(&self.gadgets);
        Ok(self.printer()?.classes(&groups, self.gadgets.len()))
    }

    pub fn function_listing(&self, source: &dyn SymbolSource) -> Result<String> {
        let map = FunctionMap::from_source(source)?;
        Ok(self.printer()?.function_counts(&map.counts(&self.gadgets)))
    }

    /// Build an `execve("/bin/sh", NULL, NULL)` chain from the loaded gadgets.
    pub fn ropchain(&self) -> Result<(Chain, String)> {
        let binary = self.require_binary()?;
        let scratch = binary
            .writable_address()
            .map(|addr| self.config.rebase(addr))
            .ok_or_else(|| Error::synthesis("a writable section for the path string"))?;

        let synth = ChainSynthesizer::new(&self.gadgets, binary.arch())
            .with_offset(self.config.offset)
            .with_scratch(scratch + STAGING_OFFSET);
        let printer = self.printer()?;
        let mut text = printer.chain_summary(&synth.summary());
        let chain = synth.synthesize(&ChainGoal::Execve {
            path: b"/bin/sh".to_vec(),
            scratch,
        })?;
        text.push('\n');
        text.push_str(&printer.chain(&chain));
        Ok((chain, text))
    }

    /// Run one parsed command.
    pub fn execute(&mut self, cmd: Command) -> Result<Outcome> {
        let text = match &cmd {
            Command::Binary(path) => {
                self.load_binary(path)?;
                "[+] Binary loaded".to_string()
            }
            Command::Load => {
                let count = self.load_gadgets()?;
                format!("[+] Gadgets loaded ! ({} gadgets)", count)
            }
            Command::Display => self.listing()?,
            Command::Count => format!("[+] {} loaded gadgets.", self.gadgets.len()),
            Command::Search { with, without } => {
                let printer = self.printer()?;
                printer.gadget_lines(
                    self.gadgets
                        .iter()
                        .filter(|g| search_matches(g.text(), with, without)),
                )
            }
            Command::Settings => self.config.to_string(),
            Command::RopChain => self.ropchain()?.1,
            Command::Help(topic) => help(topic.as_deref()),
            Command::Quit => return Ok(Outcome::Quit),
            setting => {
                let next = setting.apply(&self.config)?;
                self.config = next;
                format!(
                    "[+] {}. You have to reload gadgets",
                    setting.confirmation().unwrap_or("Settings updated")
                )
            }
        };
        Ok(Outcome::Output(text))
    }
}
