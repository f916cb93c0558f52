use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use rustyline::DefaultEditor;
use tracing::Level;

use ropsmith::classes::GadgetClasses;
use ropsmith::command::Command;
use ropsmith::config::{
    parse_bad_bytes, parse_hex, parse_mnemonics, AddressRange, SearchConfig, DEFAULT_DEPTH,
};
use ropsmith::console::{Outcome, Session};
use ropsmith::error::Error;
use ropsmith::symbols::{NmSymbols, ObjectSymbols, SymbolSource};
use ropsmith::types::Arch;

#[derive(Clone, Copy, ValueEnum)]
enum SymbolBackend {
    /// Run `nm -a -n`
    Nm,
    /// Read symbol tables in-process
    Object,
}

#[derive(Parser)]
#[command(name = "ropsmith", about = "ROP/JOP/SYS gadget finder and syscall chain builder")]
struct Cli {
    /// Binary to analyze
    binary: Option<PathBuf>,

    /// Maximum gadget length in instructions, terminator included
    #[arg(long, default_value_t = DEFAULT_DEPTH)]
    depth: usize,

    /// Reject gadgets whose address contains these bytes (e.g. "00|0a")
    #[arg(long = "badbytes")]
    bad_bytes: Option<String>,

    /// Drop gadgets using any of these mnemonics (e.g. "leave|xchg")
    #[arg(long)]
    filter: Option<String>,

    /// Keep only gadgets made entirely of these mnemonics (e.g. "pop|ret")
    #[arg(long)]
    only: Option<String>,

    /// Keep gadgets whose text matches this regular expression
    #[arg(long = "re")]
    regex: Option<String>,

    /// Restrict the search to an address range (e.g. "0x401000-0x402000")
    #[arg(long)]
    range: Option<String>,

    /// Allow control transfers before the terminator
    #[arg(long)]
    multibr: bool,

    /// Keep duplicate gadgets
    #[arg(long)]
    all: bool,

    #[arg(long)]
    norop: bool,

    #[arg(long)]
    nojop: bool,

    #[arg(long)]
    nosys: bool,

    /// Hex offset added to every reported address
    #[arg(long)]
    offset: Option<String>,

    /// Thumb mode (ignored for x86)
    #[arg(long)]
    thumb: bool,

    /// Treat the input as raw code for this architecture (x86, x86-64, x86-16)
    #[arg(long = "rawArch", alias = "arch")]
    raw_arch: Option<String>,

    /// Show gadget bytes
    #[arg(long)]
    dump: bool,

    /// Search for a string in data sections
    #[arg(long)]
    string: Option<String>,

    /// Search for hex-encoded opcodes in executable sections
    #[arg(long)]
    opcode: Option<String>,

    /// Find each character of a string somewhere in memory
    #[arg(long)]
    memstr: Option<String>,

    /// Group one-instruction gadgets by class
    #[arg(long)]
    classes: bool,

    /// Count gadgets per function
    #[arg(long)]
    fns: bool,

    /// Symbol source for --fns
    #[arg(long, value_enum, default_value = "nm")]
    symbols: SymbolBackend,

    /// Build an execve("/bin/sh") chain
    #[arg(long)]
    ropchain: bool,

    /// Write the raw chain bytes to this file
    #[arg(long, requires = "ropchain")]
    payload: Option<PathBuf>,

    /// Start the interactive console
    #[arg(long)]
    console: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn search_config(&self) -> anyhow::Result<SearchConfig> {
        let mut builder = SearchConfig::builder()
            .depth(self.depth)
            .regex(self.regex.clone())
            .allow_multi_branch(self.multibr)
            .keep_all_duplicates(self.all)
            .thumb_mode(self.thumb)
            .rop(!self.norop)
            .jop(!self.nojop)
            .sys(!self.nosys);
        if let Some(bytes) = &self.bad_bytes {
            builder = builder.bad_bytes(parse_bad_bytes(bytes)?);
        }
        if let Some(filter) = &self.filter {
            builder = builder.filter_mnemonics(parse_mnemonics(filter));
        }
        if let Some(only) = &self.only {
            builder = builder.only_mnemonics(Some(parse_mnemonics(only)));
        }
        if let Some(range) = &self.range {
            builder = builder.address_range(AddressRange::parse(range)?);
        }
        if let Some(offset) = &self.offset {
            builder = builder.offset(parse_hex(offset)?);
        }
        Ok(builder.build()?)
    }

    fn raw_arch(&self) -> anyhow::Result<Option<Arch>> {
        self.raw_arch
            .as_deref()
            .map(|name| Arch::from_name(name).with_context(|| format!("unknown architecture '{}'", name)))
            .transpose()
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = cli.search_config()?;
    let mut session = Session::new(config)
        .raw_arch(cli.raw_arch()?)
        .dump(cli.dump)
        .color(!cli.no_color);

    if let Some(path) = &cli.binary {
        session.load_binary(path)?;
    }

    if cli.console {
        return run_console(session);
    }

    let Some(path) = cli.binary.clone() else {
        eprintln!("error: provide a binary to analyze or use --console");
        std::process::exit(1);
    };

    if let Some(needle) = &cli.string {
        print!("{}", session.string_search(needle)?);
        return Ok(());
    }
    if let Some(hex) = &cli.opcode {
        print!("{}", session.opcode_search(hex)?);
        return Ok(());
    }
    if let Some(memstr) = &cli.memstr {
        print!("{}", session.memstr_search(memstr)?);
        return Ok(());
    }

    session.load_gadgets()?;
    if cli.classes {
        let classes = GadgetClasses::bundled()?;
        print!("{}", session.class_listing(&classes)?);
    } else {
        print!("{}", session.listing()?);
    }

    if cli.fns {
        let source: Box<dyn SymbolSource> = match cli.symbols {
            SymbolBackend::Nm => Box::new(NmSymbols::new(&path)),
            SymbolBackend::Object => Box::new(ObjectSymbols::new(&path)),
        };
        match session.function_listing(source.as_ref()) {
            Ok(text) => print!("\n{}", text),
            Err(e @ Error::CollaboratorUnavailable { .. }) => {
                eprintln!("{}: {}", "warning".yellow(), e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if cli.ropchain {
        let (chain, text) = session.ropchain()?;
        print!("\n{}", text);
        if let Some(out) = &cli.payload {
            std::fs::write(out, chain.payload())
                .with_context(|| format!("writing payload to {}", out.display()))?;
            println!("payload written to {}", out.display());
        }
    }

    Ok(())
}

fn run_console(mut session: Session) -> anyhow::Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        let prompt = format!("{} ", "(ropsmith)".bold().green());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(
                rustyline::error::ReadlineError::Interrupted
                | rustyline::error::ReadlineError::Eof,
            ) => {
                break;
            }
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        rl.add_history_entry(line)?;

        match Command::parse(line).and_then(|cmd| session.execute(cmd)) {
            Ok(Outcome::Output(text)) => {
                print!("{}", text);
                if !text.ends_with('\n') {
                    println!();
                }
            }
            Ok(Outcome::Quit) => break,
            Err(e) => eprintln!("{}: {}", "error".red(), e),
        }
    }

    Ok(())
}
