use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use ansi_term::{Colour, Style};
use anyhow::{bail, Context, Result};
use clap::Parser;
use object::{Object, ObjectSegment, ObjectSymbol};

use gcdbg::census::classify::{self, ObjectKind, ReprDetail};
use gcdbg::census::{error_chain, CensusOptions, CensusSession, DiffError};
use gcdbg::layout::{HeapLayout, LayoutModel};
use gcdbg::memory::Segments;

/// Raised by Ctrl-C while a walk is running.
static CANCEL: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
struct Gcdbg {
    /// Snapshot archive or ELF file (typically a core dump) to inspect.
    filename: Option<PathBuf>,
    /// Heap layout TOML, overriding any layout carried by the snapshot.
    #[clap(long)]
    layout: Option<PathBuf>,
    /// Seed for gen2 sampling, for reproducible reports.
    #[clap(long)]
    seed: Option<u64>,
    /// Multiplier on the number of gen2 objects sampled per page.
    #[clap(long, default_value_t = 2)]
    sample_factor: u64,
    /// Maximum rows printed per histogram.
    #[clap(long)]
    rows: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Gcdbg::parse();

    let mut memory = Segments::new();
    let mut symbols = BTreeMap::new();
    let mut layout = None;

    if let Some(filename) = &args.filename {
        let input = std::fs::File::open(filename)
            .with_context(|| format!("opening {}", filename.display()))?;
        // First, try loading as a snapshot.
        match gcdbg::load_snapshot(input) {
            Ok(snap) => {
                memory = snap.memory;
                symbols = snap.symbols;
                layout = snap.layout;
            }
            Err(e) => {
                log::debug!("not a snapshot ({e}), trying ELF");
                let buffer = std::fs::read(filename)?;
                let object = object::File::parse(&*buffer)?;
                for seg in object.segments() {
                    let data = seg.data()?;
                    if data.is_empty() {
                        continue;
                    }
                    memory.insert(seg.address(), data.to_vec())?;
                }
                for sym in object.symbols() {
                    if let Ok(name) = sym.name() {
                        if sym.is_definition() && !name.is_empty() {
                            symbols.insert(name.to_string(), sym.address());
                        }
                    }
                }
            }
        }
    }

    if let Some(path) = &args.layout {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        layout = Some(HeapLayout::from_toml(&text)?);
    }
    if args.sample_factor == 0 {
        bail!("--sample-factor must be at least 1");
    }

    let mut options = CensusOptions {
        sample_factor: args.sample_factor,
        seed: args.seed,
        ..CensusOptions::default()
    };
    if let Some(rows) = args.rows {
        options.row_limit = rows;
    }

    install_interrupt_handler();

    println!(
        "Loaded; {} bytes in {} segments, {} symbols.",
        memory.total_bytes(),
        memory.ranges().count(),
        symbols.len(),
    );
    println!("To quit: ^D or exit");

    let mut rl = rustyline::Editor::<(), _>::new()?;
    let prompt = Colour::Green.paint(">> ").to_string();
    let mut ctx = Ctx {
        memory,
        symbols,
        layout: layout.unwrap_or_default(),
        session: CensusSession::new(options),
    };
    'lineloop:
    loop {
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                let (cmd, rest) = line.split_once(char::is_whitespace)
                    .unwrap_or((line, ""));
                if line.is_empty() {
                    continue 'lineloop;
                }

                rl.add_history_entry(line)?;

                match cmd {
                    "exit" => break,
                    "help" => {
                        println!("commands:");
                        let name_len = COMMANDS.iter()
                            .map(|(name, _, _)| name.len())
                            .max()
                            .unwrap_or(12);
                        for (name, _, desc) in COMMANDS {
                            println!("{:name_len$} {}", name, desc);
                        }
                    }
                    _ => {
                        for (name, imp, _) in COMMANDS {
                            if *name == cmd {
                                imp(&mut ctx, rest.trim());
                                continue 'lineloop;
                            }
                        }
                        println!("unknown command: {}", cmd);
                        println!("for help, try: help");
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                println!("{:?}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn install_interrupt_handler() {
    extern "C" fn on_interrupt(_: libc::c_int) {
        CANCEL.store(true, Ordering::Relaxed);
    }
    // The handler only touches an atomic.
    let handler = on_interrupt as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler() {}

struct Ctx {
    memory: Segments,
    symbols: BTreeMap<String, u64>,
    layout: HeapLayout,
    session: CensusSession,
}

impl Ctx {
    /// Resolves a symbol name or a number.
    fn address(&self, word: &str) -> Option<u64> {
        self.symbols.get(word).copied()
            .or_else(|| parse_int::parse::<u64>(word).ok())
    }
}

type Command = fn(&mut Ctx, &str);

static COMMANDS: &[(&str, Command, &str)] = &[
    ("heap", cmd_heap, "census the heap of a thread context (default: symbol tc)"),
    ("diff-heap", cmd_diff_heap, "compare two nursery snapshots"),
    ("history", cmd_history, "list recorded nursery snapshots"),
    ("object", cmd_object, "classify the object at an address"),
    ("segments", cmd_segments, "list loaded memory"),
    ("load", cmd_load, "loads additional segment data"),
    ("save", cmd_save, "write loaded memory, symbols and layout as a snapshot"),
    ("sym", cmd_sym, "list, show or set symbols"),
    ("layout", cmd_layout, "print the heap layout, or load one from a file"),
];

fn cmd_heap(ctx: &mut Ctx, args: &str) {
    let word = if args.is_empty() { "tc" } else { args };
    let Some(tc) = ctx.address(word) else {
        println!("not a symbol or address: {word}");
        return;
    };

    CANCEL.store(false, Ordering::Relaxed);
    let model = LayoutModel::new(&ctx.memory, &ctx.layout);
    let report = match ctx.session.walk_heap(&model, tc, &CANCEL) {
        Ok(Some(report)) => report,
        Ok(None) => {
            println!("{}", Colour::Yellow.paint("aborted the analysis."));
            return;
        }
        Err(e) => {
            println!("can't read the thread context at {tc:#x}: {e}");
            return;
        }
    };

    let mut out = std::io::stdout().lock();
    let row_limit = ctx.session.options().row_limit;
    if let Err(e) = report.render(&mut out, row_limit) {
        log::warn!("writing report: {e}");
    }
    let n = ctx.session.history().len();
    let _ = writeln!(out, "{}", Style::new().dimmed().paint(format!("recorded as nursery snapshot {}", n - 1)));
}

fn cmd_diff_heap(ctx: &mut Ctx, args: &str) {
    let mut indices = vec![];
    for word in args.split_whitespace() {
        match word.parse::<isize>() {
            Ok(i) => indices.push(i),
            Err(e) => {
                println!("bad snapshot index {word}: {e}");
                return;
            }
        }
    }
    if indices.len() > 2 {
        println!("usage: diff-heap [a [b]]");
        return;
    }
    match ctx.session.diff(&indices, &mut std::io::stdout().lock()) {
        Ok(()) => (),
        Err(DiffError::History(e)) => {
            println!("{e}");
            println!("run heap at least twice to have something to compare");
        }
        Err(e) => println!("{}", error_chain(&e)),
    }
}

fn cmd_history(ctx: &mut Ctx, _args: &str) {
    let history = ctx.session.history();
    if history.is_empty() {
        println!("no nursery snapshots yet");
        return;
    }
    for (i, snap) in history.iter().enumerate() {
        println!(
            "{i:4}  generation {:<6} {:8} objects  {:5.1}% full",
            snap.generation,
            snap.stats.total(),
            snap.occupancy() * 100.0,
        );
    }
}

fn cmd_object(ctx: &mut Ctx, args: &str) {
    let Some(addr) = ctx.address(args) else {
        println!("usage: object ADDRESS");
        return;
    };
    let model = LayoutModel::new(&ctx.memory, &ctx.layout);
    let rec = match classify::classify(&model, addr) {
        Ok(rec) => rec,
        Err(e) => {
            println!("{}", error_chain(&e));
            return;
        }
    };
    let bold = Style::new().bold();
    let kind = match rec.kind {
        ObjectKind::TypeObject => "type object",
        ObjectKind::ConcreteObject => "object",
        ObjectKind::MetadataTable => "STable",
    };
    println!("{:#x}: {} {} ({} bytes)", rec.address, kind, bold.paint(rec.display_name()), rec.size);
    println!("repr: {}", rec.repr_name);
    match &rec.detail {
        ReprDetail::None | ReprDetail::Opaque => (),
        ReprDetail::Array { storage, usage } => {
            println!("slots: {storage}, {usage}% used");
        }
        ReprDetail::String { content } => println!("content: {content:?}"),
    }
}

fn cmd_segments(ctx: &mut Ctx, _args: &str) {
    let mut addr_width = 8 + 2;
    for (range, _) in ctx.memory.ranges() {
        if *range.end() > u64::from(u32::MAX) {
            addr_width = 16 + 2;
        }
    }
    println!("{:addr_width$}     {:addr_width$}   {}", "START", "END", "SIZE");
    for (range, _) in ctx.memory.ranges() {
        let base = range.start();
        let end = range.end();
        println!("{base:#0addr_width$x} ..= {end:#0addr_width$x}   {}", end - base + 1);
    }
}

fn cmd_load(ctx: &mut Ctx, args: &str) {
    let words = args.split_whitespace().collect::<Vec<_>>();
    if words.len() != 2 {
        println!("usage: load [filename] [address]");
        return;
    }
    let filename = words[0];
    let Some(address) = ctx.address(words[1]) else {
        println!("bad address: {}", words[1]);
        return;
    };

    let image = match std::fs::read(filename) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("unable to read file: {e}");
            return;
        }
    };
    let len = image.len();
    if let Err(e) = ctx.memory.insert(address, image) {
        println!("can't load there: {e}");
        return;
    }
    println!("loaded {len} bytes at {address:#x}");
}

fn cmd_save(ctx: &mut Ctx, args: &str) {
    if args.is_empty() {
        println!("usage: save [filename]");
        return;
    }
    let file = match std::fs::File::create(args) {
        Ok(f) => f,
        Err(e) => {
            println!("unable to create file: {e}");
            return;
        }
    };
    if let Err(e) = gcdbg::save_snapshot(file, &ctx.memory, &ctx.symbols, Some(&ctx.layout)) {
        println!("{}", error_chain(&e));
    }
}

fn cmd_sym(ctx: &mut Ctx, args: &str) {
    let mut words = args.split_whitespace();
    let Some(name) = words.next() else {
        for (name, value) in &ctx.symbols {
            println!("{value:#018x} {name}");
        }
        return;
    };

    if let Some(value_str) = words.next() {
        let Some(value) = ctx.address(value_str) else {
            println!("could not parse value: {value_str}");
            return;
        };
        ctx.symbols.insert(name.to_string(), value);
    } else if let Some(x) = ctx.symbols.get(name) {
        println!("{name} = {x:#x}");
    } else {
        println!("no symbol {name}");
    }
}

fn cmd_layout(ctx: &mut Ctx, args: &str) {
    if args.is_empty() {
        match ctx.layout.to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => println!("{}", error_chain(&e)),
        }
        return;
    }
    let loaded = std::fs::read_to_string(args)
        .map_err(anyhow::Error::from)
        .and_then(|text| Ok(HeapLayout::from_toml(&text)?));
    match loaded {
        Ok(layout) => ctx.layout = layout,
        Err(e) => println!("{e:#}"),
    }
}
