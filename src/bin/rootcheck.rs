use std::path::PathBuf;

use ansi_term::Colour;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use gcdbg::roots::{dump, Checker, Finding, RootingConfig};

/// Checks control-flow-graph dumps of VM C code for unrooted objects,
/// unbalanced root stacks and leaks on throw.
#[derive(Debug, Parser)]
struct Rootcheck {
    /// Rooting config TOML; anything left out keeps the built-in lists.
    #[clap(long)]
    config: Option<PathBuf>,
    #[clap(long, value_enum, default_value_t = Check::Roots)]
    check: Check,
    /// Give up on a procedure once this many paths lead to one block.
    #[clap(long)]
    max_paths: Option<usize>,
    #[clap(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Check {
    Roots,
    Throw,
    All,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Rootcheck::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            RootingConfig::from_toml(&text)
                .with_context(|| format!("loading {}", path.display()))?
        }
        None => RootingConfig::default(),
    };
    if let Some(n) = args.max_paths {
        config.max_paths = n;
    }

    let mut checker = Checker::new(config);
    for path in &args.files {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("{}: {}: {e}", Colour::Red.paint("error"), path.display());
                continue;
            }
        };
        let procedures = match dump::parse(&text) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{}: {}: {e}", Colour::Red.paint("error"), path.display());
                continue;
            }
        };
        log::debug!("{}: {} procedures", path.display(), procedures.len());

        for proc in &procedures {
            if matches!(args.check, Check::Roots | Check::All) {
                report(checker.check_roots(proc));
            }
            if matches!(args.check, Check::Throw | Check::All) {
                report(checker.check_throw(proc));
            }
        }
    }
    Ok(())
}

fn report(findings: Vec<Finding>) {
    for f in findings {
        let label = if f.is_note() {
            Colour::Cyan.paint("note")
        } else {
            Colour::Purple.paint("warning")
        };
        eprintln!("{label}: {f}");
    }
}
