//! The rooting checks proper.
//!
//! Every variable holding a pointer into the managed heap has to be rooted
//! across any call that might run the collector, or the collector may move
//! the object and leave the variable dangling. For each such variable, and
//! every path from the procedure entry to each block mentioning it, we
//! replay the path keeping track of whether the variable is rooted and
//! which allocating calls it was exposed to while it wasn't. A later use
//! of the variable turns each such exposure into a finding.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::roots::cfg::{Operand, Procedure, Statement, StatementKind};
use crate::roots::config::RootingConfig;
use crate::roots::paths::{collect_paths, PathError};
use crate::roots::throw_free;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Finding {
    MissingRoot {
        var: String,
        alloc: String,
        alloc_loc: String,
        use_stmt: String,
        use_loc: String,
    },
    UnnecessaryRoot {
        var: String,
        loc: String,
    },
    Imbalanced {
        procedure: String,
        loc: String,
        stack: Vec<String>,
        path: Vec<usize>,
    },
    MissingFree {
        procedure: String,
        loc: String,
        vars: Vec<String>,
    },
    TooComplex {
        procedure: String,
    },
}

impl Finding {
    /// Notes say something about the checker rather than the code.
    pub fn is_note(&self) -> bool {
        matches!(self, Finding::TooComplex { .. })
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::MissingRoot { var, alloc, alloc_loc, use_stmt, use_loc } => write!(
                f,
                "missing root for '{var}' in {alloc} at {alloc_loc} used in {use_stmt} at {use_loc}"
            ),
            Finding::UnnecessaryRoot { var, loc } => write!(f, "unnecessary root for '{var}' at {loc}"),
            Finding::Imbalanced { procedure, loc, stack, path } => {
                let path: Vec<String> = path.iter().map(|b| b.to_string()).collect();
                write!(
                    f,
                    "imbalanced root stack in {procedure} at {loc} [{}] via bb {}",
                    stack.join(", "),
                    path.join(" -> "),
                )
            }
            Finding::MissingFree { procedure, loc, vars } => write!(
                f,
                "possible missing free before a throw in {procedure} at {loc}, might need freeing: {}",
                vars.join(", "),
            ),
            Finding::TooComplex { procedure } => {
                write!(f, "skipping {procedure}: rooting too complex to analyze")
            }
        }
    }
}

/// Findings already reported, by their rendered text. Lives for a whole
/// run so a problem in a header inlined into many procedures is reported
/// once.
#[derive(Clone, Debug, Default)]
pub struct WarningSet {
    seen: HashSet<String>,
}

impl WarningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `finding`, returning whether it is new.
    pub fn insert(&mut self, finding: &Finding) -> bool {
        self.seen.insert(finding.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Why a procedure was given up on.
#[derive(Debug)]
pub(crate) enum Bail {
    PopEmpty { loc: String },
    PopCount { loc: String },
    Paths(PathError),
}

impl fmt::Display for Bail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bail::PopEmpty { loc } => write!(f, "pop of an empty root stack at {loc}"),
            Bail::PopCount { loc } => write!(f, "unresolvable pop count at {loc}"),
            Bail::Paths(e) => write!(f, "{e}"),
        }
    }
}

/// How far the per-variable analysis of a procedure got.
enum Progress {
    Continue,
    /// Hit a serialization primitive; nothing more to learn.
    Stop,
}

/// A procedure being checked, with the paths to each block computed once.
pub(crate) struct Scan<'a> {
    pub(crate) config: &'a RootingConfig,
    pub(crate) proc: &'a Procedure,
    paths: HashMap<usize, Vec<Vec<usize>>>,
}

impl<'a> Scan<'a> {
    pub(crate) fn new(config: &'a RootingConfig, proc: &'a Procedure) -> Self {
        Self { config, proc, paths: HashMap::new() }
    }

    pub(crate) fn paths_to(&mut self, block: usize) -> Result<Vec<Vec<usize>>, Bail> {
        if let Some(p) = self.paths.get(&block) {
            return Ok(p.clone());
        }
        let p = collect_paths(self.proc, block, self.config.max_paths).map_err(Bail::Paths)?;
        self.paths.insert(block, p.clone());
        Ok(p)
    }

    /// Statements along `path`, in execution order.
    pub(crate) fn statements<'p>(&self, path: &'p [usize]) -> impl Iterator<Item = &'a Statement> + 'p
    where
        'a: 'p,
    {
        let proc = self.proc;
        path.iter()
            .filter_map(move |b| proc.block(*b))
            .flat_map(|b| b.statements.iter())
    }

    fn root_stack_step(
        &self,
        stmt: &'a Statement,
        stack: &mut Vec<&'a Operand>,
        mut popped: impl FnMut(&Operand),
    ) -> Result<(), Bail> {
        let c = self.config;
        let Some(callee) = stmt.callee() else {
            return Ok(());
        };
        if callee == c.root_push {
            if let Some(arg) = stmt.args().get(c.root_push_arg) {
                stack.push(arg);
            }
        } else if callee == c.root_pop {
            let top = stack.pop().ok_or_else(|| Bail::PopEmpty { loc: stmt.location().into() })?;
            popped(top);
        } else if callee == c.root_pop_n {
            let count = stmt
                .args()
                .get(c.root_pop_n_arg)
                .and_then(Operand::as_int)
                .and_then(|n| usize::try_from(n).ok());
            let Some(count) = count.filter(|_| !stack.is_empty()) else {
                return Err(Bail::PopCount { loc: stmt.location().into() });
            };
            for _ in 0..count {
                let top = stack.pop().ok_or_else(|| Bail::PopCount { loc: stmt.location().into() })?;
                popped(top);
            }
        }
        Ok(())
    }

    fn check_var(
        &mut self,
        var: &str,
        initialized: bool,
        out: &mut Vec<Finding>,
    ) -> Result<Progress, Bail> {
        let proc = self.proc;
        let placed_in_gen2 = proc.type_of(var).map(|t| self.config.is_gen2(t)).unwrap_or(false);
        for block in proc.blocks() {
            if !block.statements.iter().any(|s| s.mentions(var)) {
                continue;
            }
            for path in self.paths_to(block.index)? {
                if let Progress::Stop = self.replay(var, initialized, placed_in_gen2, &path, out)? {
                    return Ok(Progress::Stop);
                }
            }
        }
        Ok(Progress::Continue)
    }

    /// Runs the rooting state machine for `var` along one path.
    fn replay(
        &self,
        var: &str,
        initialized: bool,
        placed_in_gen2: bool,
        path: &[usize],
        out: &mut Vec<Finding>,
    ) -> Result<Progress, Bail> {
        let c = self.config;
        let mut initialized = initialized;
        let mut rooted = false;
        let mut allocating_in_gen2 = false;
        let mut exposed: Vec<&Statement> = vec![];
        let mut stack = vec![];
        let is_var = |o: Option<&Operand>| matches!(o, Some(Operand::Var(v)) if v == var);

        for stmt in self.statements(path) {
            if let StatementKind::Assign { lhs: Operand::Var(v), rhs, .. } = &stmt.kind {
                if v == var {
                    if !matches!(rhs.as_slice(), [Operand::Int(0)]) {
                        initialized = true;
                    }
                    exposed.clear();
                }
            }

            if let StatementKind::Call { lhs, .. } = &stmt.kind {
                if let Some(callee) = stmt.callee() {
                    if c.serialization_refs.contains(callee) {
                        return Ok(Progress::Stop);
                    }
                    if callee == c.gen2_default_set {
                        allocating_in_gen2 = true;
                    } else if callee == c.gen2_default_clear {
                        allocating_in_gen2 = false;
                    }
                    if callee == c.root_push
                        && stmt.args().get(c.root_push_arg).is_some_and(|a| a.is_var(var))
                    {
                        rooted = true;
                    }
                    self.root_stack_step(stmt, &mut stack, |popped| {
                        if popped.is_var(var) {
                            rooted = false;
                        }
                    })?;
                    if initialized
                        && !allocating_in_gen2
                        && c.allocators.contains(callee)
                        && !is_var(lhs.as_ref())
                        && !rooted
                    {
                        exposed.push(stmt);
                        continue;
                    }
                }
                if is_var(lhs.as_ref()) {
                    initialized = true;
                    exposed.clear();
                }
            }

            if stmt.mentions(var) && !placed_in_gen2 {
                for alloc in &exposed {
                    out.push(Finding::MissingRoot {
                        var: var.to_string(),
                        alloc: alloc.to_string(),
                        alloc_loc: alloc.location().to_string(),
                        use_stmt: stmt.to_string(),
                        use_loc: stmt.location().to_string(),
                    });
                }
            }
        }
        Ok(Progress::Continue)
    }

    fn unnecessary_roots(&self, out: &mut Vec<Finding>) {
        let c = self.config;
        for block in self.proc.blocks() {
            for stmt in &block.statements {
                if stmt.callee() != Some(c.root_push.as_str()) {
                    continue;
                }
                if let Some(Operand::AddrOf(var)) = stmt.args().get(c.root_push_arg) {
                    if self.proc.type_of(var).is_some_and(|t| c.is_gen2(t)) {
                        out.push(Finding::UnnecessaryRoot {
                            var: var.clone(),
                            loc: stmt.location().to_string(),
                        });
                    }
                }
            }
        }
    }

    fn imbalances(&mut self, out: &mut Vec<Finding>) -> Result<(), Bail> {
        let proc = self.proc;
        for block in proc.blocks().iter().filter(|b| b.has_return()) {
            for path in self.paths_to(block.index)? {
                let mut stack = vec![];
                for stmt in self.statements(&path) {
                    self.root_stack_step(stmt, &mut stack, |_| ())?;
                }
                if stack.is_empty() {
                    continue;
                }
                let loc = path
                    .last()
                    .and_then(|b| proc.block(*b))
                    .and_then(|b| b.statements.last())
                    .map(|s| s.location().to_string())
                    .unwrap_or_else(|| "<unknown>".into());
                out.push(Finding::Imbalanced {
                    procedure: proc.name.clone(),
                    loc,
                    stack: stack.iter().map(|o| o.to_string()).collect(),
                    path,
                });
            }
        }
        Ok(())
    }

    /// All rooting findings for the procedure, before deduplication.
    fn check_roots(&mut self) -> Vec<Finding> {
        let mut out = vec![];
        if let Err(bail) = self.check_roots_inner(&mut out) {
            log::info!("skipping {}: {bail}", self.proc.name);
            out.push(Finding::TooComplex { procedure: self.proc.name.clone() });
        }
        out
    }

    fn check_roots_inner(&mut self, out: &mut Vec<Finding>) -> Result<(), Bail> {
        let (proc, config) = (self.proc, self.config);
        let vars = proc
            .params
            .iter()
            .map(|v| (v, true))
            .chain(proc.locals.iter().map(|v| (v, false)))
            .filter(|(v, _)| !v.artificial && config.is_tracked(&v.ty));
        for (var, initialized) in vars {
            log::debug!("{}: checking '{}'", proc.name, var.name);
            if let Progress::Stop = self.check_var(&var.name, initialized, out)? {
                log::debug!("{}: serialization code, not checking variables", proc.name);
                break;
            }
        }
        self.unnecessary_roots(out);
        self.imbalances(out)
    }
}

/// Runs the checks over procedures, reporting each distinct finding once.
pub struct Checker {
    config: RootingConfig,
    warned: WarningSet,
}

impl Checker {
    pub fn new(config: RootingConfig) -> Self {
        Self { config, warned: WarningSet::new() }
    }

    pub fn config(&self) -> &RootingConfig {
        &self.config
    }

    pub fn warned(&self) -> &WarningSet {
        &self.warned
    }

    /// Missing roots, unnecessary roots and root stack imbalances.
    pub fn check_roots(&mut self, proc: &Procedure) -> Vec<Finding> {
        let found = Scan::new(&self.config, proc).check_roots();
        self.fresh(found)
    }

    /// Memory from malloc-like calls still held when an exception is
    /// thrown.
    pub fn check_throw(&mut self, proc: &Procedure) -> Vec<Finding> {
        let found = throw_free::check(&mut Scan::new(&self.config, proc));
        self.fresh(found)
    }

    fn fresh(&mut self, found: Vec<Finding>) -> Vec<Finding> {
        found.into_iter().filter(|f| self.warned.insert(f)).collect()
    }
}
