//! Control-flow graphs of C procedures, as far as the rooting checks need
//! to see them.

use std::collections::HashMap;
use std::fmt;

/// Something a statement reads or writes.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Operand {
    Var(String),
    /// `&name`
    AddrOf(String),
    /// Any access through a variable: `p->f`, `p.f`, `*p`, `p[i]`. `text`
    /// is the whole expression as written.
    Field { base: String, text: String },
    Int(i64),
    /// Literals and anything else we don't look inside.
    Text(String),
}

impl Operand {
    /// True if evaluating this operand touches variable `var`.
    pub fn mentions(&self, var: &str) -> bool {
        match self {
            Operand::Var(v) | Operand::AddrOf(v) => v == var,
            Operand::Field { base, .. } => base == var,
            Operand::Int(_) | Operand::Text(_) => false,
        }
    }

    /// True for `var` itself or `&var`, the two ways a root call can name
    /// a variable.
    pub fn is_var(&self, var: &str) -> bool {
        matches!(self, Operand::Var(v) | Operand::AddrOf(v) if v == var)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Operand::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => f.write_str(v),
            Operand::AddrOf(v) => write!(f, "&{v}"),
            Operand::Field { text, .. } | Operand::Text(text) => f.write_str(text),
            Operand::Int(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StatementKind {
    Assign {
        lhs: Operand,
        rhs: Vec<Operand>,
        /// Binary operator between the two right-hand operands, if any.
        op: Option<String>,
    },
    Call {
        lhs: Option<Operand>,
        /// Name of the function called, or `None` for a call through a
        /// pointer held in `target`.
        callee: Option<String>,
        target: Option<Operand>,
        args: Vec<Operand>,
    },
    Return {
        value: Option<Operand>,
    },
    /// Some other statement; only its operands matter.
    Other {
        operands: Vec<Operand>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    /// Source location, `file:line` or similar.
    pub loc: Option<String>,
}

impl Statement {
    pub fn operands(&self) -> Box<dyn Iterator<Item = &Operand> + '_> {
        match &self.kind {
            StatementKind::Assign { lhs, rhs, .. } => Box::new(std::iter::once(lhs).chain(rhs)),
            StatementKind::Call { lhs, target, args, .. } => {
                Box::new(lhs.iter().chain(target.iter()).chain(args))
            }
            StatementKind::Return { value } => Box::new(value.iter()),
            StatementKind::Other { operands } => Box::new(operands.iter()),
        }
    }

    pub fn mentions(&self, var: &str) -> bool {
        self.operands().any(|o| o.mentions(var))
    }

    /// Name of the function called directly by this statement.
    pub fn callee(&self) -> Option<&str> {
        match &self.kind {
            StatementKind::Call { callee: Some(name), .. } => Some(name),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Operand] {
        match &self.kind {
            StatementKind::Call { args, .. } => args,
            _ => &[],
        }
    }

    /// Where a call or assignment puts its result.
    pub fn lhs(&self) -> Option<&Operand> {
        match &self.kind {
            StatementKind::Assign { lhs, .. } => Some(lhs),
            StatementKind::Call { lhs, .. } => lhs.as_ref(),
            _ => None,
        }
    }

    pub fn location(&self) -> &str {
        self.loc.as_deref().unwrap_or("<unknown>")
    }
}

fn comma_list(f: &mut fmt::Formatter<'_>, items: &[Operand]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StatementKind::Assign { lhs, rhs, op } => {
                write!(f, "{lhs} = ")?;
                match (rhs.as_slice(), op) {
                    ([a, b], Some(op)) => write!(f, "{a} {op} {b}"),
                    _ => comma_list(f, rhs),
                }
            }
            StatementKind::Call { lhs, callee, target, args } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                match (callee, target) {
                    (Some(name), _) => f.write_str(name)?,
                    (None, Some(t)) => write!(f, "*{t}")?,
                    (None, None) => f.write_str("<indirect>")?,
                }
                f.write_str(" (")?;
                comma_list(f, args)?;
                f.write_str(")")
            }
            StatementKind::Return { value: Some(v) } => write!(f, "return {v}"),
            StatementKind::Return { value: None } => f.write_str("return"),
            StatementKind::Other { operands } => {
                f.write_str("use ")?;
                comma_list(f, operands)
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Variable {
    pub name: String,
    /// C type as spelled by the compiler, e.g. `struct MVMObject *`.
    pub ty: String,
    /// Compiler-generated temporaries are not checked.
    pub artificial: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BasicBlock {
    pub index: usize,
    pub preds: Vec<usize>,
    pub statements: Vec<Statement>,
}

impl BasicBlock {
    pub fn has_return(&self) -> bool {
        self.statements.iter().any(|s| matches!(s.kind, StatementKind::Return { .. }))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<Variable>,
    pub locals: Vec<Variable>,
    blocks: Vec<BasicBlock>,
    by_index: HashMap<usize, usize>,
}

impl Procedure {
    /// Builds a procedure. Callers are expected to have checked that
    /// predecessor indices refer to blocks in `blocks`.
    pub fn new(
        name: String,
        params: Vec<Variable>,
        locals: Vec<Variable>,
        blocks: Vec<BasicBlock>,
    ) -> Self {
        let by_index = blocks.iter().enumerate().map(|(pos, b)| (b.index, pos)).collect();
        Self { name, params, locals, blocks, by_index }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&BasicBlock> {
        self.by_index.get(&index).map(|pos| &self.blocks[*pos])
    }

    /// Type of the named parameter or local.
    pub fn type_of(&self, var: &str) -> Option<&str> {
        self.params
            .iter()
            .chain(&self.locals)
            .find(|v| v.name == var)
            .map(|v| v.ty.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions() {
        let s = Statement {
            kind: StatementKind::Call {
                lhs: Some(Operand::Var("r".into())),
                callee: Some("f".into()),
                target: None,
                args: vec![
                    Operand::Var("tc".into()),
                    Operand::AddrOf("a".into()),
                    Operand::Field { base: "b".into(), text: "b->body".into() },
                    Operand::Int(3),
                ],
            },
            loc: Some("x.c:3".into()),
        };
        for v in ["r", "tc", "a", "b"] {
            assert!(s.mentions(v), "{v}");
        }
        assert!(!s.mentions("body"));
        assert!(!s.mentions("f"));
        assert_eq!(s.to_string(), "r = f (tc, &a, b->body, 3)");
        assert_eq!(s.location(), "x.c:3");
        assert!(Operand::AddrOf("a".into()).is_var("a"));
        assert!(!Operand::Field { base: "a".into(), text: "a->x".into() }.is_var("a"));
    }

    #[test]
    fn display_of_other_kinds() {
        let a = Statement {
            kind: StatementKind::Assign {
                lhs: Operand::Var("x".into()),
                rhs: vec![Operand::Var("y".into()), Operand::Int(1)],
                op: Some("+".into()),
            },
            loc: None,
        };
        assert_eq!(a.to_string(), "x = y + 1");
        assert_eq!(a.location(), "<unknown>");
        let r = Statement { kind: StatementKind::Return { value: None }, loc: None };
        assert_eq!(r.to_string(), "return");
    }
}
