//! Reading control-flow graphs from the text dump format.
//!
//! ```text
//! # comment
//! function make_pair
//! param tc: struct MVMThreadContext *
//! local a: struct MVMObject *
//! local artificial D.1234: struct MVMObject *
//! bb 2
//!     a = call MVM_repr_alloc_init(tc, type) @ pair.c:10
//! bb 3 <- 2
//!     call MVM_repr_push_o(tc, list, a) @ pair.c:11
//!     return a @ pair.c:12
//! end
//! ```

use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

use crate::roots::cfg::{BasicBlock, Operand, Procedure, Statement, StatementKind, Variable};

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DumpError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: statement outside of any basic block")]
    OrphanStatement { line: usize },
    #[error("line {line}: `{what}` outside of a function")]
    OutsideFunction { line: usize, what: String },
    #[error("function `{function}`: bb {block} lists unknown predecessor bb {pred}")]
    UnknownBlock { function: String, block: usize, pred: usize },
    #[error("function `{function}` is never closed with `end`")]
    Unterminated { function: String },
}

struct Patterns {
    function: Regex,
    param: Regex,
    local: Regex,
    block: Regex,
    call: Regex,
    assign: Regex,
    ident: Regex,
    temp: Regex,
    field: Regex,
}

impl Patterns {
    fn new() -> Self {
        // All of these are fixed strings.
        Self {
            function: Regex::new(r"^function\s+(\S+)$").unwrap(),
            param: Regex::new(r"^param\s+(\S+)\s*:\s*(.+)$").unwrap(),
            local: Regex::new(r"^local\s+(artificial\s+)?(\S+)\s*:\s*(.+)$").unwrap(),
            block: Regex::new(r"^bb\s+(\d+)(?:\s*<-\s*(.*))?$").unwrap(),
            call: Regex::new(r"^(?:(.+?)\s*=\s*)?call\s+(\*)?([^\s(]+)\s*\((.*)\)$").unwrap(),
            assign: Regex::new(r"^(.+?)\s*=\s*(\S+)(?:\s+(\S+)\s+(\S+))?$").unwrap(),
            ident: Regex::new(r"^[A-Za-z_]\w*$").unwrap(),
            temp: Regex::new(r"^[A-Za-z_]\w*\.\d+$").unwrap(),
            field: Regex::new(r"^\*?([A-Za-z_]\w*)(?:->|\.|\[)").unwrap(),
        }
    }
}

struct Builder {
    name: String,
    params: Vec<Variable>,
    locals: Vec<Variable>,
    blocks: Vec<BasicBlock>,
}

/// Parses every procedure in `text`.
pub fn parse(text: &str) -> Result<Vec<Procedure>, DumpError> {
    let p = Patterns::new();
    let mut procedures = vec![];
    let mut current: Option<Builder> = None;

    for (n, raw) in text.lines().enumerate() {
        let line = n + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let syntax = |message: &str| DumpError::Syntax { line, message: message.to_string() };

        if let Some(c) = p.function.captures(trimmed) {
            if let Some(open) = &current {
                return Err(DumpError::Unterminated { function: open.name.clone() });
            }
            current = Some(Builder {
                name: c[1].to_string(),
                params: vec![],
                locals: vec![],
                blocks: vec![],
            });
            continue;
        }

        let Some(b) = current.as_mut() else {
            let what = trimmed.split_whitespace().next().unwrap_or(trimmed).to_string();
            return Err(DumpError::OutsideFunction { line, what });
        };

        if trimmed == "end" {
            if let Some(b) = current.take() {
                procedures.push(finish(b)?);
            }
        } else if let Some(c) = p.param.captures(trimmed) {
            b.params.push(Variable { name: c[1].into(), ty: c[2].trim().into(), artificial: false });
        } else if let Some(c) = p.local.captures(trimmed) {
            b.locals.push(Variable {
                name: c[2].into(),
                ty: c[3].trim().into(),
                artificial: c.get(1).is_some(),
            });
        } else if let Some(c) = p.block.captures(trimmed) {
            let index = c[1].parse().map_err(|_| syntax("block number out of range"))?;
            let preds = match c.get(2) {
                Some(list) => list
                    .as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse().map_err(|_| syntax("bad predecessor list")))
                    .collect::<Result<_, _>>()?,
                None => vec![],
            };
            b.blocks.push(BasicBlock { index, preds, statements: vec![] });
        } else {
            let stmt = parse_statement(&p, trimmed).map_err(|m| syntax(&m))?;
            let Some(block) = b.blocks.last_mut() else {
                return Err(DumpError::OrphanStatement { line });
            };
            block.statements.push(stmt);
        }
    }

    if let Some(open) = current {
        return Err(DumpError::Unterminated { function: open.name });
    }
    Ok(procedures)
}

fn finish(b: Builder) -> Result<Procedure, DumpError> {
    let known: HashSet<usize> = b.blocks.iter().map(|bb| bb.index).collect();
    for bb in &b.blocks {
        if let Some(pred) = bb.preds.iter().find(|p| !known.contains(p)) {
            return Err(DumpError::UnknownBlock { function: b.name, block: bb.index, pred: *pred });
        }
    }
    Ok(Procedure::new(b.name, b.params, b.locals, b.blocks))
}

fn parse_statement(p: &Patterns, text: &str) -> Result<Statement, String> {
    let (body, loc) = match text.rsplit_once(" @ ") {
        Some((body, loc)) => (body.trim(), Some(loc.trim().to_string())),
        None => (text, None),
    };

    let kind = if body == "return" {
        StatementKind::Return { value: None }
    } else if let Some(value) = body.strip_prefix("return ") {
        StatementKind::Return { value: Some(parse_operand(p, value)) }
    } else if let Some(rest) = body.strip_prefix("use ") {
        StatementKind::Other { operands: parse_operands(p, rest) }
    } else if let Some(c) = p.call.captures(body) {
        let lhs = c.get(1).map(|m| parse_operand(p, m.as_str()));
        let args = parse_operands(p, &c[4]);
        if c.get(2).is_some() {
            StatementKind::Call { lhs, callee: None, target: Some(parse_operand(p, &c[3])), args }
        } else {
            StatementKind::Call { lhs, callee: Some(c[3].to_string()), target: None, args }
        }
    } else if let Some(c) = p.assign.captures(body) {
        let lhs = parse_operand(p, &c[1]);
        let mut rhs = vec![parse_operand(p, &c[2])];
        let op = c.get(3).map(|m| m.as_str().to_string());
        if let Some(second) = c.get(4) {
            rhs.push(parse_operand(p, second.as_str()));
        }
        StatementKind::Assign { lhs, rhs, op }
    } else {
        return Err(format!("can't make sense of `{body}`"));
    };
    Ok(Statement { kind, loc })
}

fn parse_operands(p: &Patterns, text: &str) -> Vec<Operand> {
    split_args(text).into_iter().map(|a| parse_operand(p, a)).collect()
}

/// Splits on top-level commas, leaving those inside quotes or brackets
/// alone.
fn split_args(text: &str) -> Vec<&str> {
    let mut out = vec![];
    let mut depth = 0i32;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if quoted {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quoted = false,
                _ => (),
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(text[start..i].trim());
                start = i + 1;
            }
            _ => (),
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last);
    }
    out
}

fn parse_operand(p: &Patterns, text: &str) -> Operand {
    let text = text.trim();
    if let Some(v) = text.strip_prefix('&') {
        if p.ident.is_match(v) || p.temp.is_match(v) {
            return Operand::AddrOf(v.to_string());
        }
    }
    if let Some(i) = parse_integer(text) {
        return Operand::Int(i);
    }
    // Compiler temporaries like `D.1234` are plain variables too.
    if p.ident.is_match(text) || p.temp.is_match(text) {
        return Operand::Var(text.to_string());
    }
    if let Some(c) = p.field.captures(text) {
        return Operand::Field { base: c[1].to_string(), text: text.to_string() };
    }
    Operand::Text(text.to_string())
}

fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if !digits.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let value: i64 = parse_int::parse(digits).ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# two blocks
function make_pair
param tc: struct MVMThreadContext *
param type: struct MVMObject *
local a: struct MVMObject *
local artificial D.1: struct MVMObject *
bb 2
    a = call MVM_repr_alloc_init(tc, type) @ pair.c:10
    call MVM_gc_root_temp_push(tc, &a) @ pair.c:11
bb 3 <- 2, 3
    D.1 = call *fp(tc, "x, y", a->body.x) @ pair.c:12
    a = 0
    n = n + 1
    use a
    return a @ pair.c:14
end
"#;

    #[test]
    fn parses_a_procedure() {
        let procs = parse(SAMPLE).unwrap();
        assert_eq!(procs.len(), 1);
        let f = &procs[0];
        assert_eq!(f.name, "make_pair");
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.type_of("a"), Some("struct MVMObject *"));
        assert!(f.locals[1].artificial);
        assert_eq!(f.locals[1].name, "D.1");

        let b2 = f.block(2).unwrap();
        assert!(b2.preds.is_empty());
        assert_eq!(b2.statements[0].callee(), Some("MVM_repr_alloc_init"));
        assert_eq!(b2.statements[0].lhs(), Some(&Operand::Var("a".into())));
        assert_eq!(b2.statements[0].location(), "pair.c:10");
        assert_eq!(b2.statements[1].args()[1], Operand::AddrOf("a".into()));

        let b3 = f.block(3).unwrap();
        assert_eq!(b3.preds, [2, 3]);
        let indirect = &b3.statements[0];
        assert_eq!(indirect.callee(), None);
        assert_eq!(indirect.args()[1], Operand::Text("\"x, y\"".into()));
        assert_eq!(
            indirect.args()[2],
            Operand::Field { base: "a".into(), text: "a->body.x".into() },
        );
        assert_eq!(indirect.lhs(), Some(&Operand::Var("D.1".into())));
        assert_eq!(
            b3.statements[1].kind,
            StatementKind::Assign { lhs: Operand::Var("a".into()), rhs: vec![Operand::Int(0)], op: None },
        );
        assert!(matches!(&b3.statements[2].kind, StatementKind::Assign { op: Some(op), .. } if op == "+"));
        assert!(b3.statements[3].mentions("a"));
        assert!(b3.has_return());
    }

    #[test]
    fn integers() {
        assert_eq!(parse_integer("0"), Some(0));
        assert_eq!(parse_integer("0x10"), Some(16));
        assert_eq!(parse_integer("-3"), Some(-3));
        assert_eq!(parse_integer("x1"), None);
    }

    #[test]
    fn errors_name_the_line() {
        let e = parse("function f\nbb 1\n  ??? nonsense\nend\n").unwrap_err();
        assert!(matches!(e, DumpError::Syntax { line: 3, .. }), "{e:?}");

        let e = parse("function f\n  return\nend\n").unwrap_err();
        assert_eq!(e, DumpError::OrphanStatement { line: 2 });

        let e = parse("bb 1\n").unwrap_err();
        assert_eq!(e, DumpError::OutsideFunction { line: 1, what: "bb".into() });

        let e = parse("function f\nbb 1 <- 7\nend\n").unwrap_err();
        assert_eq!(e, DumpError::UnknownBlock { function: "f".into(), block: 1, pred: 7 });

        let e = parse("function f\nbb 1\n").unwrap_err();
        assert_eq!(e, DumpError::Unterminated { function: "f".into() });
    }

    #[test]
    fn empty_argument_lists() {
        let procs = parse("function f\nbb 1\n call g()\nend\n").unwrap();
        assert!(procs[0].block(1).unwrap().statements[0].args().is_empty());
    }
}
