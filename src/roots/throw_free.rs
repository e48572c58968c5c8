//! Memory still held when an exception is thrown.
//!
//! Throwing longjmps out of the procedure, so anything obtained from a
//! malloc-like call and not yet freed leaks. Results are approximate: a
//! pointer handed off to a structure that outlives the throw is reported
//! too.

use std::collections::BTreeSet;

use crate::roots::checker::{Finding, Scan};

/// Findings for every path to every throw in the procedure.
pub(crate) fn check(scan: &mut Scan<'_>) -> Vec<Finding> {
    let (proc, config) = (scan.proc, scan.config);
    let mut out = vec![];
    for block in proc.blocks() {
        let throws = block.statements.iter().filter(|s| s.callee() == Some(config.throw.as_str()));
        for _ in throws {
            let paths = match scan.paths_to(block.index) {
                Ok(paths) => paths,
                Err(e) => {
                    log::info!("not checking throws in {}: {e}", proc.name);
                    return out;
                }
            };
            for path in paths {
                let mut held: BTreeSet<String> = BTreeSet::new();
                for stmt in scan.statements(&path) {
                    let Some(callee) = stmt.callee() else {
                        continue;
                    };
                    if config.malloc_like.contains(callee) {
                        if let Some(lhs) = stmt.lhs() {
                            held.insert(lhs.to_string());
                        }
                    } else if config.free_like.contains(callee) {
                        if let Some(arg) = stmt.args().first() {
                            held.remove(&arg.to_string());
                        }
                    } else if callee == config.throw && !held.is_empty() {
                        out.push(Finding::MissingFree {
                            procedure: proc.name.clone(),
                            loc: stmt.location().to_string(),
                            vars: held.iter().cloned().collect(),
                        });
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::roots::checker::Checker;
    use crate::roots::config::RootingConfig;
    use crate::roots::dump;

    fn check(text: &str) -> Vec<String> {
        let mut checker = Checker::new(RootingConfig::default());
        dump::parse(text)
            .unwrap()
            .iter()
            .flat_map(|p| checker.check_throw(p))
            .map(|f| f.to_string())
            .collect()
    }

    #[test]
    fn leak_on_the_error_branch() {
        let text = "
function load
param tc: struct MVMThreadContext *
local buf: char *
local name: char *
bb 2
    buf = call MVM_malloc(64) @ load.c:3
    name = call MVM_string_utf8_encode_C_string(tc, s) @ load.c:4
bb 3 <- 2
    call MVM_free(name) @ load.c:6
    call MVM_exception_throw_adhoc(tc, \"bad\") @ load.c:7
bb 4 <- 2
    call MVM_free(buf) @ load.c:9
    call MVM_free(name) @ load.c:10
    return @ load.c:11
end
";
        assert_eq!(
            check(text),
            ["possible missing free before a throw in load at load.c:7, might need freeing: buf"],
        );
    }

    #[test]
    fn freed_before_throwing() {
        let text = "
function f
param tc: struct MVMThreadContext *
local p: char *
bb 2
    p = call MVM_calloc(1, 8) @ f.c:1
    call MVM_free(p) @ f.c:2
    call MVM_exception_throw_adhoc(tc, \"x\") @ f.c:3
    return @ f.c:4
end
";
        assert!(check(text).is_empty());
    }

    #[test]
    fn held_set_is_listed_sorted() {
        let text = "
function f
param tc: struct MVMThreadContext *
bb 2
    z = call MVM_malloc(1) @ f.c:1
    a = call MVM_malloc(1) @ f.c:2
    call MVM_exception_throw_adhoc(tc, \"x\") @ f.c:3
end
";
        assert_eq!(
            check(text),
            ["possible missing free before a throw in f at f.c:3, might need freeing: a, z"],
        );
    }
}
