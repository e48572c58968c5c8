//! Enumerating the ways control can reach a block.

use std::collections::HashMap;

use thiserror::Error;

use crate::roots::cfg::Procedure;

/// Stop after this many paths to one block unless configured otherwise.
pub const DEFAULT_MAX_PATHS: usize = 65536;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PathError {
    #[error("more than {limit} paths lead to bb {target}")]
    TooManyPaths { target: usize, limit: usize },
    #[error("no bb {0} in this procedure")]
    NoSuchBlock(usize),
}

/// A pending expansion: `block` and the path from it down to the target.
struct Frame {
    block: usize,
    path: Vec<usize>,
    next_pred: usize,
}

/// Every path of block indices from a block without predecessors to
/// `target`, found by walking predecessor edges backwards.
///
/// The walk shares one visit counter across the whole search. A block seen
/// twice is not expanded again, which cuts each loop after going around it
/// once. Paths come out in depth-first order over predecessor lists.
pub fn collect_paths(
    proc: &Procedure,
    target: usize,
    limit: usize,
) -> Result<Vec<Vec<usize>>, PathError> {
    if proc.block(target).is_none() {
        return Err(PathError::NoSuchBlock(target));
    }
    let mut seen: HashMap<usize, u8> = HashMap::new();
    let mut paths = vec![];
    let mut stack = vec![enter(proc, target, vec![], &mut seen, &mut paths)];
    check(&paths, target, limit)?;

    while let Some(frame) = stack.last_mut() {
        let preds = proc.block(frame.block).map(|b| b.preds.as_slice()).unwrap_or(&[]);
        let Some(&pred) = preds.get(frame.next_pred) else {
            stack.pop();
            continue;
        };
        frame.next_pred += 1;
        if seen.get(&pred).copied().unwrap_or(0) > 1 {
            continue;
        }
        let path = frame.path.clone();
        let child = enter(proc, pred, path, &mut seen, &mut paths);
        check(&paths, target, limit)?;
        stack.push(child);
    }
    Ok(paths)
}

fn enter(
    proc: &Procedure,
    block: usize,
    mut path: Vec<usize>,
    seen: &mut HashMap<usize, u8>,
    paths: &mut Vec<Vec<usize>>,
) -> Frame {
    let count = seen.entry(block).or_insert(0);
    *count = if *count == 0 { 1 } else { 2 };
    path.insert(0, block);
    let is_entry = proc.block(block).map(|b| b.preds.is_empty()).unwrap_or(true);
    if is_entry {
        paths.push(path.clone());
    }
    Frame { block, path, next_pred: 0 }
}

fn check(paths: &[Vec<usize>], target: usize, limit: usize) -> Result<(), PathError> {
    if paths.len() > limit {
        return Err(PathError::TooManyPaths { target, limit });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::cfg::BasicBlock;

    fn proc(edges: &[(usize, &[usize])]) -> Procedure {
        let blocks = edges
            .iter()
            .map(|(index, preds)| BasicBlock { index: *index, preds: preds.to_vec(), statements: vec![] })
            .collect();
        Procedure::new("f".into(), vec![], vec![], blocks)
    }

    /// The straightforward recursive formulation, for comparison.
    fn recursive(p: &Procedure, bb: usize, path: &[usize], seen: &mut HashMap<usize, u8>) -> Vec<Vec<usize>> {
        let c = seen.entry(bb).or_insert(0);
        *c = if *c == 0 { 1 } else { 2 };
        let mut new_path = vec![bb];
        new_path.extend_from_slice(path);
        let mut out = vec![];
        let preds = &p.block(bb).unwrap().preds;
        if preds.is_empty() {
            out.push(new_path.clone());
        }
        for pred in preds {
            if seen.get(pred).copied().unwrap_or(0) > 1 {
                continue;
            }
            out.extend(recursive(p, *pred, &new_path, seen));
        }
        out
    }

    #[test]
    fn straight_line() {
        let p = proc(&[(0, &[]), (1, &[0]), (2, &[1])]);
        assert_eq!(collect_paths(&p, 2, 10).unwrap(), vec![vec![0, 1, 2]]);
        assert_eq!(collect_paths(&p, 0, 10).unwrap(), vec![vec![0]]);
    }

    #[test]
    fn diamond() {
        let p = proc(&[(0, &[]), (1, &[0]), (2, &[0]), (3, &[1, 2])]);
        assert_eq!(collect_paths(&p, 3, 10).unwrap(), vec![vec![0, 1, 3], vec![0, 2, 3]]);
    }

    #[test]
    fn loops_terminate_and_match_the_recursive_walk() {
        let graphs: [&[(usize, &[usize])]; 3] = [
            // while loop: 1 is the header, 2 the body.
            &[(0, &[]), (1, &[0, 2]), (2, &[1]), (3, &[1])],
            // nested loops with an early exit.
            &[(0, &[]), (1, &[0, 4]), (2, &[1, 3]), (3, &[2]), (4, &[2]), (5, &[1, 3])],
            // self loop.
            &[(0, &[]), (1, &[0, 1]), (2, &[1])],
        ];
        for g in graphs {
            let p = proc(g);
            for (target, _) in g {
                let expected = recursive(&p, *target, &[], &mut HashMap::new());
                let got = collect_paths(&p, *target, 1000).unwrap();
                assert_eq!(got, expected, "target {target} of {g:?}");
                assert!(!got.is_empty());
                for path in &got {
                    assert_eq!(path.last(), Some(target));
                    assert_eq!(path.first(), Some(&0));
                }
            }
        }
    }

    #[test]
    fn cap_is_enforced() {
        // Each block is expanded at most twice, so only blocks without
        // predecessors multiply paths: here twenty of them feed block 100.
        let entries: Vec<usize> = (0..20).collect();
        let mut edges: Vec<(usize, &[usize])> = entries.iter().map(|i| (*i, &[][..])).collect();
        edges.push((100, entries.as_slice()));
        let p = proc(&edges);
        assert_eq!(collect_paths(&p, 100, 20).unwrap().len(), 20);
        assert_eq!(
            collect_paths(&p, 100, 10),
            Err(PathError::TooManyPaths { target: 100, limit: 10 }),
        );
    }

    #[test]
    fn repeated_diamonds_are_cut_by_the_visit_counter() {
        let mut edges: Vec<(usize, Vec<usize>)> = vec![(0, vec![])];
        let mut join = 0;
        for i in 0..6 {
            let (l, r, j) = (3 * i + 1, 3 * i + 2, 3 * i + 3);
            edges.push((l, vec![join]));
            edges.push((r, vec![join]));
            edges.push((j, vec![l, r]));
            join = j;
        }
        let refs: Vec<(usize, &[usize])> = edges.iter().map(|(i, p)| (*i, p.as_slice())).collect();
        let p = proc(&refs);
        let expected = recursive(&p, join, &[], &mut HashMap::new());
        assert_eq!(collect_paths(&p, join, 1000).unwrap(), expected);
        assert_eq!(expected.len(), 2);
    }

    #[test]
    fn missing_blocks() {
        let p = proc(&[(0, &[])]);
        assert_eq!(collect_paths(&p, 9, 10), Err(PathError::NoSuchBlock(9)));
    }
}
