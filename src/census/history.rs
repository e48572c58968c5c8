use std::rc::Rc;

use thiserror::Error;

use crate::census::nursery::NurserySnapshot;

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HistoryError {
    #[error("no snapshot {index}: only {len} recorded so far")]
    NoSuchSnapshot { index: isize, len: usize },
    #[error("snapshot {index} has nothing before it to diff against")]
    NothingBefore { index: isize },
}

/// Append-only record of nursery snapshots taken during a session.
#[derive(Clone, Debug, Default)]
pub struct SnapshotHistory {
    snapshots: Vec<Rc<NurserySnapshot>>,
}

impl SnapshotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snap: NurserySnapshot) -> Rc<NurserySnapshot> {
        let snap = Rc::new(snap);
        self.snapshots.push(snap.clone());
        snap
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NurserySnapshot> {
        self.snapshots.iter().map(|s| &**s)
    }

    /// Turns a possibly negative index (counting from the end) into a
    /// position.
    pub fn resolve(&self, index: isize) -> Result<usize, HistoryError> {
        let len = self.snapshots.len();
        let pos = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize).filter(|i| *i < len)
        };
        pos.ok_or(HistoryError::NoSuchSnapshot { index, len })
    }

    pub fn get(&self, index: isize) -> Result<Rc<NurserySnapshot>, HistoryError> {
        Ok(self.snapshots[self.resolve(index)?].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::stats::HeapStats;

    fn snap(generation: u64) -> NurserySnapshot {
        NurserySnapshot {
            generation,
            start: 0,
            cursor: 0,
            end: 0,
            stats: HeapStats::new(),
            scanned_to: 0,
        }
    }

    #[test]
    fn indices_count_from_either_end() {
        let mut h = SnapshotHistory::new();
        for g in 10..13 {
            h.push(snap(g));
        }
        assert_eq!(h.get(0).unwrap().generation, 10);
        assert_eq!(h.get(2).unwrap().generation, 12);
        assert_eq!(h.get(-1).unwrap().generation, 12);
        assert_eq!(h.get(-3).unwrap().generation, 10);
        assert_eq!(h.resolve(3), Err(HistoryError::NoSuchSnapshot { index: 3, len: 3 }));
        assert_eq!(h.resolve(-4), Err(HistoryError::NoSuchSnapshot { index: -4, len: 3 }));
    }

    #[test]
    fn empty_history_has_nothing() {
        let h = SnapshotHistory::new();
        assert!(h.is_empty());
        assert!(h.get(-1).is_err());
        assert!(h.get(0).is_err());
    }
}
