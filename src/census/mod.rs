//! The heap census: walk a thread's nursery and gen2, classify what's
//! there, and keep nursery snapshots around for diffing.

pub mod classify;
pub mod gen2;
pub mod histogram;
pub mod history;
pub mod mosaic;
pub mod nursery;
pub mod stats;
pub mod synth;

use std::io::{self, Write};
use std::rc::Rc;
use std::sync::atomic::AtomicBool;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::HeapModel;
use crate::memory::MemoryError;

use self::classify::ClassifyError;
use self::gen2::SizeClassSnapshot;
use self::histogram::DEFAULT_ROW_LIMIT;
use self::history::{HistoryError, SnapshotHistory};
use self::nursery::NurserySnapshot;
use self::stats::HeapStats;

/// Something odd noticed during a walk. None of these stop the census as a
/// whole; they are reported alongside the results.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum Diagnostic {
    #[error(transparent)]
    Object(#[from] ClassifyError),
    #[error("nursery scan stuck at {address:#x}: size of the object there is unknown")]
    ScanStuck { address: u64 },
    #[error("nursery scan ended at {reached:#x}, past the allocation cursor at {cursor:#x}")]
    CursorOvershoot { cursor: u64, reached: u64 },
    #[error("could not read {what}")]
    Unreadable {
        what: String,
        #[source]
        source: MemoryError,
    },
    #[error("size class {bin}: free list entry {address:#x} is not in any page")]
    FreeListUnmapped { bin: u32, address: u64 },
    #[error("size class {bin}: free list entry {address:#x} is not at a slot boundary")]
    FreeListMisaligned { bin: u32, address: u64 },
    #[error("size class {bin}: free list entry {address:#x} was never allocated")]
    FreeListBeyondCursor { bin: u32, address: u64 },
    #[error("size class {bin}: free list loops back on itself")]
    FreeListCycle { bin: u32 },
    #[error("size class {bin}: allocation position {alloc_pos:#x} is outside the current page")]
    CursorOutsidePage { bin: u32, alloc_pos: u64 },
    #[error("size class {bin}: {count} pages is implausible")]
    ImplausiblePages { bin: u32, count: u64 },
    #[error("size class {bin}: page at {base:#x} runs off the end of the address space")]
    ImplausiblePage { bin: u32, base: u64 },
    #[error("nursery bounds are out of order: {start:#x}, cursor {cursor:#x}, end {end:#x}")]
    BadNurseryBounds { start: u64, cursor: u64, end: u64 },
}

/// Renders an error followed by each of its sources, colon separated.
pub fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        text.push_str(": ");
        text.push_str(&s.to_string());
        source = s.source();
    }
    text
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CensusOptions {
    /// Multiplier on the per-page gen2 sample size.
    pub sample_factor: u64,
    /// Fixed seed for the gen2 sampler, for reproducible reports.
    pub seed: Option<u64>,
    pub row_limit: usize,
}

impl Default for CensusOptions {
    fn default() -> Self {
        Self { sample_factor: 2, seed: None, row_limit: DEFAULT_ROW_LIMIT }
    }
}

/// Everything one `heap` command found.
#[derive(Clone, Debug)]
pub struct HeapReport {
    pub generation: u64,
    pub nursery: Rc<NurserySnapshot>,
    pub size_classes: Vec<SizeClassSnapshot>,
    pub overflows: HeapStats,
    pub diagnostics: Vec<Diagnostic>,
}

impl HeapReport {
    pub fn render(&self, out: &mut dyn Write, row_limit: usize) -> io::Result<()> {
        writeln!(out, "the current generation of the gc is {}", self.generation)?;
        for sc in &self.size_classes {
            sc.render(out, row_limit)?;
        }
        self.nursery.render(out, row_limit)?;

        writeln!(out, "overflows in the gen2")?;
        self.overflows.render_counts(out)?;
        self.overflows.render(out, row_limit)?;

        if !self.diagnostics.is_empty() {
            writeln!(out, "{} problems during the walk:", self.diagnostics.len())?;
            for d in &self.diagnostics {
                writeln!(out, "  {}", error_chain(d))?;
            }
        }
        Ok(())
    }
}

/// Census state that outlives a single command: options, the sampler, and
/// the nursery snapshot history.
pub struct CensusSession {
    options: CensusOptions,
    history: SnapshotHistory,
    rng: StdRng,
}

impl CensusSession {
    pub fn new(options: CensusOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { options, history: SnapshotHistory::new(), rng }
    }

    pub fn options(&self) -> &CensusOptions {
        &self.options
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Walks the nursery, every gen2 size class and the overflow list of
    /// thread context `tc`. The nursery snapshot goes into the history as
    /// soon as the nursery walk completes.
    ///
    /// Returns `Ok(None)` if `cancel` was raised partway.
    pub fn walk_heap<H: HeapModel + ?Sized>(
        &mut self,
        model: &H,
        tc: u64,
        cancel: &AtomicBool,
    ) -> Result<Option<HeapReport>, MemoryError> {
        let heap = model.read_thread_heap(tc)?;
        let mut diagnostics = vec![];

        let Some(nursery) = nursery::walk_nursery(model, &heap, cancel, &mut diagnostics) else {
            return Ok(None);
        };
        let nursery = self.history.push(nursery);

        let mut size_classes = vec![];
        for bin in 0..model.layout().bins {
            let Some(sc) = gen2::walk_size_class(
                model,
                heap.gen2,
                bin,
                self.options.sample_factor,
                &mut self.rng,
                cancel,
                &mut diagnostics,
            ) else {
                return Ok(None);
            };
            size_classes.push(sc);
        }

        let Some(overflows) = gen2::walk_overflows(model, heap.gen2, cancel, &mut diagnostics) else {
            return Ok(None);
        };

        Ok(Some(HeapReport {
            generation: heap.generation,
            nursery,
            size_classes,
            overflows,
            diagnostics,
        }))
    }

    /// Picks the (before, after) snapshot pair for a diff. No indices means
    /// the two most recent; one index `n` means `n - 1` against `n`, which
    /// for `n == 0` is an error rather than a wrap to the newest.
    pub fn diff_pair(
        &self,
        indices: &[isize],
    ) -> Result<(Rc<NurserySnapshot>, Rc<NurserySnapshot>), HistoryError> {
        let (a, b) = match *indices {
            [] => (-2, -1),
            [n] => match n.checked_sub(1) {
                Some(before) if n != 0 => (before, n),
                _ => return Err(HistoryError::NothingBefore { index: n }),
            },
            [a, b, ..] => (a, b),
        };
        Ok((self.history.get(a)?, self.history.get(b)?))
    }

    pub fn diff(&self, indices: &[isize], out: &mut dyn Write) -> Result<(), DiffError> {
        let (before, after) = self.diff_pair(indices)?;
        NurserySnapshot::render_diff(&before, &after, out)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("could not write the diff")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::synth::SyntheticHeap;
    use crate::layout::{HeapLayout, LayoutModel};
    use std::sync::atomic::Ordering;

    fn session() -> CensusSession {
        CensusSession::new(CensusOptions { seed: Some(3), ..Default::default() })
    }

    #[test]
    fn diff_needs_two_snapshots() {
        let layout = HeapLayout::default();
        let mut h = SyntheticHeap::new(&layout);
        let table = h.table("P6opaque", Some("A"));
        let gen2 = h.gen2();
        h.zero(0x1000, 0x100);
        h.object(0x1000, 0x40, table);
        h.zero(0x5000, 0x100);
        h.thread(0x5000, 1, (0x1000, 0x1040, 0x1100), gen2);
        let mem = h.into_segments();
        let model = LayoutModel::new(&mem, &layout);

        let mut s = session();
        let mut out = vec![];
        assert!(matches!(s.diff(&[], &mut out), Err(DiffError::History(_))));
        assert!(out.is_empty());

        let cancel = AtomicBool::new(false);
        s.walk_heap(&model, 0x5000, &cancel).unwrap().unwrap();
        assert!(s.diff(&[], &mut out).is_err());
        s.walk_heap(&model, 0x5000, &cancel).unwrap().unwrap();
        s.diff(&[], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("nursery state --DIFF--:\n"));

        let (a, b) = s.diff_pair(&[1]).unwrap();
        assert!(Rc::ptr_eq(&a, &s.history().get(0).unwrap()));
        assert!(Rc::ptr_eq(&b, &s.history().get(1).unwrap()));
        assert!(s.diff_pair(&[0, 5]).is_err());
        assert!(s.diff_pair(&[-1]).is_ok());
        assert_eq!(s.diff_pair(&[0]).unwrap_err(), HistoryError::NothingBefore { index: 0 });
        assert_eq!(
            s.diff_pair(&[isize::MIN]).unwrap_err(),
            HistoryError::NothingBefore { index: isize::MIN },
        );
    }

    #[test]
    fn cancelled_nursery_walks_record_nothing() {
        let layout = HeapLayout::default();
        let mut h = SyntheticHeap::new(&layout);
        let gen2 = h.gen2();
        h.zero(0x5000, 0x100);
        h.thread(0x5000, 1, (0x1000, 0x1040, 0x1100), gen2);
        let mem = h.into_segments();
        let model = LayoutModel::new(&mem, &layout);

        let mut s = session();
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);
        assert!(s.walk_heap(&model, 0x5000, &cancel).unwrap().is_none());
        assert!(s.history().is_empty());
    }

    #[test]
    fn cancelling_during_gen2_keeps_the_nursery_snapshot() {
        let layout = HeapLayout::default();
        let mut h = SyntheticHeap::new(&layout);
        let table = h.table("P6opaque", None);
        let gen2 = h.gen2();
        h.zero(0x2000, 0x100);
        h.object(0x2000, 0x100, table);
        h.overflows(gen2, &[0x2000]);
        h.zero(0x5000, 0x100);
        // An empty nursery completes without looking at the flag; the
        // overflow list is where the walk notices it.
        h.thread(0x5000, 1, (0x1000, 0x1000, 0x1100), gen2);
        let mem = h.into_segments();
        let model = LayoutModel::new(&mem, &layout);

        let mut s = session();
        let cancel = AtomicBool::new(true);
        assert!(s.walk_heap(&model, 0x5000, &cancel).unwrap().is_none());
        assert_eq!(s.history().len(), 1);
        assert_eq!(s.history().get(-1).unwrap().generation, 1);
    }

    #[test]
    fn unreadable_thread_contexts_are_errors() {
        let layout = HeapLayout::default();
        let mem = SyntheticHeap::new(&layout).into_segments();
        let model = LayoutModel::new(&mem, &layout);
        let mut s = session();
        assert!(s.walk_heap(&model, 0x5000, &AtomicBool::new(false)).is_err());
    }

    #[test]
    fn chains_include_sources() {
        let d = Diagnostic::Unreadable {
            what: "size class 3".into(),
            source: MemoryError::Unmapped { address: 0x10 },
        };
        assert_eq!(
            error_chain(&d),
            "could not read size class 3: address 0x10 is not backed by any loaded segment",
        );
    }
}
