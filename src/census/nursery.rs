//! Linear scan of the young generation.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::census::classify::classify;
use crate::census::stats::HeapStats;
use crate::census::Diagnostic;
use crate::layout::{HeapModel, ThreadHeap};

/// Width of the occupancy bar in the nursery summary.
const BAR_WIDTH: usize = 20;

/// The nursery as it looked at one point in time. Never changes after the
/// walk that produced it.
#[derive(Clone, Debug)]
pub struct NurserySnapshot {
    pub generation: u64,
    pub start: u64,
    pub cursor: u64,
    pub end: u64,
    pub stats: HeapStats,
    /// Where the scan actually stopped.
    pub scanned_to: u64,
}

impl NurserySnapshot {
    /// Fraction of the nursery that has been handed out.
    pub fn occupancy(&self) -> f64 {
        if self.end <= self.start {
            return 0.0;
        }
        let used = self.cursor.saturating_sub(self.start).min(self.end - self.start);
        used as f64 / (self.end - self.start) as f64
    }

    pub fn render(&self, out: &mut dyn Write, row_limit: usize) -> io::Result<()> {
        writeln!(out, "nursery state:")?;
        let occ = self.occupancy();
        let used = (occ * BAR_WIDTH as f64) as usize;
        writeln!(
            out,
            "[{}{}] {}%",
            "=".repeat(used),
            " ".repeat(BAR_WIDTH - used),
            (occ * 100.0) as u64,
        )?;
        self.stats.render_counts(out)?;
        self.stats.render(out, row_limit)
    }

    pub fn render_diff(before: &Self, after: &Self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "nursery state --DIFF--:")?;
        HeapStats::render_diff(&before.stats, &after.stats, out)
    }
}

/// Classifies everything in `[start, cursor)`. Returns `None` if cancelled.
pub fn walk_nursery<H: HeapModel + ?Sized>(
    model: &H,
    heap: &ThreadHeap,
    cancel: &AtomicBool,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<NurserySnapshot> {
    let ThreadHeap { generation, nursery_start: start, nursery_cursor: cursor, nursery_end: end, .. } =
        *heap;
    let mut stats = HeapStats::new();

    if start > cursor || cursor > end {
        log::warn!("nursery bounds {start:#x}..{cursor:#x}..{end:#x} are out of order");
        diagnostics.push(Diagnostic::BadNurseryBounds { start, cursor, end });
        return Some(NurserySnapshot { generation, start, cursor, end, stats, scanned_to: start });
    }

    let mut pos = start;
    while pos < cursor {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        match classify(model, pos) {
            Ok(rec) => {
                stats.record(&rec);
                pos = pos.saturating_add(rec.size);
            }
            Err(e) => {
                log::warn!("nursery object at {pos:#x}: {e}");
                let size = e.size();
                diagnostics.push(Diagnostic::Object(e));
                match size {
                    Some(size) => pos = pos.saturating_add(size),
                    None => {
                        diagnostics.push(Diagnostic::ScanStuck { address: pos });
                        break;
                    }
                }
            }
        }
    }
    if pos > cursor {
        diagnostics.push(Diagnostic::CursorOvershoot { cursor, reached: pos });
    }
    log::debug!("nursery: {} objects in {:#x}..{:#x}", stats.total(), start, pos);

    Some(NurserySnapshot { generation, start, cursor, end, stats, scanned_to: pos })
}
