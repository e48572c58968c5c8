//! Reconstructing which gen2 slots are in use.
//!
//! The gen2 allocator doesn't keep a per-slot "in use" bit. What it has is,
//! per size class, a list of pages, a bump cursor on the page currently
//! being filled, and a free list threaded through the first word of every
//! freed slot. Occupancy is rebuilt from those: everything the bump cursor
//! has passed is presumed live, and then the free list punches holes.
//!
//! Classifying every live slot would take ages on a big heap, so only a
//! random sample of each page is classified.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;

use crate::census::classify::classify;
use crate::census::histogram::SortBy;
use crate::census::mosaic;
use crate::census::stats::HeapStats;
use crate::census::Diagnostic;
use crate::layout::{page_side, HeapModel};
use crate::memory::offset_address;

/// More pages than this in one size class means we're reading garbage.
pub const MAX_PAGES: u64 = 1 << 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Slot {
    /// Handed out and not on the free list.
    Live,
    /// On the free list.
    Free,
    /// Never handed out by the bump allocator.
    Unknown,
}

#[derive(Clone, Debug)]
pub struct SizeClassSnapshot {
    pub bin: u32,
    pub bucket_size: u64,
    pub page_items: u64,
    /// Base address of each page, in allocation order.
    pub pages: Vec<u64>,
    /// Per page, per slot.
    pub occupancy: Vec<Vec<Slot>>,
    pub cur_page: u64,
    pub free_list_len: u64,
    /// How many slots were classified into `stats`.
    pub sampled: u64,
    pub stats: HeapStats,
}

impl SizeClassSnapshot {
    fn unallocated(bin: u32, bucket_size: u64, page_items: u64) -> Self {
        Self {
            bin,
            bucket_size,
            page_items,
            pages: vec![],
            occupancy: vec![],
            cur_page: 0,
            free_list_len: 0,
            sampled: 0,
            stats: HeapStats::new(),
        }
    }

    pub fn is_unallocated(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn count(&self, state: Slot) -> usize {
        self.occupancy.iter().flatten().filter(|s| **s == state).count()
    }

    /// One past the last byte of the page at `base`, or `None` when a page
    /// there wouldn't fit in the address space.
    fn page_end(&self, base: u64) -> Option<u64> {
        self.page_items.checked_mul(self.bucket_size)?.checked_add(base)
    }

    /// Maps an address to the (page, slot) containing it.
    fn locate(&self, by_base: &BTreeMap<u64, usize>, address: u64) -> Option<(usize, u64, bool)> {
        let (base, page) = by_base.range(..=address).next_back()?;
        let offset = address - base;
        let slot = offset / self.bucket_size;
        if slot >= self.page_items {
            return None;
        }
        Some((*page, slot, offset % self.bucket_size == 0))
    }

    pub fn render(&self, out: &mut dyn Write, row_limit: usize) -> io::Result<()> {
        writeln!(out, "size bucket: {}", self.bucket_size)?;
        if self.is_unallocated() {
            return writeln!(out, "(unallocated)");
        }

        let mut drawn = vec![];
        let mut full = 0;
        let mut empty = 0;
        for (num, page) in self.occupancy.iter().enumerate() {
            let live = page.iter().filter(|s| **s == Slot::Live).count();
            if live == page.len() {
                full += 1;
            } else if live == 0 {
                empty += 1;
            } else {
                drawn.push((num, page.as_slice()));
            }
        }
        let coords = mosaic::hilbert_coords(page_side(self.page_items));
        mosaic::render_pages(out, &drawn, &coords)?;
        if full > 0 {
            writeln!(out, "(and {full} completely filled pages)")?;
        }
        if empty > 0 {
            writeln!(out, "(and {empty} empty pages)")?;
        }
        if self.free_list_len > 0 {
            writeln!(out, "(freelist with {} entries)", self.free_list_len)?;
        }
        writeln!(out)?;

        if self.stats.sizes.len() > 1 {
            writeln!(out, "sizes of objects/stables:")?;
            self.stats.sizes.show(out, SortBy::Key, true, row_limit)?;
        }
        if !self.stats.names.is_empty() {
            writeln!(out, "debugnames:")?;
            self.stats.names.show(out, SortBy::Value, false, row_limit)?;
        }
        if !self.stats.strings.is_empty() {
            writeln!(out, "strings:")?;
            self.stats.strings.show(out, SortBy::Value, false, row_limit)?;
        }
        Ok(())
    }
}

/// Walks size class `bin` of the gen2 allocator at `gen2`. `None` means the
/// walk was cancelled.
pub fn walk_size_class<H: HeapModel + ?Sized, R: Rng + ?Sized>(
    model: &H,
    gen2: u64,
    bin: u32,
    sample_factor: u64,
    rng: &mut R,
    cancel: &AtomicBool,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<SizeClassSnapshot> {
    let layout = model.layout();
    let bucket_size = layout.bucket_size(bin);
    let page_items = layout.page_items;
    let mut snap = SizeClassSnapshot::unallocated(bin, bucket_size, page_items);

    let state = match model.read_size_class(gen2, bin) {
        Ok(s) => s,
        Err(source) => {
            diagnostics.push(Diagnostic::Unreadable { what: format!("size class {bin}"), source });
            return Some(snap);
        }
    };
    if state.pages == 0 || state.num_pages == 0 {
        return Some(snap);
    }
    if state.num_pages > MAX_PAGES {
        diagnostics.push(Diagnostic::ImplausiblePages { bin, count: state.num_pages });
        return Some(snap);
    }

    let ptr = layout.pointer_size as u64;
    let mut pages = Vec::with_capacity(state.num_pages as usize);
    for i in 0..state.num_pages {
        match offset_address(state.pages, i * ptr).and_then(|a| model.read_pointer(a)) {
            Ok(p) => pages.push(p),
            Err(source) => {
                diagnostics.push(Diagnostic::Unreadable {
                    what: format!("page list of size class {bin}"),
                    source,
                });
                return Some(snap);
            }
        }
    }

    // How far the bump cursor got on the page it's filling.
    let cursor_slot = match pages.get(state.cur_page as usize).map(|&b| (b, snap.page_end(b))) {
        Some((base, Some(end))) => {
            if state.alloc_pos < base || state.alloc_pos > end {
                diagnostics.push(Diagnostic::CursorOutsidePage { bin, alloc_pos: state.alloc_pos });
            }
            state.alloc_pos.clamp(base, end).saturating_sub(base) / bucket_size
        }
        // Reported with the rest of the pages below.
        Some((_, None)) => 0,
        None => {
            diagnostics.push(Diagnostic::CursorOutsidePage { bin, alloc_pos: state.alloc_pos });
            page_items
        }
    };

    let side = page_side(page_items);
    let mut samples = vec![];
    for (p, &base) in pages.iter().enumerate() {
        let p = p as u64;
        let allocated = if snap.page_end(base).is_none() {
            log::warn!("size class {bin}: page {p} at {base:#x} is garbage");
            diagnostics.push(Diagnostic::ImplausiblePage { bin, base });
            0
        } else {
            match p.cmp(&state.cur_page) {
                std::cmp::Ordering::Less => page_items,
                std::cmp::Ordering::Equal => cursor_slot,
                std::cmp::Ordering::Greater => 0,
            }
        };
        let mut slots = vec![Slot::Live; allocated as usize];
        slots.resize(page_items as usize, Slot::Unknown);
        snap.occupancy.push(slots);

        // Pick the sample now; whether each pick is still live is only
        // known once the free list has been walked.
        let count = u64::min(side.saturating_mul(sample_factor), allocated / 4) as usize;
        let mut picks = rand::seq::index::sample(rng, allocated as usize, count).into_vec();
        picks.sort_unstable();
        samples.extend(picks.into_iter().map(|i| (p as usize, i as u64)));
    }
    snap.pages = pages;
    snap.cur_page = state.cur_page;

    punch_free_list(&mut snap, state.free_list, model, diagnostics);

    for (page, slot) in samples {
        if snap.occupancy[page][slot as usize] != Slot::Live {
            continue;
        }
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        // Only pages that fit in the address space have live slots.
        let address = snap.pages[page] + slot * bucket_size;
        match classify(model, address) {
            Ok(rec) => {
                snap.stats.record(&rec);
                snap.sampled += 1;
            }
            Err(e) => {
                log::warn!("gen2 object at {address:#x}: {e}");
                diagnostics.push(Diagnostic::Object(e));
            }
        }
    }
    log::debug!(
        "size class {bin}: {} pages, {} free, {} sampled",
        snap.pages.len(),
        snap.free_list_len,
        snap.sampled,
    );
    Some(snap)
}

fn punch_free_list<H: HeapModel + ?Sized>(
    snap: &mut SizeClassSnapshot,
    head: u64,
    model: &H,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let bin = snap.bin;
    let by_base: BTreeMap<u64, usize> = snap
        .pages
        .iter()
        .enumerate()
        .filter(|(_, b)| snap.page_end(**b).is_some())
        .map(|(i, b)| (*b, i))
        .collect();
    let capacity = snap.pages.len() as u64 * snap.page_items;

    let mut cursor = head;
    let mut steps = 0;
    while cursor != 0 {
        if steps >= capacity {
            diagnostics.push(Diagnostic::FreeListCycle { bin });
            return;
        }
        steps += 1;

        match snap.locate(&by_base, cursor) {
            None => {
                log::warn!("size class {bin}: free list entry {cursor:#x} is outside every page");
                diagnostics.push(Diagnostic::FreeListUnmapped { bin, address: cursor });
            }
            Some((_, _, false)) => {
                diagnostics.push(Diagnostic::FreeListMisaligned { bin, address: cursor });
            }
            Some((page, slot, true)) => {
                let state = &mut snap.occupancy[page][slot as usize];
                match state {
                    Slot::Live => {
                        *state = Slot::Free;
                        snap.free_list_len += 1;
                    }
                    Slot::Unknown => {
                        diagnostics.push(Diagnostic::FreeListBeyondCursor { bin, address: cursor });
                    }
                    Slot::Free => {
                        diagnostics.push(Diagnostic::FreeListCycle { bin });
                        return;
                    }
                }
            }
        }

        cursor = match model.read_pointer(cursor) {
            Ok(next) => next,
            Err(source) => {
                diagnostics.push(Diagnostic::Unreadable {
                    what: format!("free list of size class {bin} at {cursor:#x}"),
                    source,
                });
                return;
            }
        };
    }
}

/// Classifies every object in the overflow list.
pub fn walk_overflows<H: HeapModel + ?Sized>(
    model: &H,
    gen2: u64,
    cancel: &AtomicBool,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<HeapStats> {
    let mut stats = HeapStats::new();
    let objects = match model.read_overflows(gen2) {
        Ok(o) => o,
        Err(source) => {
            diagnostics.push(Diagnostic::Unreadable { what: "gen2 overflow list".into(), source });
            return Some(stats);
        }
    };
    for address in objects {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        match classify(model, address) {
            Ok(rec) => stats.record(&rec),
            Err(e) => {
                log::warn!("overflow object at {address:#x}: {e}");
                diagnostics.push(Diagnostic::Object(e));
            }
        }
    }
    Some(stats)
}
