//! Drawing gen2 pages as Hilbert-curve mosaics.
//!
//! Slot `i` of a page is drawn at the cell the Hilbert curve visits `i`th,
//! so runs of neighbouring slots show up as blobs instead of stripes. Two
//! rows of cells share one line of half-block characters.

use std::io::{self, Write};

use crate::census::gen2::Slot;

/// Pages drawn side by side before wrapping.
pub const PAGES_PER_ROW: usize = 5;

/// `coords[y][x]` is the slot index drawn at column `x`, row `y` of a
/// `side` by `side` square. `side` must be a power of two.
pub fn hilbert_coords(side: u64) -> Vec<Vec<u64>> {
    (0..side)
        .map(|y| (0..side).map(|x| xy2d(side, x, y)).collect())
        .collect()
}

fn xy2d(n: u64, mut x: u64, mut y: u64) -> u64 {
    let mut d = 0;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = n - 1 - x;
                y = n - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// One character for two vertically stacked slots.
pub fn shade(upper: Slot, lower: Slot) -> char {
    use Slot::*;
    match (upper, lower) {
        (Live, Live) => '█',
        (Live, Free) => '▀',
        (Free, Live) => '▄',
        (Free, Free) => ' ',
        (Unknown, Unknown) => '░',
        (Unknown, Free) | (Free, Unknown) => '▒',
        (Unknown, Live) | (Live, Unknown) => '▓',
    }
}

/// Lines of half blocks for one page.
pub fn page_mosaic(slots: &[Slot], coords: &[Vec<u64>]) -> Vec<String> {
    let slot = |i: u64| slots.get(i as usize).copied().unwrap_or(Slot::Unknown);
    coords
        .chunks(2)
        .map(|rows| match rows {
            [upper, lower] => upper
                .iter()
                .zip(lower)
                .map(|(u, l)| shade(slot(*u), slot(*l)))
                .collect(),
            [only] => only.iter().map(|u| shade(slot(*u), Slot::Unknown)).collect(),
            _ => String::new(),
        })
        .collect()
}

/// Draws `pages` (page number, slots) in rows of [`PAGES_PER_ROW`], each
/// labeled with its 1-based page number.
pub fn render_pages(
    out: &mut dyn Write,
    pages: &[(usize, &[Slot])],
    coords: &[Vec<u64>],
) -> io::Result<()> {
    let side = coords.len();
    for row in pages.chunks(PAGES_PER_ROW) {
        let labels: Vec<String> = row
            .iter()
            .map(|(num, _)| format!("{:^side$}", format!("pg {}", num + 1)))
            .collect();
        writeln!(out, "{}", labels.join(" ").trim_end())?;

        let drawn: Vec<Vec<String>> = row.iter().map(|(_, s)| page_mosaic(s, coords)).collect();
        let lines = drawn.first().map(Vec::len).unwrap_or(0);
        for line in 0..lines {
            let parts: Vec<&str> = drawn.iter().map(|d| d[line].as_str()).collect();
            writeln!(out, "{}", parts.join(" "))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn curve_is_a_permutation_with_adjacent_steps() {
        for side in [2u64, 4, 16] {
            let coords = hilbert_coords(side);
            let mut pos = vec![(0, 0); (side * side) as usize];
            let mut seen = BTreeSet::new();
            for (y, row) in coords.iter().enumerate() {
                for (x, d) in row.iter().enumerate() {
                    assert!(seen.insert(*d));
                    pos[*d as usize] = (x as i64, y as i64);
                }
            }
            assert_eq!(seen.len() as u64, side * side);
            for w in pos.windows(2) {
                let dist = (w[0].0 - w[1].0).abs() + (w[0].1 - w[1].1).abs();
                assert_eq!(dist, 1, "side {side}: {:?} -> {:?}", w[0], w[1]);
            }
        }
    }

    #[test]
    fn small_curve_matches_the_textbook() {
        assert_eq!(hilbert_coords(2), vec![vec![0, 3], vec![1, 2]]);
    }

    #[test]
    fn shades() {
        assert_eq!(shade(Slot::Live, Slot::Live), '█');
        assert_eq!(shade(Slot::Live, Slot::Free), '▀');
        assert_eq!(shade(Slot::Free, Slot::Live), '▄');
        assert_eq!(shade(Slot::Free, Slot::Free), ' ');
        assert_eq!(shade(Slot::Unknown, Slot::Unknown), '░');
        assert_eq!(shade(Slot::Free, Slot::Unknown), '▒');
        assert_eq!(shade(Slot::Unknown, Slot::Live), '▓');
    }

    #[test]
    fn mosaic_dimensions() {
        let coords = hilbert_coords(16);
        let mut slots = vec![Slot::Live; 256];
        slots[200..].fill(Slot::Unknown);
        let lines = page_mosaic(&slots, &coords);
        assert_eq!(lines.len(), 8);
        assert!(lines.iter().all(|l| l.chars().count() == 16));
        let full: usize = lines.iter().map(|l| l.chars().filter(|c| *c == '█').count()).sum();
        assert!(full > 0);
        assert!(lines.iter().any(|l| l.contains('░')));
    }

    #[test]
    fn rows_wrap_after_five_pages() {
        let coords = hilbert_coords(4);
        let slots = vec![Slot::Live; 16];
        let pages: Vec<(usize, &[Slot])> = (0..7).map(|i| (i, slots.as_slice())).collect();
        let mut out = vec![];
        render_pages(&mut out, &pages, &coords).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        // Label plus two mosaic lines per row of pages.
        assert_eq!(lines.len(), 6);
        assert!(lines[0].contains("pg 1") && lines[0].contains("pg 5"));
        assert!(!lines[0].contains("pg 6"));
        assert_eq!(lines[1], ["████"; 5].join(" "));
        assert!(lines[3].contains("pg 7"));
    }
}
