//! Counting things and drawing the counts as text bar charts.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::{self, Write};

/// Width of the bars, in characters.
pub const PRETTY_WIDTH: usize = 50;

/// Most rows a single histogram prints before folding the rest into the
/// summary lines.
pub const DEFAULT_ROW_LIMIT: usize = 50;

/// Longest key we pad the key column out to.
const KEY_COLUMN_MAX: usize = 30;

/// Something a histogram can be keyed by.
pub trait HistogramKey: Ord + Clone + Display {
    /// Numeric value of the key, for histograms where `key * count` means
    /// something (object sizes, mostly).
    fn weight(&self) -> Option<u64> {
        None
    }
}

impl HistogramKey for u64 {
    fn weight(&self) -> Option<u64> {
        Some(*self)
    }
}

impl HistogramKey for String {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortBy {
    /// Most frequent first.
    Value,
    /// In key order.
    Key,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Histogram<K: Ord> {
    counts: BTreeMap<K, u64>,
}

impl<K: Ord> Default for Histogram<K> {
    fn default() -> Self {
        Self { counts: BTreeMap::new() }
    }
}

impl<K: HistogramKey> Histogram<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: K) {
        self.add_n(key, 1);
    }

    pub fn add_n(&mut self, key: K, n: u64) {
        *self.counts.entry(key).or_insert(0) += n;
    }

    pub fn get(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.counts.iter().map(|(k, v)| (k, *v))
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Sum of `key * count` for weighted keys.
    pub fn weighted_total(&self) -> u64 {
        self.counts
            .iter()
            .filter_map(|(k, v)| k.weight().map(|w| w.saturating_mul(*v)))
            .fold(0, u64::saturating_add)
    }

    fn sorted(&self, sort: SortBy) -> Vec<(&K, u64)> {
        let mut items: Vec<_> = self.iter().collect();
        if sort == SortBy::Value {
            // Stable, so equal counts stay in key order.
            items.sort_by(|a, b| b.1.cmp(&a.1));
        }
        items
    }

    /// Draws the histogram. Entries seen fewer than twice, and anything past
    /// `row_limit` rows, are folded into trailing `N x count` lines so a long
    /// tail doesn't scroll the interesting part away.
    pub fn show(
        &self,
        out: &mut dyn Write,
        sort: SortBy,
        multiply: bool,
        row_limit: usize,
    ) -> io::Result<()> {
        if self.is_empty() {
            writeln!(out, "(empty histogram)")?;
            return writeln!(out);
        }
        let maximum = self.counts.values().copied().max().unwrap_or(0);
        let key_width = self
            .counts
            .keys()
            .map(|k| k.to_string().chars().count())
            .max()
            .unwrap_or(0)
            .min(KEY_COLUMN_MAX);
        let count_width = maximum.to_string().len() + 1;

        let mut shown = 0;
        let mut folded: BTreeMap<u64, u64> = BTreeMap::new();
        for (key, count) in self.sorted(sort) {
            if count < 2 || shown >= row_limit {
                *folded.entry(count).or_insert(0) += 1;
                continue;
            }
            shown += 1;
            let bar = format!("[{}", "=".repeat(bar_len(count, maximum)));
            let appendix = match (multiply, key.weight()) {
                (true, Some(w)) => format!("{:>10}", prettify_size(w * count)),
                _ => String::new(),
            };
            let line = format!(
                "{:key_width$} {:bar_width$} {:<count_width$} {}",
                key.to_string(),
                bar,
                count,
                appendix,
                bar_width = PRETTY_WIDTH + 1,
            );
            writeln!(out, "{}", line.trim_end())?;
        }
        for (count, entries) in folded.iter().rev() {
            writeln!(out, "{entries} x {count}")?;
        }
        writeln!(out)
    }

    /// Draws two histograms against each other. The part of each bar both
    /// sides share is drawn with `=`, the rest with `+` where the count grew
    /// and `-` where it shrank.
    pub fn diff(
        before: &Self,
        after: &Self,
        out: &mut dyn Write,
        sort: SortBy,
        multiply: bool,
    ) -> io::Result<()> {
        let mut union: BTreeMap<&K, (u64, u64)> = BTreeMap::new();
        for (k, v) in before.iter() {
            union.entry(k).or_default().0 = v;
        }
        for (k, v) in after.iter() {
            union.entry(k).or_default().1 = v;
        }
        let max_val = union.values().map(|(b, a)| u64::max(*b, *a)).max().unwrap_or(0);
        if max_val == 0 {
            writeln!(out, "(empty histogram)")?;
            return writeln!(out);
        }
        let key_width = union.keys().map(|k| k.to_string().chars().count()).max().unwrap_or(0) + 1;
        let value_width = max_val.to_string().len() + 1;

        let mut items: Vec<_> = union.into_iter().collect();
        if sort == SortBy::Value {
            items.sort_by(|a, b| u64::max(b.1 .0, b.1 .1).cmp(&u64::max(a.1 .0, a.1 .1)));
        }

        for (key, (before, after)) in items {
            let common = u64::min(before, after);
            let excess = u64::max(before, after) - common;
            let glyph = if after >= before { "+" } else { "-" };
            let bar = format!(
                "[{}{}",
                "=".repeat(bar_len(common, max_val)),
                glyph.repeat(bar_len(excess, max_val)),
            );
            let appendix = match (multiply, key.weight()) {
                (true, Some(w)) => format!(
                    "{:>10} -> {:>10}",
                    prettify_size(w * before),
                    prettify_size(w * after),
                ),
                _ => String::new(),
            };
            let line = format!(
                "{:key_width$} {:bar_width$} {:<value_width$} -> {:<value_width$} {}",
                key.to_string(),
                bar,
                before,
                after,
                appendix,
                bar_width = PRETTY_WIDTH + 1,
            );
            writeln!(out, "{}", line.trim_end())?;
        }
        writeln!(out)
    }
}

fn bar_len(count: u64, maximum: u64) -> usize {
    if maximum == 0 {
        return 0;
    }
    (count as f64 / maximum as f64 * PRETTY_WIDTH as f64) as usize
}

/// Sizes are easier to read with separators every three digits.
pub fn prettify_size(num: u64) -> String {
    let digits = num.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(h: &Histogram<u64>, sort: SortBy, multiply: bool) -> String {
        let mut out = vec![];
        h.show(&mut out, sort, multiply, DEFAULT_ROW_LIMIT).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn separators() {
        assert_eq!(prettify_size(0), "0");
        assert_eq!(prettify_size(999), "999");
        assert_eq!(prettify_size(1000), "1.000");
        assert_eq!(prettify_size(1234567), "1.234.567");
    }

    #[test]
    fn empty() {
        let h = Histogram::<u64>::new();
        assert_eq!(render(&h, SortBy::Key, false), "(empty histogram)\n\n");
    }

    #[test]
    fn counts_survive_rendering_and_singletons_are_folded() {
        let mut h = Histogram::new();
        h.add_n(16u64, 40);
        h.add_n(24, 7);
        h.add_n(32, 2);
        h.add_n(48, 1);
        h.add_n(64, 1);
        h.add_n(80, 1);

        let text = render(&h, SortBy::Value, false);
        let mut shown = BTreeMap::new();
        let mut folded_total = 0;
        for line in text.lines().filter(|l| !l.is_empty()) {
            let words: Vec<_> = line.split_whitespace().collect();
            if words.len() == 3 && words[1] == "x" {
                let n: u64 = words[0].parse().unwrap();
                let count: u64 = words[2].parse().unwrap();
                folded_total += n * count;
            } else {
                let key: u64 = words[0].parse().unwrap();
                let count: u64 = words[2].parse().unwrap();
                shown.insert(key, count);
            }
        }

        for (k, v) in h.iter() {
            if v >= 2 {
                assert_eq!(shown.get(k), Some(&v));
            } else {
                assert!(!shown.contains_key(k));
            }
        }
        assert_eq!(folded_total, 3);
        assert!(text.contains("3 x 1"));
    }

    #[test]
    fn bars_scale_to_the_maximum() {
        let mut h = Histogram::new();
        h.add_n(8u64, 10);
        h.add_n(16, 5);
        let text = render(&h, SortBy::Key, false);
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].contains(&format!("[{} ", "=".repeat(50))));
        assert!(lines[1].contains(&format!("[{} ", "=".repeat(25))));
    }

    #[test]
    fn multiply_appends_byte_totals() {
        let mut h = Histogram::new();
        h.add_n(48u64, 100);
        let text = render(&h, SortBy::Key, true);
        assert!(text.lines().next().unwrap().ends_with("4.800"));
        assert_eq!(h.weighted_total(), 4800);
    }

    #[test]
    fn garbage_sizes_saturate_the_byte_total() {
        let mut h = Histogram::new();
        h.add_n(u64::MAX / 2, 3);
        h.add(16u64);
        assert_eq!(h.weighted_total(), u64::MAX);
    }

    #[test]
    fn row_limit_folds_the_rest() {
        let mut h = Histogram::new();
        for k in 0..10u64 {
            h.add_n(k, 5);
        }
        let mut out = vec![];
        h.show(&mut out, SortBy::Key, false, 4).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().filter(|l| l.contains('[')).count(), 4);
        assert!(text.contains("6 x 5"));
    }

    #[test]
    fn value_sort_puts_big_counts_first() {
        let mut h = Histogram::new();
        h.add_n("a".to_string(), 2);
        h.add_n("b".to_string(), 9);
        h.add_n("c".to_string(), 2);
        let mut out = vec![];
        h.show(&mut out, SortBy::Value, true, DEFAULT_ROW_LIMIT).unwrap();
        let text = String::from_utf8(out).unwrap();
        let keys: Vec<_> = text
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn diffs_mark_growth_and_shrinkage() {
        let mut before = Histogram::new();
        let mut after = Histogram::new();
        before.add_n(16u64, 10);
        after.add_n(16u64, 5);
        before.add_n(32u64, 5);
        after.add_n(32u64, 10);
        after.add_n(64u64, 10);

        let mut out = vec![];
        Histogram::diff(&before, &after, &mut out, SortBy::Key, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();

        assert!(lines[0].starts_with("16"));
        assert!(lines[0].contains(&format!("[{}{} ", "=".repeat(25), "-".repeat(25))));
        assert!(lines[0].contains("10  -> 5"));
        assert!(lines[0].ends_with("160 ->         80"));

        assert!(lines[1].contains(&format!("[{}{} ", "=".repeat(25), "+".repeat(25))));
        assert!(lines[2].contains(&format!("[{} ", "+".repeat(50))));
        assert!(lines[2].contains("0   -> 10"));
    }
}
