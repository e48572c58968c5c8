use std::io::{self, Write};

use crate::census::classify::{ObjectKind, ObjectRecord, ReprDetail, UsageBucket};
use crate::census::histogram::{Histogram, SortBy};

/// Counters and histograms accumulated over a set of classified objects.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub objects: u64,
    pub type_objects: u64,
    pub metadata_tables: u64,
    pub sizes: Histogram<u64>,
    pub opaque_sizes: Histogram<u64>,
    pub names: Histogram<String>,
    pub array_storage: Histogram<String>,
    pub array_usage: Histogram<UsageBucket>,
    pub strings: Histogram<String>,
}

impl HeapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rec: &ObjectRecord) {
        match rec.kind {
            ObjectKind::TypeObject => self.type_objects += 1,
            ObjectKind::ConcreteObject => self.objects += 1,
            ObjectKind::MetadataTable => self.metadata_tables += 1,
        }
        self.sizes.add(rec.size);
        self.names.add(rec.display_name().to_string());
        match &rec.detail {
            ReprDetail::None => (),
            ReprDetail::Opaque => self.opaque_sizes.add(rec.size),
            ReprDetail::Array { storage, usage } => {
                self.array_storage.add(storage.clone());
                self.array_usage.add(*usage);
            }
            ReprDetail::String { content } => self.strings.add(content.clone()),
        }
    }

    /// Everything we classified.
    pub fn total(&self) -> u64 {
        self.objects + self.type_objects + self.metadata_tables
    }

    pub fn bytes(&self) -> u64 {
        self.sizes.weighted_total()
    }

    pub fn render_counts(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "{} objects; {} type objects; {} STables",
            self.objects, self.type_objects, self.metadata_tables,
        )
    }

    /// Writes every histogram, each under its own heading.
    pub fn render(&self, out: &mut dyn Write, row_limit: usize) -> io::Result<()> {
        writeln!(out, "sizes of objects/stables:")?;
        self.sizes.show(out, SortBy::Key, true, row_limit)?;
        writeln!(out, "sizes of P6opaques only:")?;
        self.opaque_sizes.show(out, SortBy::Key, true, row_limit)?;
        writeln!(out, "debugnames:")?;
        self.names.show(out, SortBy::Value, false, row_limit)?;
        writeln!(out, "VMArray storage types:")?;
        self.array_storage.show(out, SortBy::Value, false, row_limit)?;
        writeln!(out, "VMArray usage percentages:")?;
        self.array_usage.show(out, SortBy::Key, false, row_limit)?;
        writeln!(out, "strings:")?;
        self.strings.show(out, SortBy::Value, false, row_limit)
    }

    /// Histogram diffs from `before` to `after`. Strings are left out; the
    /// interesting ones rarely survive a collection.
    pub fn render_diff(before: &Self, after: &Self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "sizes of objects/stables:")?;
        Histogram::diff(&before.sizes, &after.sizes, out, SortBy::Key, true)?;
        writeln!(out, "sizes of P6opaques only:")?;
        Histogram::diff(&before.opaque_sizes, &after.opaque_sizes, out, SortBy::Key, true)?;
        writeln!(out, "debugnames:")?;
        Histogram::diff(&before.names, &after.names, out, SortBy::Value, false)?;
        writeln!(out, "VMArray storage types:")?;
        Histogram::diff(&before.array_storage, &after.array_storage, out, SortBy::Value, false)?;
        writeln!(out, "VMArray usage percentages:")?;
        Histogram::diff(&before.array_usage, &after.array_usage, out, SortBy::Key, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::histogram::DEFAULT_ROW_LIMIT;

    fn rec(size: u64, kind: ObjectKind, name: &str, detail: ReprDetail) -> ObjectRecord {
        ObjectRecord {
            address: 0x1000,
            size,
            kind,
            repr_name: name.into(),
            debug_name: None,
            detail,
        }
    }

    #[test]
    fn records_land_in_the_right_histograms() {
        let mut s = HeapStats::new();
        s.record(&rec(48, ObjectKind::ConcreteObject, "P6opaque", ReprDetail::Opaque));
        s.record(&rec(48, ObjectKind::ConcreteObject, "P6opaque", ReprDetail::Opaque));
        s.record(&rec(
            64,
            ObjectKind::ConcreteObject,
            "VMArray",
            ReprDetail::Array { storage: "obj".into(), usage: UsageBucket::Percent(50) },
        ));
        s.record(&rec(
            40,
            ObjectKind::ConcreteObject,
            "MVMString",
            ReprDetail::String { content: "hi".into() },
        ));
        s.record(&rec(24, ObjectKind::TypeObject, "P6opaque", ReprDetail::None));
        s.record(&rec(128, ObjectKind::MetadataTable, "STable", ReprDetail::None));

        assert_eq!((s.objects, s.type_objects, s.metadata_tables), (4, 1, 1));
        assert_eq!(s.total(), 6);
        assert_eq!(s.bytes(), 48 * 2 + 64 + 40 + 24 + 128);
        assert_eq!(s.opaque_sizes.get(&48), 2);
        assert_eq!(s.opaque_sizes.len(), 1);
        assert_eq!(s.names.get(&"P6opaque".to_string()), 3);
        assert_eq!(s.array_storage.get(&"obj".to_string()), 1);
        assert_eq!(s.array_usage.get(&UsageBucket::Percent(50)), 1);
        assert_eq!(s.strings.get(&"hi".to_string()), 1);
    }

    #[test]
    fn rendering_has_every_section() {
        let mut s = HeapStats::new();
        s.record(&rec(48, ObjectKind::ConcreteObject, "P6opaque", ReprDetail::Opaque));
        let mut out = vec![];
        s.render_counts(&mut out).unwrap();
        s.render(&mut out, DEFAULT_ROW_LIMIT).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("1 objects; 0 type objects; 0 STables\n"));
        for heading in ["sizes of objects/stables:", "debugnames:", "strings:"] {
            assert!(text.contains(heading), "missing {heading}");
        }

        let mut out = vec![];
        HeapStats::render_diff(&HeapStats::new(), &s, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("VMArray usage percentages:"));
        assert!(!text.contains("strings:"));
    }
}
