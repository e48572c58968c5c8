//! Memory snapshots: zip archives of memory segments, plus the symbols and
//! heap layout needed to make sense of them.
//!
//! The archive comment identifies the format (`gcdbg snapshot v1`). Members:
//!
//! - `seg/<hexaddr>@<hexorder>.bin`: bytes loaded at `hexaddr`. Where
//!   segments overlap, the one with the higher order wins.
//! - `symbols.toml`: optional table of name to address.
//! - `layout.toml`: optional [`HeapLayout`] of the process.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::ops::RangeInclusive;

use regex::Regex;
use thiserror::Error;
use zip::write::FileOptions;
use zip::ZipArchive;

use crate::layout::{HeapLayout, LayoutError};
use crate::memory::Segments;

pub const FORMAT_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("this file is a ZIP file, but is not a snapshot")]
    NotASnapshot,
    #[error("snapshot is format version {0}, which we don't understand")]
    UnsupportedVersion(u64),
    #[error("ZIP file access or format error")]
    Zip(#[from] zip::result::ZipError),
    #[error("could not load {0} as UTF-8")]
    Utf8(String, #[source] std::str::Utf8Error),
    #[error("could not parse symbol file as TOML")]
    SymbolToml(#[source] toml::de::Error),
    #[error("could not render symbol file as TOML")]
    SymbolRender(#[source] toml::ser::Error),
    #[error("bad heap layout in snapshot")]
    Layout(#[from] LayoutError),
    #[error("problem accessing file within ZIP archive")]
    Io(#[from] std::io::Error),
}

/// Where one segment of a snapshot came from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SegmentInfo {
    pub range: RangeInclusive<u64>,
    pub order: u64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub format_version: u64,
    pub memory: Segments,
    /// Segment files in the order they were loaded.
    pub segments: Vec<SegmentInfo>,
    pub symbols: BTreeMap<String, u64>,
    pub layout: Option<HeapLayout>,
}

pub fn load_snapshot<F: Read + Seek>(source: F) -> Result<Snapshot, SnapshotError> {
    let segname = Regex::new(r#"^([0-9a-fA-F]+)@([0-9a-fA-F]+)\.bin$"#).unwrap();
    let comment_pattern = Regex::new(r#"^gcdbg snapshot v([0-9]+)$"#).unwrap();
    let mut archive = ZipArchive::new(source)?;
    let comment = std::str::from_utf8(archive.comment())
        .map_err(|_| SnapshotError::NotASnapshot)?;
    let comment_parts = comment_pattern.captures(comment)
        .ok_or(SnapshotError::NotASnapshot)?;

    let format_version = comment_parts[1].parse::<u64>()
        .map_err(|_| SnapshotError::NotASnapshot)?;
    if format_version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(format_version));
    }

    let mut segment_files = vec![];
    let mut symbols = BTreeMap::new();
    let mut layout = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        if let Some(rest) = name.strip_prefix("seg/") {
            let Some(c) = segname.captures(rest) else {
                log::warn!("ignoring oddly named segment file {name}");
                continue;
            };
            let (Ok(address), Ok(order)) =
                (u64::from_str_radix(&c[1], 16), u64::from_str_radix(&c[2], 16))
            else {
                log::warn!("ignoring segment file {name}: address out of range");
                continue;
            };
            if file.size() == 0 {
                continue;
            }
            let mut data = vec![];
            file.read_to_end(&mut data)?;
            segment_files.push((address, order, i, name, data));
        } else if name == "symbols.toml" {
            let text = read_text(&mut file, &name)?;
            symbols = toml::from_str(&text).map_err(SnapshotError::SymbolToml)?;
        } else if name == "layout.toml" {
            let text = read_text(&mut file, &name)?;
            layout = Some(HeapLayout::from_toml(&text)?);
        }
    }

    // Inserting in order of increasing `order` lets the higher one win.
    segment_files.sort_unstable_by_key(|(address, order, index, ..)| (*order, *address, *index));

    let mut memory = Segments::new();
    let mut segments = vec![];
    for (address, order, _, name, data) in segment_files {
        let end = address.wrapping_add(data.len() as u64 - 1);
        if let Err(e) = memory.insert(address, data) {
            log::warn!("ignoring segment file {name}: {e}");
            continue;
        }
        segments.push(SegmentInfo { range: address..=end, order, name });
    }
    log::debug!("loaded {} segments, {} bytes", segments.len(), memory.total_bytes());

    Ok(Snapshot { format_version, memory, segments, symbols, layout })
}

fn read_text(file: &mut impl Read, name: &str) -> Result<String, SnapshotError> {
    let mut contents = vec![];
    file.read_to_end(&mut contents)?;
    String::from_utf8(contents)
        .map_err(|e| SnapshotError::Utf8(name.to_string(), e.utf8_error()))
}

/// Writes the visible contents of `memory` as a snapshot. Each visible
/// piece becomes its own segment file, so nothing shadowed is saved.
pub fn save_snapshot<W: Write + Seek>(
    sink: W,
    memory: &Segments,
    symbols: &BTreeMap<String, u64>,
    layout: Option<&HeapLayout>,
) -> Result<W, SnapshotError> {
    let mut zip = zip::ZipWriter::new(sink);
    zip.set_comment(format!("gcdbg snapshot v{FORMAT_VERSION}"));
    let options = FileOptions::default();

    for (range, seg) in memory.ranges() {
        let offset = (range.start() - seg.base) as usize;
        let len = (range.end() - range.start() + 1) as usize;
        zip.start_file(format!("seg/{:x}@0.bin", range.start()), options)?;
        zip.write_all(&seg.data[offset..offset + len])?;
    }
    if !symbols.is_empty() {
        zip.start_file("symbols.toml", options)?;
        let text = toml::to_string(symbols).map_err(SnapshotError::SymbolRender)?;
        zip.write_all(text.as_bytes())?;
    }
    if let Some(layout) = layout {
        zip.start_file("layout.toml", options)?;
        zip.write_all(layout.to_toml()?.as_bytes())?;
    }
    Ok(zip.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use std::io::Cursor;

    fn archive(comment: &str, files: &[(&str, &[u8])]) -> Cursor<Vec<u8>> {
        let mut zip = zip::ZipWriter::new(Cursor::new(vec![]));
        zip.set_comment(comment);
        for (name, data) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn loads_segments_with_shadowing() {
        let z = archive(
            "gcdbg snapshot v1",
            &[
                ("seg/1000@1.bin", &[9, 9]),
                ("seg/1000@0.bin", &[1, 2, 3, 4]),
                ("seg/2000@0.bin", &[5]),
                ("symbols.toml", b"tc = 0x1000\n"),
            ],
        );
        let s = load_snapshot(z).unwrap();
        assert_eq!(s.format_version, 1);
        let mut buf = [0; 4];
        s.memory.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 3, 4]);
        assert_eq!(s.memory.read_u8(0x2000).unwrap(), 5);
        assert!(s.memory.read_u8(0x1004).is_err());
        assert_eq!(s.symbols.get("tc"), Some(&0x1000));
        assert!(s.layout.is_none());
        assert_eq!(s.segments.len(), 3);
        assert_eq!(s.segments[2].name, "seg/1000@1.bin");
    }

    #[test]
    fn rejects_other_archives() {
        let z = archive("something else", &[]);
        assert!(matches!(load_snapshot(z), Err(SnapshotError::NotASnapshot)));
        let z = archive("gcdbg snapshot v7", &[]);
        assert!(matches!(load_snapshot(z), Err(SnapshotError::UnsupportedVersion(7))));
    }

    #[test]
    fn bad_layouts_are_reported() {
        let z = archive("gcdbg snapshot v1", &[("layout.toml", b"pointer_size = 3\n")]);
        assert!(matches!(load_snapshot(z), Err(SnapshotError::Layout(_))));
    }

    #[test]
    fn segments_past_the_address_space_are_skipped() {
        let z = archive(
            "gcdbg snapshot v1",
            &[("seg/ffffffffffffffff@0.bin", &[1, 2]), ("seg/1000@0.bin", &[3])],
        );
        let s = load_snapshot(z).unwrap();
        assert_eq!(s.segments.len(), 1);
        assert_eq!(s.memory.read_u8(0x1000).unwrap(), 3);
        assert!(s.memory.read_u8(u64::MAX).is_err());
    }

    #[test]
    fn saved_snapshots_load_back() {
        let mut memory = Segments::new();
        memory.insert(0x1000, vec![1, 2, 3, 4]).unwrap();
        memory.insert(0x1002, vec![7]).unwrap();
        let symbols = BTreeMap::from([("tc".to_string(), 0x1000)]);
        let layout = HeapLayout::default();

        let mut cursor = save_snapshot(Cursor::new(vec![]), &memory, &symbols, Some(&layout)).unwrap();
        cursor.set_position(0);
        let s = load_snapshot(cursor).unwrap();
        let mut buf = [0; 4];
        s.memory.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 7, 4]);
        assert_eq!(s.symbols, symbols);
        assert_eq!(s.layout, Some(layout));
    }
}
