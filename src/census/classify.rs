//! Figuring out what a single heap object is.

use std::fmt;

use thiserror::Error;

use crate::layout::{HeapModel, ReprField};
use crate::memory::{offset_address, MemoryError};

/// Representation name given to metadata tables, which don't have one of
/// their own.
pub const TABLE_REPR: &str = "STable";

/// Strings longer than this are cut short when decoded.
pub const MAX_GRAPHEMES: u64 = 5000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ObjectKind {
    TypeObject,
    ConcreteObject,
    MetadataTable,
}

/// How much of an array's allocated storage is in use, in steps of ten
/// percent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum UsageBucket {
    Percent(u8),
    /// The numbers made no sense: the array was mid-copy, or isn't really
    /// an array.
    Invalid,
}

impl UsageBucket {
    pub fn of(elems: u64, allocated: u64) -> Self {
        if allocated == 0 {
            return UsageBucket::Invalid;
        }
        let pct = (u128::from(elems) * 10 / u128::from(allocated)) * 10;
        if pct > 100 {
            UsageBucket::Invalid
        } else {
            UsageBucket::Percent(pct as u8)
        }
    }
}

impl fmt::Display for UsageBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageBucket::Percent(p) => f.pad(&p.to_string()),
            UsageBucket::Invalid => f.pad("inv"),
        }
    }
}

impl crate::census::histogram::HistogramKey for UsageBucket {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReprDetail {
    None,
    Opaque,
    Array { storage: String, usage: UsageBucket },
    /// Decoded text, or `mvmstr@0x...` when the content couldn't be decoded.
    String { content: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectRecord {
    pub address: u64,
    pub size: u64,
    pub kind: ObjectKind,
    pub repr_name: String,
    pub debug_name: Option<String>,
    pub detail: ReprDetail,
}

impl ObjectRecord {
    /// The most specific name we have for the object's type.
    pub fn display_name(&self) -> &str {
        self.debug_name.as_deref().unwrap_or(&self.repr_name)
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ClassifyError {
    #[error("could not read the object header at {address:#x}")]
    Header {
        address: u64,
        #[source]
        source: MemoryError,
    },
    #[error("object at {address:#x} claims to be zero bytes long")]
    ZeroSize { address: u64 },
    #[error("could not read the {what} of the {size}-byte object at {address:#x}")]
    Body {
        address: u64,
        size: u64,
        what: &'static str,
        #[source]
        source: MemoryError,
    },
}

impl ClassifyError {
    /// Size of the object, when we got far enough to learn it. Without it a
    /// linear scan can't move on.
    pub fn size(&self) -> Option<u64> {
        match self {
            ClassifyError::Body { size, .. } => Some(*size),
            _ => None,
        }
    }

    pub fn address(&self) -> u64 {
        match self {
            ClassifyError::Header { address, .. }
            | ClassifyError::ZeroSize { address }
            | ClassifyError::Body { address, .. } => *address,
        }
    }
}

/// Classifies the object whose header starts at `address`.
pub fn classify<H: HeapModel + ?Sized>(
    model: &H,
    address: u64,
) -> Result<ObjectRecord, ClassifyError> {
    let header = model
        .read_header(address)
        .map_err(|source| ClassifyError::Header { address, source })?;
    let size = header.size;
    if size == 0 {
        return Err(ClassifyError::ZeroSize { address });
    }
    let body_err = |what| move |source| ClassifyError::Body { address, size, what, source };

    if header.flags.metadata_table {
        return Ok(ObjectRecord {
            address,
            size,
            kind: ObjectKind::MetadataTable,
            repr_name: TABLE_REPR.to_string(),
            debug_name: None,
            detail: ReprDetail::None,
        });
    }

    let table = model
        .read_metadata_table(header.metadata_table)
        .map_err(body_err("metadata table"))?;
    let kind = if header.flags.type_object {
        ObjectKind::TypeObject
    } else {
        ObjectKind::ConcreteObject
    };

    let layout = model.layout();
    // Type objects have no body worth looking at.
    let detail = if kind == ObjectKind::TypeObject {
        ReprDetail::None
    } else if table.repr_name == layout.opaque_repr {
        ReprDetail::Opaque
    } else if table.repr_name == layout.array_repr {
        let slot = model
            .read_field(address, ReprField::ArraySlotType)
            .map_err(body_err("array slot kind"))?;
        let storage = layout
            .array_storage_types
            .get(slot as usize)
            .cloned()
            .unwrap_or_else(|| format!("slot#{slot}"));
        let elems = model
            .read_field(address, ReprField::ArrayElems)
            .map_err(body_err("array element count"))?;
        let allocated = model
            .read_field(address, ReprField::ArrayAllocated)
            .map_err(body_err("array allocation size"))?;
        ReprDetail::Array { storage, usage: UsageBucket::of(elems, allocated) }
    } else if table.repr_name == layout.string_repr {
        let content = match decode_string(model, address) {
            Ok(Some(text)) => text,
            Ok(None) => placeholder(address),
            Err(e) => {
                log::warn!("could not decode string at {address:#x}: {e}");
                placeholder(address)
            }
        };
        ReprDetail::String { content }
    } else {
        ReprDetail::None
    };

    Ok(ObjectRecord {
        address,
        size,
        kind,
        repr_name: table.repr_name,
        debug_name: table.debug_name,
        detail,
    })
}

fn placeholder(address: u64) -> String {
    format!("mvmstr@{address:#x}")
}

/// How a string's graphemes are stored. The low two bits of the storage
/// type select one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum StringStorage {
    Blob32,
    BlobAscii,
    Blob8,
    Strands,
}

impl StringStorage {
    fn from_tag(tag: u64) -> Self {
        match tag & 0b11 {
            0 => StringStorage::Blob32,
            1 => StringStorage::BlobAscii,
            2 => StringStorage::Blob8,
            _ => StringStorage::Strands,
        }
    }

    fn width(self) -> Option<usize> {
        match self {
            StringStorage::Blob32 => Some(4),
            StringStorage::BlobAscii | StringStorage::Blob8 => Some(1),
            StringStorage::Strands => None,
        }
    }
}

/// Best-effort decode of a boxed string. `None` means the storage kind is
/// one we don't know how to flatten (ropes).
pub fn decode_string<H: HeapModel + ?Sized>(
    model: &H,
    address: u64,
) -> Result<Option<String>, MemoryError> {
    let storage = StringStorage::from_tag(model.read_field(address, ReprField::StringStorageType)?);
    let Some(width) = storage.width() else {
        return Ok(None);
    };
    let graphs = model.read_field(address, ReprField::StringGraphs)?;
    let data = model.read_field(address, ReprField::StringStorage)?;
    if data == 0 && graphs != 0 {
        return Err(MemoryError::Null);
    }

    let shown = graphs.min(MAX_GRAPHEMES);
    let mut text = String::new();
    for i in 0..shown {
        let g = model.read_sized(offset_address(data, i * width as u64)?, width)?;
        // Synthetic graphemes are negative and won't map to a char.
        match u32::try_from(g).ok().and_then(char::from_u32) {
            Some(c) => text.push(c),
            None => text.push_str(&format!("\\x{g:x}")),
        }
    }
    if graphs > shown {
        text.push_str(&format!("... (truncated {} graphemes)", graphs - shown));
    }
    Ok(Some(text))
}
