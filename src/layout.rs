//! Where things live inside the inspected VM's heap.
//!
//! The census code never pokes at raw offsets itself. It goes through the
//! [`HeapModel`] capability, and [`LayoutModel`] implements that capability
//! for any [`Memory`] by consulting a declarative [`HeapLayout`]. Layouts
//! are plain TOML so that a differently-configured VM build can be described
//! without recompiling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{offset_address, Memory, MemoryError};

/// A field inside some record: byte offset from the record start plus the
/// width of the integer stored there.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub offset: u64,
    pub width: usize,
}

impl Field {
    pub const fn new(offset: u64, width: usize) -> Self {
        Self { offset, width }
    }
}

/// Offsets and constants describing one build of the VM.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLayout {
    pub pointer_size: usize,

    // Common object header.
    pub header_flags: Field,
    pub header_size: Field,
    /// Offset of the metadata-table pointer in every object.
    pub object_table: u64,
    pub type_object_flag: u64,
    pub metadata_table_flag: u64,

    // Metadata table.
    pub table_repr: u64,
    pub table_repr_data: u64,
    pub table_debug_name: u64,
    /// Offset of the name string pointer inside a representation record.
    pub repr_name: u64,

    // Representation names that get extra treatment.
    pub array_repr: String,
    pub opaque_repr: String,
    pub string_repr: String,

    // Array-like representation.
    pub array_slot_type: Field,
    pub array_elems: Field,
    pub array_allocated: Field,
    /// Names of slot kinds, indexed by the slot-kind tag.
    pub array_storage_types: Vec<String>,

    // Boxed strings.
    pub string_storage: u64,
    pub string_storage_type: Field,
    pub string_graphs: Field,

    // Thread context.
    pub tc_nursery_start: u64,
    pub tc_nursery_cursor: u64,
    pub tc_nursery_end: u64,
    pub tc_instance: u64,
    pub tc_gen2: u64,
    pub instance_gc_seq: Field,

    // Gen2 allocator and its size classes.
    pub gen2_size_classes: u64,
    pub gen2_overflows: u64,
    pub gen2_num_overflows: Field,
    pub size_class_stride: u64,
    pub size_class_pages: u64,
    pub size_class_free_list: u64,
    pub size_class_alloc_pos: u64,
    pub size_class_alloc_limit: u64,
    pub size_class_cur_page: Field,
    pub size_class_num_pages: Field,

    /// Slots per gen2 page. Must be a power of four so pages can be drawn as
    /// square Hilbert mosaics.
    pub page_items: u64,
    pub bin_bits: u32,
    pub bins: u32,
}

impl Default for HeapLayout {
    /// A 64-bit build with the stock gen2 configuration.
    fn default() -> Self {
        Self {
            pointer_size: 8,

            header_flags: Field::new(12, 2),
            header_size: Field::new(14, 2),
            object_table: 16,
            type_object_flag: 1,
            metadata_table_flag: 2,

            table_repr: 16,
            table_repr_data: 24,
            table_debug_name: 112,
            repr_name: 0x120,

            array_repr: "VMArray".into(),
            opaque_repr: "P6opaque".into(),
            string_repr: "MVMString".into(),

            array_slot_type: Field::new(0, 1),
            array_elems: Field::new(24, 8),
            array_allocated: Field::new(40, 8),
            array_storage_types: [
                "obj", "str", "i64", "i32", "i16", "i8", "n64", "n32", "u64", "u32", "u16",
                "u8",
            ]
            .into_iter()
            .map(String::from)
            .collect(),

            string_storage: 24,
            string_storage_type: Field::new(32, 1),
            string_graphs: Field::new(36, 4),

            tc_nursery_start: 0x40,
            tc_nursery_cursor: 0x48,
            tc_nursery_end: 0x50,
            tc_instance: 0x08,
            tc_gen2: 0x60,
            instance_gc_seq: Field::new(0x200, 4),

            gen2_size_classes: 0,
            gen2_overflows: 8,
            gen2_num_overflows: Field::new(16, 4),
            size_class_stride: 40,
            size_class_pages: 0,
            size_class_free_list: 8,
            size_class_alloc_pos: 16,
            size_class_alloc_limit: 24,
            size_class_cur_page: Field::new(32, 4),
            size_class_num_pages: Field::new(36, 4),

            page_items: 256,
            bin_bits: 3,
            bins: 40,
        }
    }
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("could not parse layout as TOML")]
    Toml(#[from] toml::de::Error),
    #[error("could not render layout as TOML")]
    Render(#[from] toml::ser::Error),
    #[error("invalid layout: {0}")]
    Invalid(String),
}

impl HeapLayout {
    /// Parses a layout. Keys left out of the TOML keep their default value.
    pub fn from_toml(text: &str) -> Result<Self, LayoutError> {
        let layout: Self = toml::from_str(text)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn to_toml(&self) -> Result<String, LayoutError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.pointer_size != 4 && self.pointer_size != 8 {
            return Err(LayoutError::Invalid(format!(
                "pointer_size must be 4 or 8, not {}",
                self.pointer_size
            )));
        }
        let side = page_side(self.page_items);
        if side * side != self.page_items || !side.is_power_of_two() {
            return Err(LayoutError::Invalid(format!(
                "page_items must be a power of four, not {}",
                self.page_items
            )));
        }
        if self.bins == 0 {
            return Err(LayoutError::Invalid("bins must be nonzero".into()));
        }
        Ok(())
    }

    /// Byte size of the objects in gen2 bin `bin`.
    pub fn bucket_size(&self, bin: u32) -> u64 {
        u64::from(bin + 1) << self.bin_bits
    }
}

/// Side length of the square a page is drawn as.
pub fn page_side(page_items: u64) -> u64 {
    (page_items as f64).sqrt() as u64
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeaderFlags {
    pub type_object: bool,
    pub metadata_table: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectHeader {
    pub size: u64,
    pub flags: HeaderFlags,
    /// Address of the object's metadata table. Meaningless when the object
    /// is itself a metadata table.
    pub metadata_table: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetadataTable {
    pub repr_name: String,
    pub debug_name: Option<String>,
    pub repr_data: u64,
}

/// Representation-specific fields the classifier knows how to ask for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReprField {
    ArraySlotType,
    ArrayElems,
    ArrayAllocated,
    StringStorageType,
    StringGraphs,
    StringStorage,
}

/// The heap roots hanging off one thread context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThreadHeap {
    pub generation: u64,
    pub nursery_start: u64,
    pub nursery_cursor: u64,
    pub nursery_end: u64,
    pub gen2: u64,
}

/// Raw state of one gen2 size class.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SizeClassState {
    pub pages: u64,
    pub free_list: u64,
    pub alloc_pos: u64,
    pub alloc_limit: u64,
    pub cur_page: u64,
    pub num_pages: u64,
}

/// Everything the census needs to know about the inspected process.
pub trait HeapModel {
    fn layout(&self) -> &HeapLayout;

    fn read_sized(&self, address: u64, width: usize) -> Result<u64, MemoryError>;

    fn read_pointer(&self, address: u64) -> Result<u64, MemoryError> {
        self.read_sized(address, self.layout().pointer_size)
    }

    fn read_header(&self, address: u64) -> Result<ObjectHeader, MemoryError>;

    fn read_metadata_table(&self, table: u64) -> Result<MetadataTable, MemoryError>;

    fn read_field(&self, object: u64, field: ReprField) -> Result<u64, MemoryError>;

    fn read_thread_heap(&self, tc: u64) -> Result<ThreadHeap, MemoryError>;

    fn read_size_class(&self, gen2: u64, bin: u32) -> Result<SizeClassState, MemoryError>;

    /// Addresses of the objects too big for any size class.
    fn read_overflows(&self, gen2: u64) -> Result<Vec<u64>, MemoryError>;
}

/// Sanity cap on the overflow list, so a garbage count doesn't have us
/// reading for hours.
const MAX_OVERFLOWS: u64 = 1 << 20;

/// [`HeapModel`] over raw memory, driven by a [`HeapLayout`].
pub struct LayoutModel<'a, M: ?Sized> {
    memory: &'a M,
    layout: &'a HeapLayout,
}

impl<'a, M: Memory + ?Sized> LayoutModel<'a, M> {
    pub fn new(memory: &'a M, layout: &'a HeapLayout) -> Self {
        Self { memory, layout }
    }

    fn field(&self, base: u64, field: Field) -> Result<u64, MemoryError> {
        self.memory.read_sized(offset_address(base, field.offset)?, field.width)
    }

    /// Reads the pointer stored `offset` bytes into the record at `base`.
    fn pointer_at(&self, base: u64, offset: u64) -> Result<u64, MemoryError> {
        self.read_pointer(offset_address(base, offset)?)
    }

    /// Like `pointer_at`, but a null pointer is an error.
    fn deref(&self, base: u64, offset: u64) -> Result<u64, MemoryError> {
        match self.pointer_at(base, offset)? {
            0 => Err(MemoryError::Null),
            p => Ok(p),
        }
    }
}

impl<M: Memory + ?Sized> HeapModel for LayoutModel<'_, M> {
    fn layout(&self) -> &HeapLayout {
        self.layout
    }

    fn read_sized(&self, address: u64, width: usize) -> Result<u64, MemoryError> {
        self.memory.read_sized(address, width)
    }

    fn read_header(&self, address: u64) -> Result<ObjectHeader, MemoryError> {
        let l = self.layout;
        let size = self.field(address, l.header_size)?;
        let flags = self.field(address, l.header_flags)?;
        let flags = HeaderFlags {
            type_object: flags & l.type_object_flag != 0,
            metadata_table: flags & l.metadata_table_flag != 0,
        };
        let metadata_table = if flags.metadata_table {
            0
        } else {
            self.pointer_at(address, l.object_table)?
        };
        Ok(ObjectHeader { size, flags, metadata_table })
    }

    fn read_metadata_table(&self, table: u64) -> Result<MetadataTable, MemoryError> {
        let l = self.layout;
        let repr = self.deref(table, l.table_repr)?;
        let repr_name = self.memory.read_cstring(self.deref(repr, l.repr_name)?)?;
        // Plenty of tables never get a debug name; an unreadable one is
        // treated the same way.
        let debug_name = self
            .pointer_at(table, l.table_debug_name)
            .and_then(|p| self.memory.read_cstring(p))
            .ok();
        let repr_data = self.pointer_at(table, l.table_repr_data)?;
        Ok(MetadataTable { repr_name, debug_name, repr_data })
    }

    fn read_field(&self, object: u64, field: ReprField) -> Result<u64, MemoryError> {
        let l = self.layout;
        match field {
            ReprField::ArraySlotType => {
                let table = self.deref(object, l.object_table)?;
                let repr_data = self.deref(table, l.table_repr_data)?;
                self.field(repr_data, l.array_slot_type)
            }
            ReprField::ArrayElems => self.field(object, l.array_elems),
            ReprField::ArrayAllocated => self.field(object, l.array_allocated),
            ReprField::StringStorageType => self.field(object, l.string_storage_type),
            ReprField::StringGraphs => self.field(object, l.string_graphs),
            ReprField::StringStorage => self.pointer_at(object, l.string_storage),
        }
    }

    fn read_thread_heap(&self, tc: u64) -> Result<ThreadHeap, MemoryError> {
        let l = self.layout;
        let instance = self.deref(tc, l.tc_instance)?;
        Ok(ThreadHeap {
            generation: self.field(instance, l.instance_gc_seq)?,
            nursery_start: self.pointer_at(tc, l.tc_nursery_start)?,
            nursery_cursor: self.pointer_at(tc, l.tc_nursery_cursor)?,
            nursery_end: self.pointer_at(tc, l.tc_nursery_end)?,
            gen2: self.pointer_at(tc, l.tc_gen2)?,
        })
    }

    fn read_size_class(&self, gen2: u64, bin: u32) -> Result<SizeClassState, MemoryError> {
        let l = self.layout;
        let classes = self.deref(gen2, l.gen2_size_classes)?;
        let stride = u64::from(bin).saturating_mul(l.size_class_stride);
        let base = offset_address(classes, stride)?;
        Ok(SizeClassState {
            pages: self.pointer_at(base, l.size_class_pages)?,
            free_list: self.pointer_at(base, l.size_class_free_list)?,
            alloc_pos: self.pointer_at(base, l.size_class_alloc_pos)?,
            alloc_limit: self.pointer_at(base, l.size_class_alloc_limit)?,
            cur_page: self.field(base, l.size_class_cur_page)?,
            num_pages: self.field(base, l.size_class_num_pages)?,
        })
    }

    fn read_overflows(&self, gen2: u64) -> Result<Vec<u64>, MemoryError> {
        let l = self.layout;
        let count = self.field(gen2, l.gen2_num_overflows)?.min(MAX_OVERFLOWS);
        if count == 0 {
            return Ok(vec![]);
        }
        let list = self.deref(gen2, l.gen2_overflows)?;
        (0..count)
            .map(|i| self.pointer_at(list, i * l.pointer_size as u64))
            .collect()
    }
}
