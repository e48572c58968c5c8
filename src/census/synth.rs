//! Fake heaps for exercising the census without a real process.
//!
//! `SyntheticHeap` lays objects, metadata tables, thread contexts and gen2
//! size classes out in a [`Segments`] the way a [`HeapLayout`] says the VM
//! would. Auxiliary records (tables, representation records, string
//! storage, page lists) are bump-allocated from a region well away from
//! where callers put their objects.

use crate::layout::HeapLayout;
use crate::memory::Segments;

const AUX_BASE: u64 = 0x7000_0000;

pub struct SyntheticHeap<'a> {
    layout: &'a HeapLayout,
    segments: Segments,
    next_aux: u64,
}

/// Desired state of one gen2 size class.
#[derive(Clone, Debug, Default)]
pub struct SizeClassSpec {
    pub pages: Vec<u64>,
    pub cur_page: u64,
    /// Address of the next slot the allocator would hand out.
    pub alloc_pos: u64,
    pub alloc_limit: u64,
    pub free_list: u64,
}

impl<'a> SyntheticHeap<'a> {
    pub fn new(layout: &'a HeapLayout) -> Self {
        Self { layout, segments: Segments::new(), next_aux: AUX_BASE }
    }

    pub fn layout(&self) -> &HeapLayout {
        self.layout
    }

    /// The memory built so far.
    pub fn segments(&self) -> Segments {
        self.segments.clone()
    }

    pub fn into_segments(self) -> Segments {
        self.segments
    }

    /// Maps `len` zero bytes at `base`, shadowing whatever was there.
    pub fn zero(&mut self, base: u64, len: u64) {
        self.map(base, vec![0; len as usize]);
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        self.map(address, bytes.to_vec());
    }

    fn map(&mut self, address: u64, bytes: Vec<u8>) {
        if let Err(e) = self.segments.insert(address, bytes) {
            log::warn!("synthetic heap: skipping write at {address:#x}: {e}");
        }
    }

    pub fn write_sized(&mut self, address: u64, width: usize, value: u64) {
        self.write(address, &value.to_le_bytes()[..width]);
    }

    pub fn write_pointer(&mut self, address: u64, value: u64) {
        self.write_sized(address, self.layout.pointer_size, value);
    }

    /// Reserves `len` zeroed bytes in the auxiliary region.
    pub fn alloc(&mut self, len: u64) -> u64 {
        let address = self.next_aux;
        let len = len.max(1);
        self.zero(address, len);
        self.next_aux = (address + len + 15) & !15;
        address
    }

    pub fn cstring(&mut self, text: &str) -> u64 {
        let address = self.alloc(text.len() as u64 + 1);
        self.write(address, text.as_bytes());
        address
    }

    /// A representation record carrying `name`.
    pub fn repr(&mut self, name: &str) -> u64 {
        let l = self.layout;
        let repr = self.alloc(l.repr_name + l.pointer_size as u64);
        let name = self.cstring(name);
        self.write_pointer(repr + l.repr_name, name);
        repr
    }

    /// A metadata table for representation `repr_name`. Its repr data is a
    /// zeroed scratch record.
    pub fn table(&mut self, repr_name: &str, debug_name: Option<&str>) -> u64 {
        let l = self.layout;
        let len = [l.table_repr, l.table_repr_data, l.table_debug_name]
            .into_iter()
            .max()
            .unwrap_or(0)
            + l.pointer_size as u64;
        let table = self.alloc(len);
        let repr = self.repr(repr_name);
        self.write_pointer(table + l.table_repr, repr);
        let repr_data = self.alloc(64);
        self.write_pointer(table + l.table_repr_data, repr_data);
        if let Some(name) = debug_name {
            let name = self.cstring(name);
            self.write_pointer(table + l.table_debug_name, name);
        }
        table
    }

    /// A metadata table for arrays whose slots have kind `slot_type`.
    pub fn array_table(&mut self, slot_type: u64, debug_name: Option<&str>) -> u64 {
        let l = self.layout;
        let repr_name = l.array_repr.clone();
        let table = self.table(&repr_name, debug_name);
        let repr_data = self.read_back_pointer(table + l.table_repr_data);
        let field = l.array_slot_type;
        self.write_sized(repr_data + field.offset, field.width, slot_type);
        table
    }

    fn read_back_pointer(&self, address: u64) -> u64 {
        use crate::memory::Memory;
        // Only ever called on addresses this builder just wrote.
        self.segments.read_sized(address, self.layout.pointer_size).unwrap_or(0)
    }

    pub fn raw_header(&mut self, address: u64, size: u64, flags: u64, table: u64) {
        let l = self.layout;
        self.write_sized(address + l.header_size.offset, l.header_size.width, size);
        self.write_sized(address + l.header_flags.offset, l.header_flags.width, flags);
        self.write_pointer(address + l.object_table, table);
    }

    pub fn object(&mut self, address: u64, size: u64, table: u64) {
        self.raw_header(address, size, 0, table);
    }

    pub fn type_object(&mut self, address: u64, size: u64, table: u64) {
        self.raw_header(address, size, self.layout.type_object_flag, table);
    }

    /// An object that is itself a metadata table.
    pub fn metadata_table_object(&mut self, address: u64, size: u64) {
        self.raw_header(address, size, self.layout.metadata_table_flag, 0);
    }

    pub fn array(&mut self, address: u64, size: u64, table: u64, elems: u64, allocated: u64) {
        let l = self.layout;
        self.object(address, size, table);
        self.write_sized(address + l.array_elems.offset, l.array_elems.width, elems);
        self.write_sized(address + l.array_allocated.offset, l.array_allocated.width, allocated);
    }

    /// A string whose storage holds `data`, `width` bytes per grapheme.
    pub fn string(
        &mut self,
        address: u64,
        size: u64,
        table: u64,
        storage_type: u64,
        data: &[u8],
        width: u64,
    ) {
        let storage = if data.is_empty() {
            0
        } else {
            let storage = self.alloc(data.len() as u64);
            self.write(storage, data);
            storage
        };
        self.string_at(address, size, table, storage_type, storage, data.len() as u64 / width);
    }

    /// A string with explicit storage pointer and grapheme count.
    pub fn string_at(
        &mut self,
        address: u64,
        size: u64,
        table: u64,
        storage_type: u64,
        storage: u64,
        graphs: u64,
    ) {
        let l = self.layout;
        self.object(address, size, table);
        self.write_pointer(address + l.string_storage, storage);
        let f = l.string_storage_type;
        self.write_sized(address + f.offset, f.width, storage_type);
        let f = l.string_graphs;
        self.write_sized(address + f.offset, f.width, graphs);
    }

    /// A thread context at `tc` whose instance reports GC sequence number
    /// `generation`.
    pub fn thread(
        &mut self,
        tc: u64,
        generation: u64,
        nursery: (u64, u64, u64),
        gen2: u64,
    ) {
        let l = self.layout;
        let instance = self.alloc(l.instance_gc_seq.offset + 8);
        self.write_sized(
            instance + l.instance_gc_seq.offset,
            l.instance_gc_seq.width,
            generation,
        );
        self.write_pointer(tc + l.tc_instance, instance);
        let (start, cursor, end) = nursery;
        self.write_pointer(tc + l.tc_nursery_start, start);
        self.write_pointer(tc + l.tc_nursery_cursor, cursor);
        self.write_pointer(tc + l.tc_nursery_end, end);
        self.write_pointer(tc + l.tc_gen2, gen2);
    }

    /// A gen2 allocator with every size class empty and no overflows.
    /// Returns its address.
    pub fn gen2(&mut self) -> u64 {
        let l = self.layout;
        let gen2 = self.alloc(64);
        let classes = self.alloc(u64::from(l.bins) * l.size_class_stride);
        self.write_pointer(gen2 + l.gen2_size_classes, classes);
        gen2
    }

    /// A zeroed page for size class `bin`.
    pub fn page(&mut self, bin: u32) -> u64 {
        let len = self.layout.bucket_size(bin) * self.layout.page_items;
        self.alloc(len)
    }

    pub fn size_class(&mut self, gen2: u64, bin: u32, spec: &SizeClassSpec) {
        let l = self.layout;
        let classes = self.read_back_pointer(gen2 + l.gen2_size_classes);
        let base = classes + u64::from(bin) * l.size_class_stride;
        let pages = if spec.pages.is_empty() {
            0
        } else {
            let list = self.alloc(spec.pages.len() as u64 * l.pointer_size as u64);
            for (i, page) in spec.pages.iter().enumerate() {
                self.write_pointer(list + i as u64 * l.pointer_size as u64, *page);
            }
            list
        };
        self.write_pointer(base + l.size_class_pages, pages);
        self.write_pointer(base + l.size_class_free_list, spec.free_list);
        self.write_pointer(base + l.size_class_alloc_pos, spec.alloc_pos);
        self.write_pointer(base + l.size_class_alloc_limit, spec.alloc_limit);
        let f = l.size_class_cur_page;
        self.write_sized(base + f.offset, f.width, spec.cur_page);
        let f = l.size_class_num_pages;
        self.write_sized(base + f.offset, f.width, spec.pages.len() as u64);
    }

    /// Threads a free list through `slots`, in order. Returns the head.
    pub fn free_list(&mut self, slots: &[u64]) -> u64 {
        for pair in slots.windows(2) {
            self.write_pointer(pair[0], pair[1]);
        }
        if let Some(last) = slots.last() {
            self.write_pointer(*last, 0);
        }
        slots.first().copied().unwrap_or(0)
    }

    pub fn overflows(&mut self, gen2: u64, objects: &[u64]) {
        let l = self.layout;
        let list = self.alloc(objects.len() as u64 * l.pointer_size as u64);
        for (i, obj) in objects.iter().enumerate() {
            self.write_pointer(list + i as u64 * l.pointer_size as u64, *obj);
        }
        self.write_pointer(gen2 + l.gen2_overflows, list);
        let f = l.gen2_num_overflows;
        self.write_sized(gen2 + f.offset, f.width, objects.len() as u64);
    }
}
