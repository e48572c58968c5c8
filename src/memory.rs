use std::ops::RangeInclusive;

use rangemap::RangeInclusiveMap;
use thiserror::Error;

/// Longest C string we're willing to chase before giving up on finding the
/// terminator.
pub const CSTRING_LIMIT: usize = 4096;

/// Byte-level access to the memory of the process being inspected.
pub trait Memory {
    /// Fills `dest` with the bytes starting at `address`. Either the whole
    /// buffer is filled or an error is returned.
    fn read(&self, address: u64, dest: &mut [u8]) -> Result<(), MemoryError>;

    /// Reads a little-endian unsigned integer of `width` bytes.
    fn read_sized(&self, address: u64, width: usize) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        match width {
            1 | 2 | 4 | 8 => (),
            _ => return Err(MemoryError::BadWidth(width)),
        }
        self.read(address, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        Ok(self.read_sized(address, 1)? as u8)
    }

    fn read_u16(&self, address: u64) -> Result<u16, MemoryError> {
        Ok(self.read_sized(address, 2)? as u16)
    }

    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        Ok(self.read_sized(address, 4)? as u32)
    }

    fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        self.read_sized(address, 8)
    }

    /// Reads a NUL-terminated string. Bytes that aren't UTF-8 are replaced
    /// rather than rejected, since names in a damaged heap are still useful
    /// half-readable.
    fn read_cstring(&self, address: u64) -> Result<String, MemoryError> {
        if address == 0 {
            return Err(MemoryError::Null);
        }
        let mut bytes = vec![];
        let mut cursor = address;
        loop {
            let b = self.read_u8(cursor)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
            if bytes.len() >= CSTRING_LIMIT {
                return Err(MemoryError::Unterminated { address });
            }
            cursor = offset_address(cursor, 1)?;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("address {address:#x} is not backed by any loaded segment")]
    Unmapped { address: u64 },
    #[error("attempted to dereference a null pointer")]
    Null,
    #[error("no NUL terminator within 4096 bytes of {address:#x}")]
    Unterminated { address: u64 },
    #[error("can't read a {0}-byte integer")]
    BadWidth(usize),
    #[error("{base:#x} + {offset:#x} runs off the end of the address space")]
    AddressOverflow { base: u64, offset: u64 },
}

/// `base + offset`, for addresses that came out of the inspected memory and
/// so can be any garbage at all.
pub fn offset_address(base: u64, offset: u64) -> Result<u64, MemoryError> {
    base.checked_add(offset)
        .ok_or(MemoryError::AddressOverflow { base, offset })
}

/// One contiguous chunk of loaded memory. Keeps its original base so that
/// a segment partially shadowed by a later insert can still compute offsets
/// into its own data.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub base: u64,
    pub data: Vec<u8>,
}

/// All the memory we know about, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct Segments {
    map: RangeInclusiveMap<u64, Segment>,
}

impl Segments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `data` at `base`. Anything previously loaded in the same range
    /// is shadowed. Empty data is ignored. Data that would run past the top
    /// of the address space is refused and nothing is loaded.
    pub fn insert(&mut self, base: u64, data: Vec<u8>) -> Result<(), MemoryError> {
        let Some(len_m1) = (data.len() as u64).checked_sub(1) else {
            return Ok(());
        };
        let end = offset_address(base, len_m1)?;
        self.map.insert(base..=end, Segment { base, data });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.map.iter().next().is_none()
    }

    /// Iterates over the visible pieces of memory. A shadowed segment shows
    /// up as the fragments that are still visible.
    pub fn ranges(&self) -> impl Iterator<Item = (RangeInclusive<u64>, &Segment)> {
        self.map.iter().map(|(r, s)| (r.clone(), s))
    }

    /// Total number of visible bytes.
    pub fn total_bytes(&self) -> u64 {
        self.map.iter().map(|(r, _)| r.end() - r.start() + 1).sum()
    }
}

impl Memory for Segments {
    fn read(&self, address: u64, dest: &mut [u8]) -> Result<(), MemoryError> {
        let mut address = address;
        let mut dest = dest;
        while !dest.is_empty() {
            let Some((range, seg)) = self.map.get_key_value(&address) else {
                return Err(MemoryError::Unmapped { address });
            };
            // The visible range may be a fragment of the segment, so the
            // offset is computed against the segment's own base.
            let seg_offset = (address - seg.base) as usize;
            let available = usize::try_from(range.end() - address + 1).unwrap_or(usize::MAX);
            let chunk_len = usize::min(available, dest.len());
            let (next, rest) = dest.split_at_mut(chunk_len);
            next.copy_from_slice(&seg.data[seg_offset..seg_offset + chunk_len]);
            dest = rest;
            if dest.is_empty() {
                break;
            }
            address = offset_address(address, chunk_len as u64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_within_a_segment() {
        let mut s = Segments::new();
        s.insert(0x1000, vec![0x78, 0x56, 0x34, 0x12, 0xff]).unwrap();
        assert_eq!(s.read_u32(0x1000).unwrap(), 0x1234_5678);
        assert_eq!(s.read_u8(0x1004).unwrap(), 0xff);
        assert_eq!(s.read_u16(0x1001).unwrap(), 0x3456);
    }

    #[test]
    fn reads_span_adjacent_segments() {
        let mut s = Segments::new();
        s.insert(0x1000, vec![1, 2]).unwrap();
        s.insert(0x1002, vec![3, 4]).unwrap();
        let mut buf = [0; 4];
        s.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn gaps_are_reported() {
        let mut s = Segments::new();
        s.insert(0x1000, vec![1, 2]).unwrap();
        s.insert(0x1004, vec![3, 4]).unwrap();
        let mut buf = [0; 6];
        assert_eq!(
            s.read(0x1000, &mut buf),
            Err(MemoryError::Unmapped { address: 0x1002 }),
        );
        assert_eq!(s.read_u8(0x0fff), Err(MemoryError::Unmapped { address: 0x0fff }));
    }

    #[test]
    fn later_inserts_shadow_earlier_ones() {
        let mut s = Segments::new();
        s.insert(0x1000, vec![0; 8]).unwrap();
        s.insert(0x1002, vec![0xaa, 0xbb]).unwrap();
        let mut buf = [0; 8];
        s.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0xaa, 0xbb, 0, 0, 0, 0]);
        assert_eq!(s.total_bytes(), 8);
    }

    #[test]
    fn cstrings() {
        let mut s = Segments::new();
        s.insert(0x2000, b"VMArray\0junk".to_vec()).unwrap();
        assert_eq!(s.read_cstring(0x2000).unwrap(), "VMArray");
        assert_eq!(s.read_cstring(0), Err(MemoryError::Null));

        s.insert(0x3000, vec![b'a'; CSTRING_LIMIT + 1]).unwrap();
        assert_eq!(
            s.read_cstring(0x3000),
            Err(MemoryError::Unterminated { address: 0x3000 }),
        );
    }

    #[test]
    fn the_top_of_the_address_space() {
        let mut s = Segments::new();
        assert_eq!(
            s.insert(u64::MAX, vec![1, 2]),
            Err(MemoryError::AddressOverflow { base: u64::MAX, offset: 1 }),
        );
        assert!(s.is_empty());

        s.insert(u64::MAX - 1, vec![b'h', b'i']).unwrap();
        assert_eq!(s.read_u16(u64::MAX - 1).unwrap(), u16::from_le_bytes([b'h', b'i']));
        assert_eq!(s.read_u8(u64::MAX).unwrap(), b'i');
        assert_eq!(
            s.read_u32(u64::MAX - 1),
            Err(MemoryError::AddressOverflow { base: u64::MAX - 1, offset: 2 }),
        );
        assert_eq!(
            s.read_cstring(u64::MAX - 1),
            Err(MemoryError::AddressOverflow { base: u64::MAX, offset: 1 }),
        );
        assert_eq!(offset_address(0x1000, 8), Ok(0x1008));
    }

    #[test]
    fn odd_widths_are_rejected() {
        let s = Segments::new();
        assert_eq!(s.read_sized(0, 3), Err(MemoryError::BadWidth(3)));
    }
}
