//! Memory tags classify allocations for usage accounting.

use std::fmt;

/// The subsystem that owns an allocation.
///
/// Tags are accounting labels only: per-tag counters feed the memory-usage
/// breakdown, but no buffer-management decision (eviction order, spill
/// policy) depends on them.
///
/// Uses `#[repr(u8)]` so a tag doubles as a dense index into atomic counter
/// arrays.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTag {
    /// Cached base-table data.
    BaseTable = 0,
    /// Hash-join and aggregate hash tables.
    HashTable = 1,
    /// Sort buffers.
    OrderBy = 2,
    /// Intermediate columnar collections.
    ColumnData = 3,
    /// Catalog and block metadata.
    Metadata = 4,
    /// Out-of-line string storage.
    OverflowStrings = 5,
    /// Raw scratch allocations routed through the buffer allocator.
    Allocator = 6,
    /// Extension-owned memory.
    Extension = 7,
}

impl MemoryTag {
    /// Number of distinct tags.
    pub const COUNT: usize = 8;

    /// All tags, in index order.
    pub const ALL: [MemoryTag; Self::COUNT] = [
        MemoryTag::BaseTable,
        MemoryTag::HashTable,
        MemoryTag::OrderBy,
        MemoryTag::ColumnData,
        MemoryTag::Metadata,
        MemoryTag::OverflowStrings,
        MemoryTag::Allocator,
        MemoryTag::Extension,
    ];

    /// Dense index for counter arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human-readable name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTag::BaseTable => "BASE_TABLE",
            MemoryTag::HashTable => "HASH_TABLE",
            MemoryTag::OrderBy => "ORDER_BY",
            MemoryTag::ColumnData => "COLUMN_DATA",
            MemoryTag::Metadata => "METADATA",
            MemoryTag::OverflowStrings => "OVERFLOW_STRINGS",
            MemoryTag::Allocator => "ALLOCATOR",
            MemoryTag::Extension => "EXTENSION",
        }
    }
}

impl fmt::Display for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_covers_every_index() {
        assert_eq!(MemoryTag::ALL.len(), MemoryTag::COUNT);
        for (i, tag) in MemoryTag::ALL.iter().enumerate() {
            assert_eq!(tag.index(), i);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MemoryTag::OrderBy), "ORDER_BY");
        assert_eq!(MemoryTag::BaseTable.as_str(), "BASE_TABLE");
    }
}
