//! On-segment layout of the shared ring.
//!
//! The segment is a single mapping laid out as
//!
//! ```text
//! [ RingHeader | BufferMeta[0..N) | payload[0..N) ]
//! ```
//!
//! with every payload exactly `buffer_size` bytes. The layout is fixed
//! and unversioned; handles built against incompatible parameters must
//! refuse to attach. All fields mutated after the ready marker is
//! published are lock-free atomic scalars, so cross-process access is
//! well-defined; the configuration fields are written only by the
//! Creator before the marker's release store and read only after its
//! acquire load.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicI16, AtomicU16, AtomicU32, AtomicU64, Ordering};

/// Marker published last by the Creator once the segment is usable.
pub(crate) const READY_MAGIC: u32 = 0xCAFE_1111;

/// Owner value of a slot no handle currently owns.
pub(crate) const UNOWNED: i16 = -1;

/// Per-slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BufferState {
    /// No data; claimable by writers.
    Empty = 0,
    /// A writer owns the slot and is filling it.
    Writing = 1,
    /// Data is complete and available to readers.
    Full = 2,
    /// A reader owns the slot and is draining it.
    Reading = 3,
}

impl BufferState {
    pub(crate) fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Writing,
            2 => Self::Full,
            3 => Self::Reading,
            _ => Self::Empty,
        }
    }

    /// Human-readable state name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Empty => "Empty",
            Self::Writing => "Writing",
            Self::Full => "Full",
            Self::Reading => "Reading",
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Segment header, at offset zero of the mapping.
#[repr(C)]
pub(crate) struct RingHeader {
    /// Next manager id handed to an attacher. The Creator takes id 0
    /// and initializes this to 1.
    pub next_id: AtomicU64,
    /// Last sequence id assigned to a buffer entering `Writing`.
    pub next_sequence_id: AtomicU64,
    /// Hint index where readers start scanning. Not a strict cursor.
    pub reader_pos: AtomicU32,
    /// Hint index where writers start scanning. Not a strict cursor.
    pub writer_pos: AtomicU32,
    /// Smallest sequence id any destructive reader has consumed up to.
    /// Never decreases.
    pub lowest_seq_id_read: AtomicU64,
    /// Number of slots. Written once before the ready marker.
    pub buffer_count: u32,
    /// Payload bytes per slot. Written once before the ready marker.
    pub buffer_size: u64,
    /// Staleness threshold for reclamation; 0 disables it.
    pub buffer_timeout_us: u64,
    /// Nonzero when buffers are consumed destructively by one reader.
    pub destructive_read_mode: u8,
    /// Free-form tag identifying the writing process.
    pub rank: AtomicU16,
    /// [`READY_MAGIC`] once initialization is complete.
    pub ready_magic: AtomicU32,
}

/// Per-slot metadata, stored as an array right after the header.
#[repr(C)]
pub(crate) struct BufferMeta {
    /// Stamped when the slot transitions to `Writing`.
    pub sequence_id: AtomicU64,
    /// Bytes written so far; never exceeds `buffer_size`.
    pub write_pos: AtomicU64,
    /// Bytes read so far; never exceeds `write_pos`.
    pub read_pos: AtomicU64,
    /// Raw [`BufferState`].
    pub state: AtomicU16,
    /// Manager id of the owning handle, or [`UNOWNED`].
    pub owner_id: AtomicI16,
    /// Wall-clock microseconds of the owner's last touch.
    pub last_touch_us: AtomicU64,
}

impl BufferMeta {
    pub(crate) fn state(&self) -> BufferState {
        BufferState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Total segment size for a ring of `count` buffers of `size` bytes.
pub(crate) fn segment_size(count: usize, size: usize) -> usize {
    mem::size_of::<RingHeader>() + count * (mem::size_of::<BufferMeta>() + size)
}

/// Byte offset of slot `index`'s metadata.
pub(crate) fn meta_offset(index: usize) -> usize {
    mem::size_of::<RingHeader>() + index * mem::size_of::<BufferMeta>()
}

/// Byte offset of slot `index`'s payload.
pub(crate) fn payload_offset(count: usize, size: usize, index: usize) -> usize {
    mem::size_of::<RingHeader>() + count * mem::size_of::<BufferMeta>() + index * size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_meta_are_word_aligned() {
        assert_eq!(mem::align_of::<RingHeader>(), 8);
        assert_eq!(mem::align_of::<BufferMeta>(), 8);
        assert_eq!(mem::size_of::<RingHeader>() % 8, 0);
        assert_eq!(mem::size_of::<BufferMeta>() % 8, 0);
    }

    #[test]
    fn offsets_tile_the_segment() {
        let count = 4;
        let size = 64;
        assert_eq!(meta_offset(0), mem::size_of::<RingHeader>());
        assert_eq!(
            meta_offset(3) + mem::size_of::<BufferMeta>(),
            payload_offset(count, size, 0)
        );
        assert_eq!(
            payload_offset(count, size, count - 1) + size,
            segment_size(count, size)
        );
    }

    #[test]
    fn state_raw_round_trip() {
        for state in [
            BufferState::Empty,
            BufferState::Writing,
            BufferState::Full,
            BufferState::Reading,
        ] {
            assert_eq!(BufferState::from_raw(state as u16), state);
        }
        // Unknown values are treated as Empty rather than trusted.
        assert_eq!(BufferState::from_raw(999), BufferState::Empty);
    }

    #[test]
    fn state_names() {
        assert_eq!(BufferState::Reading.to_string(), "Reading");
        assert_eq!(BufferState::Empty.name(), "Empty");
    }
}
