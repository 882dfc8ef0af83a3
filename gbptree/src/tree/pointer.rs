//! Generation-safe pointers.
//!
//! Every inter-node pointer is stored as a pair of slots (A and B), each a
//! 12-byte `(generation u32, pointer u48, checksum u16)` triple. Writes always
//! go to the slot that is not needed as the stable fallback, so a torn write
//! or an uncheckpointed write can be discarded on recovery without losing the
//! last stable value.

// Slot sizes and pointer widths are compile-time constants.
#![allow(clippy::cast_possible_truncation)]

use crate::pagecache::{PageCursor, PageId};
use crate::tree::generation::{Generation, MIN_GENERATION};

/// Size of one slot.
pub const GSP_SIZE: usize = 12;

/// Size of a slot pair.
pub const GSPP_SIZE: usize = GSP_SIZE * 2;

/// Pointer value meaning "no node". Page 0 always holds the meta page.
pub const NO_NODE: PageId = 0;

const POINTER_MASK: u64 = (1 << 48) - 1;

mod offsets {
    pub const GENERATION: usize = 0;
    pub const POINTER: usize = 4;
    pub const CHECKSUM: usize = 10;
}

/// One decoded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub generation: u32,
    pub pointer: u64,
    pub checksum: u16,
}

impl Slot {
    fn read(cursor: &mut PageCursor, offset: usize) -> Self {
        Self {
            generation: cursor.get_u32(offset + offsets::GENERATION),
            pointer: cursor.get_u48(offset + offsets::POINTER),
            checksum: cursor.get_u16(offset + offsets::CHECKSUM),
        }
    }

    fn write(cursor: &mut PageCursor, offset: usize, generation: u32, pointer: u64) {
        cursor.put_u32(offset + offsets::GENERATION, generation);
        cursor.put_u48(offset + offsets::POINTER, pointer);
        cursor.put_u16(offset + offsets::CHECKSUM, checksum(generation, pointer));
    }

    const fn is_empty(self) -> bool {
        self.generation == 0 && self.pointer == 0 && self.checksum == 0
    }
}

/// XOR fold of the 16-bit chunks of generation and pointer.
#[must_use]
pub const fn checksum(generation: u32, pointer: u64) -> u16 {
    let mut sum = generation as u16 ^ (generation >> 16) as u16;
    sum ^= pointer as u16;
    sum ^= (pointer >> 16) as u16;
    sum ^= (pointer >> 32) as u16;
    sum
}

/// State of one slot relative to the current generation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written, or erased by the crash cleaner.
    Empty,
    /// Bad checksum or impossible generation.
    Broken,
    /// Written in an uncheckpointed generation before a crash.
    Crash,
    /// Written at or before the stable generation.
    Stable,
    /// Written in the current unstable generation.
    Unstable,
}

impl SlotState {
    fn of(slot: Slot, generation: Generation) -> Self {
        if slot.is_empty() {
            Self::Empty
        } else if checksum(slot.generation, slot.pointer) != slot.checksum
            || slot.generation < MIN_GENERATION
        {
            Self::Broken
        } else if slot.generation <= generation.stable {
            Self::Stable
        } else if slot.generation == generation.unstable {
            Self::Unstable
        } else {
            Self::Crash
        }
    }
}

/// Successfully resolved pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerRead {
    pub pointer: PageId,
    pub generation: u32,
}

impl PointerRead {
    #[must_use]
    pub const fn is_node(self) -> bool {
        self.pointer != NO_NODE
    }
}

/// A pointer pair that could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerFailure {
    pub write: bool,
    pub state_a: SlotState,
    pub state_b: SlotState,
    pub slot_a: Slot,
    pub slot_b: Slot,
    pub generation: Generation,
}

impl std::fmt::Display for PointerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GSPP {} failure: A={:?} {:?}, B={:?} {:?}, {}",
            if self.write { "write" } else { "read" },
            self.state_a,
            self.slot_a,
            self.state_b,
            self.slot_b,
            self.generation
        )
    }
}

impl std::error::Error for PointerFailure {}

/// Resolve the pointer pair at `offset`.
pub fn read(
    cursor: &mut PageCursor,
    offset: usize,
    generation: Generation,
) -> Result<PointerRead, PointerFailure> {
    use SlotState::{Empty, Stable, Unstable};

    let slot_a = Slot::read(cursor, offset);
    let slot_b = Slot::read(cursor, offset + GSP_SIZE);
    let state_a = SlotState::of(slot_a, generation);
    let state_b = SlotState::of(slot_b, generation);

    let chosen = match (state_a, state_b) {
        (Unstable, Stable | Empty) => Some(slot_a),
        (Stable | Empty, Unstable) => Some(slot_b),
        (Stable, Stable) => Some(if slot_b.generation > slot_a.generation {
            slot_b
        } else {
            slot_a
        }),
        (Stable, _) => Some(slot_a),
        (_, Stable) => Some(slot_b),
        _ => None,
    };

    chosen
        .map(|slot| PointerRead {
            pointer: slot.pointer,
            generation: slot.generation,
        })
        .ok_or_else(|| PointerFailure {
            write: false,
            state_a,
            state_b,
            slot_a,
            slot_b,
            generation,
        })
}

/// Write `pointer` into the pair at `offset` with the unstable generation.
pub fn write(
    cursor: &mut PageCursor,
    offset: usize,
    pointer: PageId,
    generation: Generation,
) -> Result<(), PointerFailure> {
    use SlotState::{Empty, Stable, Unstable};

    let slot_a = Slot::read(cursor, offset);
    let slot_b = Slot::read(cursor, offset + GSP_SIZE);
    let state_a = SlotState::of(slot_a, generation);
    let state_b = SlotState::of(slot_b, generation);

    let write_a = match (state_a, state_b) {
        (Stable, Stable) => Some(slot_a.generation < slot_b.generation),
        (Stable, _) => Some(false),
        (_, Stable) | (Unstable, _) => Some(true),
        (_, Unstable) => Some(false),
        (Empty, Empty) => Some(true),
        _ => None,
    };

    let Some(write_a) = write_a else {
        return Err(PointerFailure {
            write: true,
            state_a,
            state_b,
            slot_a,
            slot_b,
            generation,
        });
    };
    let slot_offset = if write_a { offset } else { offset + GSP_SIZE };
    Slot::write(cursor, slot_offset, generation.unstable, pointer & POINTER_MASK);
    Ok(())
}

/// Write `pointer` into slot A and zero slot B, ignoring what was there.
///
/// Only valid on pages that are not yet reachable, such as a node being
/// initialized.
pub fn initialize(cursor: &mut PageCursor, offset: usize, pointer: PageId, generation: u32) {
    Slot::write(cursor, offset, generation, pointer & POINTER_MASK);
    cursor.zero(offset + GSP_SIZE, GSP_SIZE);
}

/// Zero every slot of the pair whose generation lies in the crash gap.
///
/// Returns the number of slots cleaned.
pub fn clean_crashed(cursor: &mut PageCursor, offset: usize, generation: Generation) -> usize {
    let mut cleaned = 0;
    for slot_offset in [offset, offset + GSP_SIZE] {
        let slot = Slot::read(cursor, slot_offset);
        if !slot.is_empty() && generation.is_crash_generation(slot.generation) {
            cursor.zero(slot_offset, GSP_SIZE);
            cleaned += 1;
        }
    }
    cleaned
}

/// Whether any slot of the pair carries a crash-gap generation.
pub fn has_crashed_slot(cursor: &mut PageCursor, offset: usize, generation: Generation) -> bool {
    [offset, offset + GSP_SIZE].into_iter().any(|slot_offset| {
        let slot = Slot::read(cursor, slot_offset);
        !slot.is_empty() && generation.is_crash_generation(slot.generation)
    })
}
