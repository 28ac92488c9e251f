//! Generation-safe pointer pairs.
//!
//! Child pointers and leaf successor pointers are stored as two slots, each
//! `{generation, page id, crc32}`. A writer updating a pointer of a stable
//! node only overwrites the slot that does not carry the stable value, so the
//! durable tree stays intact if the session crashes, and a torn write of the
//! slot is caught by its own checksum.
//!
//! Slot layout (20 bytes): generation u64, page id u64, crc32 of the first 16
//! bytes.

use crate::storage::{Page, PageId};
use crate::tree::generation::{Generation, Generations};

/// Page id meaning "no page". Page 0 is the meta page and is never a node.
pub const NO_PAGE: PageId = 0;

/// Size of one pointer slot in bytes.
pub const SLOT_SIZE: usize = 20;

/// Size of a pointer pair in bytes.
pub const PAIR_SIZE: usize = 2 * SLOT_SIZE;

/// A resolved pointer: the target page and the generation the pointer was
/// written in. A target whose own generation is newer than the pointer has
/// been reused since the pointer was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreePointer {
    pub page_id: PageId,
    pub generation: Generation,
}

/// Why a pointer pair could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerError {
    /// Non-empty slots exist but none is valid.
    Corrupt,
    /// Only slots newer than the caller's generations exist; the caller must
    /// refresh its generations.
    Newer,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: Generation,
    page_id: PageId,
    checksum: u32,
}

impl Slot {
    fn read(page: &Page, offset: usize) -> Self {
        Self {
            generation: page.read_u64(offset),
            page_id: page.read_u64(offset + 8),
            checksum: page.read_u32(offset + 16),
        }
    }

    fn write(page: &mut Page, offset: usize, generation: Generation, page_id: PageId) {
        page.write_u64(offset, generation);
        page.write_u64(offset + 8, page_id);
        page.write_u32(offset + 16, slot_checksum(generation, page_id));
    }

    const fn is_empty(&self) -> bool {
        self.generation == 0 && self.page_id == 0 && self.checksum == 0
    }

    fn checksum_ok(&self) -> bool {
        self.checksum == slot_checksum(self.generation, self.page_id)
    }
}

fn slot_checksum(generation: Generation, page_id: PageId) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&generation.to_le_bytes());
    hasher.update(&page_id.to_le_bytes());
    hasher.finalize()
}

/// Resolve the pointer pair at `offset`.
///
/// Returns `Ok(None)` when the pair holds no pointer (never written, only
/// crashed slots, or an explicit `NO_PAGE`).
pub fn read_pointer(
    page: &Page,
    offset: usize,
    generations: Generations,
) -> Result<Option<TreePointer>, PointerError> {
    let mut best: Option<Slot> = None;
    let mut saw_corrupt = false;
    let mut saw_newer = false;

    for slot in [Slot::read(page, offset), Slot::read(page, offset + SLOT_SIZE)] {
        if slot.is_empty() || generations.is_crashed(slot.generation) {
            continue;
        }
        if !slot.checksum_ok() || slot.generation == 0 {
            saw_corrupt = true;
            continue;
        }
        if slot.generation > generations.unstable {
            saw_newer = true;
            continue;
        }
        if best.is_none_or(|b| slot.generation > b.generation) {
            best = Some(slot);
        }
    }

    match best {
        Some(slot) if slot.page_id == NO_PAGE => Ok(None),
        Some(slot) => Ok(Some(TreePointer {
            page_id: slot.page_id,
            generation: slot.generation,
        })),
        None if saw_newer => Err(PointerError::Newer),
        None if saw_corrupt => Err(PointerError::Corrupt),
        None => Ok(None),
    }
}

/// Initialize a pointer pair of a node being written from scratch.
pub fn init_pointer(page: &mut Page, offset: usize, target: PageId, generation: Generation) {
    Slot::write(page, offset, generation, target);
    page.write_bytes(offset + SLOT_SIZE, &[0u8; SLOT_SIZE]);
}

/// Point the pair at `offset` to `target` in the unstable generation.
///
/// A slot already written in the unstable generation is overwritten;
/// otherwise the slot holding the newest stable value is preserved and the
/// other one is replaced.
pub fn write_pointer(page: &mut Page, offset: usize, target: PageId, generations: Generations) {
    let slots = [Slot::read(page, offset), Slot::read(page, offset + SLOT_SIZE)];
    let usable = |slot: &Slot| !slot.is_empty() && slot.checksum_ok();

    let index = if let Some(i) = slots
        .iter()
        .position(|s| usable(s) && s.generation == generations.unstable)
    {
        i
    } else {
        let stable_of = |slot: &Slot| {
            (usable(slot) && generations.is_stable(slot.generation)).then_some(slot.generation)
        };
        match (stable_of(&slots[0]), stable_of(&slots[1])) {
            (Some(a), Some(b)) => usize::from(a > b),
            (Some(_), None) => 1,
            _ => 0,
        }
    };

    Slot::write(page, offset + index * SLOT_SIZE, generations.unstable, target);
}

fn is_dead(slot: &Slot, generations: Generations) -> bool {
    !slot.is_empty() && (generations.is_crashed(slot.generation) || !slot.checksum_ok())
}

/// True if the pair at `offset` holds a slot written by a crashed session or
/// a torn slot.
#[must_use]
pub fn has_crashed_slots(page: &Page, offset: usize, generations: Generations) -> bool {
    [offset, offset + SLOT_SIZE]
        .into_iter()
        .any(|slot_offset| is_dead(&Slot::read(page, slot_offset), generations))
}

/// Zero the slots of the pair at `offset` that were written by a crashed
/// session or torn. Returns the number of slots cleaned.
pub fn clean_crashed_slots(page: &mut Page, offset: usize, generations: Generations) -> usize {
    let mut cleaned = 0;
    for slot_offset in [offset, offset + SLOT_SIZE] {
        if is_dead(&Slot::read(page, slot_offset), generations) {
            page.write_bytes(slot_offset, &[0u8; SLOT_SIZE]);
            cleaned += 1;
        }
    }
    cleaned
}
