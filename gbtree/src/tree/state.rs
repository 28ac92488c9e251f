//! Tree state pages.
//!
//! The root pointer and generation counters are stored twice, in state pages
//! A and B. A checkpoint always writes the slot that does not hold the
//! selected state, so a crash at any point leaves the previous state intact.

use crate::storage::{Page, PageError, PageHeader, PageId, PageType};
use crate::tree::generation::{Generation, Generations};

/// Page id of state slot A.
pub const STATE_PAGE_A: PageId = 1;

/// Page id of state slot B.
pub const STATE_PAGE_B: PageId = 2;

/// First page id available to nodes and free-list pages.
pub const FIRST_DATA_PAGE: PageId = 3;

mod offsets {
    use crate::storage::PageHeader;

    pub const STABLE: usize = PageHeader::SIZE;
    pub const UNSTABLE: usize = STABLE + 8;
    pub const ROOT_ID: usize = UNSTABLE + 8;
    pub const ROOT_GENERATION: usize = ROOT_ID + 8;
    pub const LAST_ID: usize = ROOT_GENERATION + 8;
    pub const FREE_LIST_HEAD: usize = LAST_ID + 8;
    pub const CLEAN: usize = FREE_LIST_HEAD + 8;
}

/// One of the two state slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSlot {
    A,
    B,
}

impl StateSlot {
    /// Page holding this slot.
    #[must_use]
    pub const fn page_id(self) -> PageId {
        match self {
            Self::A => STATE_PAGE_A,
            Self::B => STATE_PAGE_B,
        }
    }

    /// The slot a checkpoint writes next.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Durable description of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub generations: Generations,
    pub root_id: PageId,
    pub root_generation: Generation,
    /// One past the highest page id ever allocated.
    pub last_id: PageId,
    /// First page of the persisted free list, `0` if none.
    pub free_list_head: PageId,
    /// True only when written by an orderly close.
    pub clean: bool,
}

impl TreeState {
    /// Serialize into a page.
    pub fn write_to(&self, page: &mut Page) {
        page.clear();
        let header = PageHeader {
            page_type: PageType::TreeState,
            flags: 0,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
        page.write_u64(offsets::STABLE, self.generations.stable);
        page.write_u64(offsets::UNSTABLE, self.generations.unstable);
        page.write_u64(offsets::ROOT_ID, self.root_id);
        page.write_u64(offsets::ROOT_GENERATION, self.root_generation);
        page.write_u64(offsets::LAST_ID, self.last_id);
        page.write_u64(offsets::FREE_LIST_HEAD, self.free_list_head);
        page.write_u8(offsets::CLEAN, u8::from(self.clean));
        page.update_checksum();
    }

    /// Deserialize and validate a state page.
    pub fn from_page(page: &Page) -> Result<Self, StateError> {
        if page.is_zeroed() {
            return Err(StateError::Empty);
        }
        page.verify_checksum().map_err(StateError::Page)?;
        let header = PageHeader::read(page).map_err(StateError::Page)?;
        if header.page_type != PageType::TreeState {
            return Err(StateError::Page(PageError::InvalidPageType(
                header.page_type as u8,
            )));
        }

        let generations = Generations::new(
            page.read_u64(offsets::STABLE),
            page.read_u64(offsets::UNSTABLE),
        );
        if generations.stable == 0 || generations.unstable <= generations.stable {
            return Err(StateError::InvalidGenerations(generations));
        }

        let root_id = page.read_u64(offsets::ROOT_ID);
        let last_id = page.read_u64(offsets::LAST_ID);
        if root_id < FIRST_DATA_PAGE || root_id >= last_id {
            return Err(StateError::InvalidRoot { root_id, last_id });
        }

        Ok(Self {
            generations,
            root_id,
            root_generation: page.read_u64(offsets::ROOT_GENERATION),
            last_id,
            free_list_head: page.read_u64(offsets::FREE_LIST_HEAD),
            clean: page.read_u8(offsets::CLEAN) != 0,
        })
    }
}

/// The state chosen at open and the slot it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedState {
    pub state: TreeState,
    pub slot: StateSlot,
}

/// Pick the newest valid state out of the two state page snapshots.
///
/// The newest is the one with the higher (stable, unstable) pair. On a tie the
/// unclean copy wins, since a session writes its unclean marker on top of the
/// clean state it opened.
pub fn select_newest_valid_state(a: &Page, b: &Page) -> Result<SelectedState, StateError> {
    match (TreeState::from_page(a), TreeState::from_page(b)) {
        (Ok(state_a), Ok(state_b)) => {
            let slot = match state_a.generations.cmp(&state_b.generations) {
                std::cmp::Ordering::Greater => StateSlot::A,
                std::cmp::Ordering::Less => StateSlot::B,
                std::cmp::Ordering::Equal if state_b.clean && !state_a.clean => StateSlot::A,
                std::cmp::Ordering::Equal if state_a.clean && !state_b.clean => StateSlot::B,
                std::cmp::Ordering::Equal => StateSlot::A,
            };
            let state = if slot == StateSlot::A { state_a } else { state_b };
            Ok(SelectedState { state, slot })
        }
        (Ok(state), Err(_)) => Ok(SelectedState {
            state,
            slot: StateSlot::A,
        }),
        (Err(_), Ok(state)) => Ok(SelectedState {
            state,
            slot: StateSlot::B,
        }),
        (Err(a), Err(b)) => Err(StateError::Unreadable {
            a: Box::new(a),
            b: Box::new(b),
        }),
    }
}

/// Errors from reading tree state pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The slot was never written.
    Empty,
    /// Header or checksum problem.
    Page(PageError),
    /// The generation pair is impossible.
    InvalidGenerations(Generations),
    /// The root pointer lies outside the allocated pages.
    InvalidRoot { root_id: PageId, last_id: PageId },
    /// Neither slot holds a valid state.
    Unreadable {
        a: Box<StateError>,
        b: Box<StateError>,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "state page is empty"),
            Self::Page(e) => write!(f, "invalid state page: {e}"),
            Self::InvalidGenerations(g) => write!(
                f,
                "invalid generations: stable {}, unstable {}",
                g.stable, g.unstable
            ),
            Self::InvalidRoot { root_id, last_id } => {
                write!(f, "root {root_id} outside allocated pages (last id {last_id})")
            }
            Self::Unreadable { a, b } => {
                write!(f, "no valid tree state: slot A: {a}; slot B: {b}")
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}
