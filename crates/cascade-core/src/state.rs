//! Lifecycle states of groups and group expressions.
//!
//! A state is stored together with the memo epoch it was reached in. Starting a new
//! search stage bumps the epoch, so every group reads as `Unexplored` again while the
//! stored value itself only ever grows. `advance` is a `fetch_max`, which makes states
//! monotonic under any interleaving.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shared lifecycle of groups and group expressions, in advancement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SearchState {
    Unexplored = 0,
    Exploring = 1,
    Explored = 2,
    Implementing = 3,
    Implemented = 4,
    Optimizing = 5,
    Optimized = 6,
}

impl SearchState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => SearchState::Exploring,
            2 => SearchState::Explored,
            3 => SearchState::Implementing,
            4 => SearchState::Implemented,
            5 => SearchState::Optimizing,
            6 => SearchState::Optimized,
            _ => SearchState::Unexplored,
        }
    }

    pub fn is_explored(self) -> bool {
        self >= SearchState::Explored
    }

    pub fn is_implemented(self) -> bool {
        self >= SearchState::Implemented
    }

    pub fn is_optimized(self) -> bool {
        self >= SearchState::Optimized
    }
}

impl fmt::Display for SearchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u32 = (1 << STATE_BITS) - 1;

/// Epoch-tagged monotonic state.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU32);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn pack(epoch: u32, state: SearchState) -> u32 {
        (epoch << STATE_BITS) | state as u32
    }

    /// State as seen from `epoch`; anything recorded in an earlier epoch is `Unexplored`.
    pub fn get(&self, epoch: u32) -> SearchState {
        let packed = self.0.load(Ordering::Acquire);
        if packed >> STATE_BITS < epoch {
            SearchState::Unexplored
        } else {
            SearchState::from_bits(packed & STATE_MASK)
        }
    }

    /// Move to `state` in `epoch`. Returns false if the cell was already at or past it.
    pub fn advance(&self, epoch: u32, state: SearchState) -> bool {
        let target = Self::pack(epoch, state);
        self.0.fetch_max(target, Ordering::AcqRel) < target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_never_regress() {
        let cell = StateCell::new();
        assert!(cell.advance(0, SearchState::Explored));
        assert!(!cell.advance(0, SearchState::Exploring));
        assert_eq!(cell.get(0), SearchState::Explored);
    }

    #[test]
    fn test_new_epoch_reads_unexplored() {
        let cell = StateCell::new();
        cell.advance(0, SearchState::Optimized);
        assert_eq!(cell.get(1), SearchState::Unexplored);
        assert!(cell.advance(1, SearchState::Exploring));
        assert_eq!(cell.get(1), SearchState::Exploring);
        // an older epoch can never overwrite a newer one
        assert!(!cell.advance(0, SearchState::Optimized));
    }
}
